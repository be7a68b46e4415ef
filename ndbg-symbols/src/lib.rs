//! ndbg シンボル解決
//!
//! このクレートは、デバッグ対象モジュールのシンボル情報を提供します。
//! ソース行とアドレスの相互変換、関数の範囲、引数・ローカル変数のレイアウトを扱います。
//! DWARF（gimli / addr2line）による実装と、シミュレータ向けのテーブル実装があります。

pub mod provider;
pub mod loader;
pub mod symbols;
pub mod lines;
pub mod functions;
pub mod variables;
pub mod utils;
pub mod dwarf;
pub mod table;

pub use provider::{
    FrameBase, FunctionInfo, LineRange, ModuleSymbols, SourceSegment, SymbolProvider, ValueType,
    VariableInfo,
};
pub use loader::DwarfLoader;
pub use symbols::{Symbol, SymbolResolver};
pub use lines::LineTable;
pub use functions::FunctionIndex;
pub use variables::VariableLocation;
pub use utils::paths_match;
pub use dwarf::{DwarfModule, DwarfSymbolProvider};
pub use table::{ModuleTable, TableSymbolProvider};

/// シンボル解決の結果型
pub type Result<T> = anyhow::Result<T>;
