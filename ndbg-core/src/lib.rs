//! ndbg デバッガのコア機能
//!
//! このクレートは、デバッガの中核となるロジックを提供します。
//! デバッグチャネルのイベントを1つの制御スレッドで処理し、
//! プロセス・スレッド・モジュールの管理、ブレークポイント、ステップ実行、
//! コールスタックと変数の確認を [`Debugger`] としてまとめます。

pub mod debugger;
pub mod breakpoint;
pub mod callstack;
pub mod command;
pub mod config;
pub mod errors;
pub mod events;
pub mod registry;
pub mod stepping;
pub mod value;

mod dispatcher;
mod session;

pub use debugger::Debugger;
pub use breakpoint::{Breakpoint, BreakpointId, BreakpointLocation};
pub use callstack::StackFrame;
pub use command::{Command, InfoTarget};
pub use config::{DebuggerConfig, MarshalMode};
pub use errors::DebuggerError;
pub use events::{DebuggerEvent, EventHandler, PausedReason};
pub use registry::{ModuleInfo, ProcessInfo, ThreadInfo};
pub use stepping::StepKind;
pub use value::{ArrayValue, ObjectValue, Primitive, Value, Variable};

// 他のクレートから使用するために再エクスポート
pub use ndbg_symbols::{SourceSegment, ValueType};
pub use ndbg_target::ThreadId;

/// デバッガの結果型
pub type Result<T> = std::result::Result<T, DebuggerError>;
