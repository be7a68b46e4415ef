//! シンボルプロバイダのインターフェース
//!
//! エンジンはシンボルファイルの形式を知りません。
//! モジュールのパスを渡して [`ModuleSymbols`] を受け取り、以降はモジュール相対オフセットで問い合わせます。

use crate::{Result, VariableLocation};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// ソースコード上の区間
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSegment {
    pub file: String,
    pub start_line: u32,
    pub end_line: u32,
    pub start_column: Option<u32>,
}

impl SourceSegment {
    /// 1行だけの区間を作成する
    pub fn line(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            start_line: line,
            end_line: line,
            start_column: None,
        }
    }
}

impl fmt::Display for SourceSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start_line == self.end_line {
            write!(f, "{}:{}", self.file, self.start_line)
        } else {
            write!(f, "{}:{}-{}", self.file, self.start_line, self.end_line)
        }
    }
}

/// 1ステートメント分のコード範囲
///
/// `start..end` はモジュール相対オフセットです。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineRange {
    pub start: u64,
    pub end: u64,
    pub segment: SourceSegment,
}

impl LineRange {
    /// オフセットがこの範囲に含まれるか
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.end
    }
}

/// 変数のフレームオフセットが何を基準にしているか
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameBase {
    /// フレームポインタ（RBP）
    FramePointer,
    /// スタックポインタ（RSP）
    StackPointer,
    /// Canonical Frame Address
    Cfa,
}

/// 変数の型（値の読み取りに必要な分だけ）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueType {
    Int { size: u8, signed: bool },
    Float { size: u8 },
    Bool,
    Char,
    /// ポインタ + 長さの文字列
    Str,
    /// ポインタ + 長さの配列
    Slice(Box<ValueType>),
    /// 参照先を持つポインタ（0 は null）
    Pointer(String),
    Unknown { name: String, size: u64 },
}

impl ValueType {
    /// フレーム上に占めるバイト数
    pub fn byte_size(&self) -> u64 {
        match self {
            ValueType::Int { size, .. } | ValueType::Float { size } => u64::from(*size),
            ValueType::Bool => 1,
            ValueType::Char => 4,
            ValueType::Str | ValueType::Slice(_) => 16,
            ValueType::Pointer(_) => 8,
            ValueType::Unknown { size, .. } => *size,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Int { size, signed } => {
                write!(f, "{}{}", if *signed { 'i' } else { 'u' }, u32::from(*size) * 8)
            }
            ValueType::Float { size } => write!(f, "f{}", u32::from(*size) * 8),
            ValueType::Bool => write!(f, "bool"),
            ValueType::Char => write!(f, "char"),
            ValueType::Str => write!(f, "&str"),
            ValueType::Slice(element) => write!(f, "&[{}]", element),
            ValueType::Pointer(name) => write!(f, "{}", name),
            ValueType::Unknown { name, .. } => write!(f, "{}", name),
        }
    }
}

/// 引数またはローカル変数のメタデータ
#[derive(Debug, Clone, PartialEq)]
pub struct VariableInfo {
    pub name: String,
    pub ty: ValueType,
    pub location: VariableLocation,
}

/// 関数のメタデータ
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionInfo {
    pub name: String,
    /// 開始オフセット（モジュール相対）
    pub low: u64,
    /// 終了オフセット（この値を含まない）
    pub high: u64,
    pub frame_base: FrameBase,
    /// 行情報を持つステートメントが1つでもあるか
    pub has_line_info: bool,
    /// 宣言順の引数
    pub arguments: Vec<VariableInfo>,
    /// 宣言順のローカル変数
    pub locals: Vec<VariableInfo>,
}

impl FunctionInfo {
    /// オフセットがこの関数に含まれるか
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.low && offset < self.high
    }
}

/// 1モジュール分のシンボル情報
pub trait ModuleSymbols: Send + Sync {
    /// ファイルと行からコード範囲を解決する（コードのない行は None）
    fn resolve_line(&self, file: &str, line: u32) -> Option<LineRange>;

    /// オフセットを含むステートメントを返す（行情報がなければ None）
    fn line_at(&self, offset: u64) -> Option<LineRange>;

    /// オフセットを含む関数を返す
    fn function_at(&self, offset: u64) -> Option<Arc<FunctionInfo>>;

    /// 名前から関数を検索する
    fn function_by_name(&self, name: &str) -> Option<Arc<FunctionInfo>>;
}

/// モジュールのパスからシンボル情報を読み込む
pub trait SymbolProvider: Send + Sync {
    /// シンボルが無い場合は `Ok(None)` を返す
    fn load(&self, module: &Path) -> Result<Option<Arc<dyn ModuleSymbols>>>;
}
