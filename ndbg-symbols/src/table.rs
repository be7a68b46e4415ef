//! メモリ上のテーブルによるシンボル情報
//!
//! ファイルを持たないデバッグ対象（シミュレータなど）向けです。

use crate::{
    FunctionIndex, FunctionInfo, LineRange, LineTable, ModuleSymbols, Result, SymbolProvider,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// 行テーブルと関数一覧をそのまま持つモジュール
#[derive(Debug, Clone, Default)]
pub struct ModuleTable {
    lines: LineTable,
    functions: FunctionIndex,
}

impl ModuleTable {
    pub fn new(lines: Vec<LineRange>, functions: Vec<FunctionInfo>) -> Self {
        let lines = LineTable::from_ranges(lines);
        let functions = functions
            .into_iter()
            .map(|mut f| {
                f.has_line_info = lines.has_rows_in(f.low, f.high);
                f
            })
            .collect();
        Self {
            lines,
            functions: FunctionIndex::from_functions(functions),
        }
    }

    pub fn lines(&self) -> &LineTable {
        &self.lines
    }

    pub fn functions(&self) -> &FunctionIndex {
        &self.functions
    }
}

impl ModuleSymbols for ModuleTable {
    fn resolve_line(&self, file: &str, line: u32) -> Option<LineRange> {
        self.lines.resolve(file, line).cloned()
    }

    fn line_at(&self, offset: u64) -> Option<LineRange> {
        self.lines.lookup(offset).cloned()
    }

    fn function_at(&self, offset: u64) -> Option<Arc<FunctionInfo>> {
        self.functions.at(offset)
    }

    fn function_by_name(&self, name: &str) -> Option<Arc<FunctionInfo>> {
        self.functions.by_name(name)
    }
}

/// 登録済みのテーブルを返すプロバイダ
#[derive(Debug, Clone, Default)]
pub struct TableSymbolProvider {
    modules: HashMap<PathBuf, Arc<ModuleTable>>,
}

impl TableSymbolProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// モジュールのシンボルを登録する
    pub fn insert(&mut self, path: impl Into<PathBuf>, table: ModuleTable) {
        self.modules.insert(path.into(), Arc::new(table));
    }

    pub fn with_module(mut self, path: impl Into<PathBuf>, table: ModuleTable) -> Self {
        self.insert(path, table);
        self
    }
}

impl SymbolProvider for TableSymbolProvider {
    fn load(&self, module: &Path) -> Result<Option<Arc<dyn ModuleSymbols>>> {
        Ok(self
            .modules
            .get(module)
            .map(|table| Arc::clone(table) as Arc<dyn ModuleSymbols>))
    }
}
