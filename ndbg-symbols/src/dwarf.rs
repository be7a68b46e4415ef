//! DWARFによるシンボルプロバイダ

use crate::functions::collect_functions;
use crate::{
    DwarfLoader, FrameBase, FunctionIndex, FunctionInfo, LineRange, LineTable, ModuleSymbols,
    Result, SymbolProvider, SymbolResolver,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// 1モジュール分のシンボル情報
pub struct DwarfModule {
    lines: LineTable,
    functions: FunctionIndex,
    symbols: SymbolResolver,
}

impl DwarfModule {
    pub fn new(loader: &DwarfLoader) -> Result<Self> {
        let lines = LineTable::from_dwarf(loader)?;
        let mut functions = collect_functions(loader)?;
        for func in &mut functions {
            func.has_line_info = lines.has_rows_in(func.low, func.high);
        }
        let symbols = SymbolResolver::new(loader)?;

        tracing::debug!(
            "Loaded {} statements, {} functions, {} symbols",
            lines.len(),
            functions.len(),
            symbols.all_symbols().count()
        );

        Ok(Self {
            lines,
            functions: FunctionIndex::from_functions(functions),
            symbols,
        })
    }

    /// DWARFの無いモジュール用。ELFシンボルで関数名だけを引ける
    pub fn symbols_only(loader: &DwarfLoader) -> Result<Self> {
        Ok(Self {
            lines: LineTable::default(),
            functions: FunctionIndex::default(),
            symbols: SymbolResolver::new(loader)?,
        })
    }

    pub fn lines(&self) -> &LineTable {
        &self.lines
    }

    pub fn functions(&self) -> &FunctionIndex {
        &self.functions
    }
}

impl ModuleSymbols for DwarfModule {
    fn resolve_line(&self, file: &str, line: u32) -> Option<LineRange> {
        self.lines.resolve(file, line).cloned()
    }

    fn line_at(&self, offset: u64) -> Option<LineRange> {
        self.lines.lookup(offset).cloned()
    }

    fn function_at(&self, offset: u64) -> Option<Arc<FunctionInfo>> {
        if let Some(func) = self.functions.at(offset) {
            return Some(func);
        }

        // DWARFに無い関数はELFシンボルで名前だけ付ける
        let sym = self.symbols.reverse_resolve(offset)?;
        let high = if sym.size == 0 {
            offset.saturating_add(1)
        } else {
            sym.offset.saturating_add(sym.size)
        };
        Some(Arc::new(FunctionInfo {
            name: sym.display_name().to_string(),
            low: sym.offset,
            high,
            frame_base: FrameBase::FramePointer,
            has_line_info: false,
            arguments: Vec::new(),
            locals: Vec::new(),
        }))
    }

    fn function_by_name(&self, name: &str) -> Option<Arc<FunctionInfo>> {
        self.functions.by_name(name)
    }
}

/// ELF/DWARFファイルからシンボルを読み込むプロバイダ
///
/// 読み込んだモジュールはパスごとにキャッシュします。
#[derive(Default)]
pub struct DwarfSymbolProvider {
    cache: Mutex<HashMap<PathBuf, Option<Arc<DwarfModule>>>>,
}

impl DwarfSymbolProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SymbolProvider for DwarfSymbolProvider {
    fn load(&self, module: &Path) -> Result<Option<Arc<dyn ModuleSymbols>>> {
        let mut cache = self.cache.lock();
        if let Some(cached) = cache.get(module) {
            return Ok(cached.clone().map(|m| m as Arc<dyn ModuleSymbols>));
        }

        let loader = DwarfLoader::load(module)?;
        let loaded = if loader.has_debug_info() {
            tracing::info!("Loading symbols for {:?}", module);
            Some(Arc::new(DwarfModule::new(&loader)?))
        } else {
            let symbols_only = DwarfModule::symbols_only(&loader)?;
            if symbols_only.symbols.is_empty() {
                tracing::debug!("No symbols in {:?}", module);
                None
            } else {
                tracing::debug!("No debug info in {:?}, using ELF symbols", module);
                Some(Arc::new(symbols_only))
            }
        };

        cache.insert(module.to_path_buf(), loaded.clone());
        Ok(loaded.map(|m| m as Arc<dyn ModuleSymbols>))
    }
}
