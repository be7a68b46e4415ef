//! プロセス・モジュール・スレッドの登録情報

use ndbg_symbols::{utils::file_name, FunctionInfo, LineRange, ModuleSymbols};
use ndbg_target::ThreadId;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

/// デバッグ対象プロセスの情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: i32,
    pub executable: PathBuf,
    pub working_directory: PathBuf,
    pub arguments: Vec<String>,
    pub has_exited: bool,
    pub exit_code: Option<i32>,
}

/// ロード済みモジュールの情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub path: PathBuf,
    /// パスの最後の要素
    pub name: String,
    pub base: u64,
    pub size: u64,
    pub symbols_loaded: bool,
}

/// スレッドの情報
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: ThreadId,
    /// 最後に停止したスレッドか
    pub is_current: bool,
}

/// 登録済みのモジュール（シンボル付き）
pub(crate) struct Module {
    pub info: ModuleInfo,
    pub symbols: Option<Arc<dyn ModuleSymbols>>,
}

impl Module {
    pub fn contains(&self, address: u64) -> bool {
        address >= self.info.base && address < self.info.base + self.info.size
    }

    /// アドレスの行範囲（絶対アドレスに直したもの）
    pub fn line_at(&self, address: u64) -> Option<LineRange> {
        let symbols = self.symbols.as_ref()?;
        let range = symbols.line_at(address.checked_sub(self.info.base)?)?;
        Some(self.absolute(range))
    }

    pub fn function_at(&self, address: u64) -> Option<Arc<FunctionInfo>> {
        let symbols = self.symbols.as_ref()?;
        symbols.function_at(address.checked_sub(self.info.base)?)
    }

    /// ファイルと行を絶対アドレスの範囲に解決する
    pub fn resolve_line(&self, file: &str, line: u32) -> Option<LineRange> {
        let symbols = self.symbols.as_ref()?;
        Some(self.absolute(symbols.resolve_line(file, line)?))
    }

    fn absolute(&self, range: LineRange) -> LineRange {
        LineRange {
            start: range.start + self.info.base,
            end: range.end + self.info.base,
            segment: range.segment,
        }
    }
}

/// セッションが持つ登録情報
#[derive(Default)]
pub(crate) struct Registry {
    process: Option<ProcessInfo>,
    modules: Vec<Module>,
    threads: BTreeSet<ThreadId>,
    current_thread: Option<ThreadId>,
}

impl Registry {
    /// 新しいプロセスのために登録情報を作り直す
    pub fn reset(&mut self, process: ProcessInfo) {
        *self = Registry {
            process: Some(process),
            ..Registry::default()
        };
    }

    pub fn process(&self) -> Option<&ProcessInfo> {
        self.process.as_ref()
    }

    /// プロセスの終了を記録する（モジュールとスレッドは消える）
    pub fn mark_exited(&mut self, code: Option<i32>) {
        if let Some(process) = &mut self.process {
            process.has_exited = true;
            process.exit_code = code;
        }
        self.modules.clear();
        self.threads.clear();
        self.current_thread = None;
    }

    pub fn add_module(&mut self, module: Module) -> &Module {
        self.modules.retain(|m| m.info.base != module.info.base);
        self.modules.push(module);
        &self.modules[self.modules.len() - 1]
    }

    pub fn remove_module(&mut self, base: u64) -> Option<Module> {
        let index = self.modules.iter().position(|m| m.info.base == base)?;
        Some(self.modules.remove(index))
    }

    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.modules.iter()
    }

    pub fn module_at(&self, address: u64) -> Option<&Module> {
        self.modules.iter().find(|m| m.contains(address))
    }

    /// ファイル名（またはフルパス）でモジュールを探す
    pub fn get_module(&self, name: &str) -> Option<&Module> {
        self.modules.iter().find(|m| {
            m.info.name == name || m.info.path.to_string_lossy() == name
        })
    }

    pub fn line_at(&self, address: u64) -> Option<LineRange> {
        self.module_at(address)?.line_at(address)
    }

    pub fn function_at(&self, address: u64) -> Option<Arc<FunctionInfo>> {
        self.module_at(address)?.function_at(address)
    }

    pub fn add_thread(&mut self, tid: ThreadId) {
        self.threads.insert(tid);
    }

    pub fn remove_thread(&mut self, tid: ThreadId) {
        self.threads.remove(&tid);
        if self.current_thread == Some(tid) {
            self.current_thread = None;
        }
    }

    pub fn has_thread(&self, tid: ThreadId) -> bool {
        self.threads.contains(&tid)
    }

    pub fn set_current_thread(&mut self, tid: ThreadId) {
        self.threads.insert(tid);
        self.current_thread = Some(tid);
    }

    pub fn current_thread(&self) -> Option<ThreadId> {
        self.current_thread
    }

    pub fn threads(&self) -> Vec<ThreadInfo> {
        self.threads
            .iter()
            .map(|&id| ThreadInfo {
                id,
                is_current: self.current_thread == Some(id),
            })
            .collect()
    }
}

impl ModuleInfo {
    pub(crate) fn new(path: PathBuf, base: u64, size: u64, symbols_loaded: bool) -> Self {
        let name = file_name(&path.to_string_lossy()).to_string();
        Self {
            path,
            name,
            base,
            size,
            symbols_loaded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(path: &str, base: u64) -> Module {
        Module {
            info: ModuleInfo::new(PathBuf::from(path), base, 0x1000, false),
            symbols: None,
        }
    }

    #[test]
    fn test_get_module_by_file_name() {
        let mut registry = Registry::default();
        registry.add_module(module("/sim/Program.exe", 0x40_0000));
        registry.add_module(module("/sim/System.dll", 0x7f00_0000_0000));

        assert_eq!(registry.get_module("System.dll").unwrap().info.base, 0x7f00_0000_0000);
        assert!(registry.get_module("/sim/Program.exe").is_some());
        assert!(registry.get_module("Other.dll").is_none());
        assert_eq!(
            registry.module_at(0x40_0010).unwrap().info.name,
            "Program.exe"
        );
        assert!(registry.module_at(0x40_1000).is_none());
    }

    #[test]
    fn test_threads_and_exit() {
        let mut registry = Registry::default();
        registry.reset(ProcessInfo {
            pid: 1,
            executable: PathBuf::from("/sim/Program.exe"),
            working_directory: PathBuf::from("/sim"),
            arguments: Vec::new(),
            has_exited: false,
            exit_code: None,
        });
        registry.add_thread(10);
        registry.add_thread(11);
        registry.set_current_thread(11);
        let threads = registry.threads();
        assert_eq!(threads.len(), 2);
        assert!(threads[1].is_current);

        registry.remove_thread(11);
        assert_eq!(registry.current_thread(), None);

        registry.mark_exited(Some(3));
        assert!(registry.threads().is_empty());
        assert_eq!(registry.process().unwrap().exit_code, Some(3));
    }
}
