//! ブレークポイント管理
//!
//! ユーザーのブレークポイント（ファイルと行、またはアドレス）と、
//! 実際にメモリへ書き込むトラップを分けて管理します。
//! 1つのトラップを複数のブレークポイントとステップ実行が共有できるので、
//! トラップは所有者がいなくなったときだけ取り除きます。

use crate::registry::{Module, Registry};
use ndbg_symbols::SourceSegment;
use ndbg_target::{DebugChannel, Instruction, SoftwareBreakpoint};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// ブレークポイントID
pub type BreakpointId = usize;

/// ブレークポイントの指定位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakpointLocation {
    Source { file: String, line: u32 },
    Address(u64),
}

impl fmt::Display for BreakpointLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakpointLocation::Source { file, line } => write!(f, "{}:{}", file, line),
            BreakpointLocation::Address(address) => write!(f, "0x{:x}", address),
        }
    }
}

#[derive(Debug, Clone)]
struct Binding {
    address: u64,
    segment: Option<SourceSegment>,
}

#[derive(Debug)]
struct BreakpointState {
    enabled: bool,
    binding: Option<Binding>,
    hit_count: u32,
}

#[derive(Debug)]
struct BreakpointInner {
    id: BreakpointId,
    location: BreakpointLocation,
    state: Mutex<BreakpointState>,
}

/// ブレークポイントのハンドル
///
/// クローンは同じブレークポイントを指します。有効・無効の切り替えはどのスレッドからでも行え、
/// 無効なブレークポイントのトラップは残ったまま、ヒットしても停止しません。
#[derive(Debug, Clone)]
pub struct Breakpoint {
    inner: Arc<BreakpointInner>,
}

impl Breakpoint {
    fn new(id: BreakpointId, location: BreakpointLocation) -> Self {
        Self {
            inner: Arc::new(BreakpointInner {
                id,
                location,
                state: Mutex::new(BreakpointState {
                    enabled: true,
                    binding: None,
                    hit_count: 0,
                }),
            }),
        }
    }

    pub fn id(&self) -> BreakpointId {
        self.inner.id
    }

    pub fn location(&self) -> &BreakpointLocation {
        &self.inner.location
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.state.lock().enabled
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.state.lock().enabled = enabled;
    }

    pub fn enable(&self) {
        self.set_enabled(true);
    }

    pub fn disable(&self) {
        self.set_enabled(false);
    }

    /// 実アドレスが見つかりトラップが書き込まれたか
    pub fn had_been_set(&self) -> bool {
        self.inner.state.lock().binding.is_some()
    }

    /// 解決されたソース上の区間
    pub fn source_segment(&self) -> Option<SourceSegment> {
        self.inner
            .state
            .lock()
            .binding
            .as_ref()
            .and_then(|b| b.segment.clone())
    }

    /// トラップを書き込んだアドレス
    pub fn address(&self) -> Option<u64> {
        self.inner.state.lock().binding.as_ref().map(|b| b.address)
    }

    /// 有効な状態でヒットした回数
    pub fn hit_count(&self) -> u32 {
        self.inner.state.lock().hit_count
    }

    fn bind(&self, binding: Binding) {
        self.inner.state.lock().binding = Some(binding);
    }

    fn unbind(&self) {
        self.inner.state.lock().binding = None;
    }
}

impl PartialEq for Breakpoint {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Breakpoint {}

/// アドレスごとのトラップ
#[derive(Debug)]
struct Trap {
    software: SoftwareBreakpoint,
    users: BTreeSet<BreakpointId>,
    /// ステップ実行などの一時的な所有者の数
    internal: usize,
}

/// 命令のデコードのために読むバイト数（x86-64 の最大命令長は15バイト）
const CODE_WINDOW: usize = 16;

/// 書き込み済みのトラップの表
#[derive(Debug, Default)]
pub(crate) struct TrapTable {
    traps: BTreeMap<u64, Trap>,
}

impl TrapTable {
    fn acquire(&mut self, channel: &mut dyn DebugChannel, address: u64) -> anyhow::Result<&mut Trap> {
        if !self.traps.contains_key(&address) {
            let mut software = SoftwareBreakpoint::new(address);
            software.enable(channel)?;
            tracing::debug!("Trap inserted at 0x{:x}", address);
            self.traps.insert(
                address,
                Trap {
                    software,
                    users: BTreeSet::new(),
                    internal: 0,
                },
            );
        }
        self.traps
            .get_mut(&address)
            .ok_or_else(|| anyhow::anyhow!("Trap at 0x{:x} vanished", address))
    }

    fn release(&mut self, channel: &mut dyn DebugChannel, address: u64) -> anyhow::Result<()> {
        let unused = self
            .traps
            .get(&address)
            .is_some_and(|t| t.users.is_empty() && t.internal == 0);
        if unused {
            if let Some(mut trap) = self.traps.remove(&address) {
                trap.software.disable(channel)?;
                tracing::debug!("Trap removed from 0x{:x}", address);
            }
        }
        Ok(())
    }

    pub fn add_user(
        &mut self,
        channel: &mut dyn DebugChannel,
        address: u64,
        id: BreakpointId,
    ) -> anyhow::Result<()> {
        self.acquire(channel, address)?.users.insert(id);
        Ok(())
    }

    pub fn remove_user(
        &mut self,
        channel: &mut dyn DebugChannel,
        address: u64,
        id: BreakpointId,
    ) -> anyhow::Result<()> {
        if let Some(trap) = self.traps.get_mut(&address) {
            trap.users.remove(&id);
        }
        self.release(channel, address)
    }

    pub fn add_internal(&mut self, channel: &mut dyn DebugChannel, address: u64) -> anyhow::Result<()> {
        self.acquire(channel, address)?.internal += 1;
        Ok(())
    }

    pub fn remove_internal(&mut self, channel: &mut dyn DebugChannel, address: u64) -> anyhow::Result<()> {
        if let Some(trap) = self.traps.get_mut(&address) {
            trap.internal = trap.internal.saturating_sub(1);
        }
        self.release(channel, address)
    }

    pub fn contains(&self, address: u64) -> bool {
        self.traps.contains_key(&address)
    }

    fn users(&self, address: u64) -> impl Iterator<Item = BreakpointId> + '_ {
        self.traps
            .get(&address)
            .into_iter()
            .flat_map(|t| t.users.iter().copied())
    }

    /// `address` から読んだバイト列のトラップを元のバイトに戻す
    pub fn mask(&self, address: u64, bytes: &mut [u8]) {
        let end = address.saturating_add(bytes.len() as u64);
        for (&at, trap) in self.traps.range(address..end) {
            if trap.software.is_enabled() {
                bytes[(at - address) as usize] = trap.software.original_byte();
            }
        }
    }

    /// トラップを取り除いた元の命令をデコードする
    ///
    /// コード領域の末尾では読める分だけを使います。
    pub fn decode(&self, channel: &dyn DebugChannel, address: u64) -> anyhow::Result<Instruction> {
        let mut len = CODE_WINDOW;
        let mut code = loop {
            match channel.read_memory(address, len) {
                Ok(code) => break code,
                Err(_) if len > 1 => len /= 2,
                Err(e) => return Err(e),
            }
        };
        self.mask(address, &mut code);
        channel.decode(address, &code)
    }

    /// トラップを一時的に元の命令へ戻す（トラップの上から実行を再開するため）
    pub fn lift(&mut self, channel: &mut dyn DebugChannel, address: u64) -> anyhow::Result<bool> {
        match self.traps.get_mut(&address) {
            Some(trap) if trap.software.is_enabled() => {
                trap.software.disable(channel)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// [`lift`](Self::lift) したトラップを書き戻す
    pub fn restore(&mut self, channel: &mut dyn DebugChannel, address: u64) -> anyhow::Result<()> {
        if let Some(trap) = self.traps.get_mut(&address) {
            trap.software.enable(channel)?;
        }
        Ok(())
    }

    /// 範囲内のトラップを書き戻さずに忘れる（メモリが無くなったとき）
    fn forget_range(&mut self, start: u64, end: u64) {
        let addresses: Vec<u64> = self.traps.range(start..end).map(|(&a, _)| a).collect();
        for address in addresses {
            if let Some(mut trap) = self.traps.remove(&address) {
                trap.software.forget();
            }
        }
    }
}

/// ブレークポイントマネージャ
///
/// 論理的なブレークポイントとトラップを一緒に管理します。
/// 未解決のブレークポイントは、対応するモジュールがロードされたときに解決されます。
#[derive(Debug)]
pub(crate) struct BreakpointManager {
    breakpoints: BTreeMap<BreakpointId, Breakpoint>,
    next_id: BreakpointId,
    traps: TrapTable,
}

impl BreakpointManager {
    pub fn new() -> Self {
        Self {
            breakpoints: BTreeMap::new(),
            next_id: 1,
            traps: TrapTable::default(),
        }
    }

    /// ブレークポイントを登録する（解決はまだ行わない）
    pub fn add(&mut self, location: BreakpointLocation) -> Breakpoint {
        let id = self.next_id;
        self.next_id += 1;
        let breakpoint = Breakpoint::new(id, location);
        self.breakpoints.insert(id, breakpoint.clone());
        breakpoint
    }

    /// ブレークポイントを削除し、トラップの所有を手放す
    pub fn remove(
        &mut self,
        id: BreakpointId,
        channel: Option<&mut dyn DebugChannel>,
    ) -> anyhow::Result<Option<Breakpoint>> {
        let Some(breakpoint) = self.breakpoints.remove(&id) else {
            return Ok(None);
        };
        if let (Some(address), Some(channel)) = (breakpoint.address(), channel) {
            self.traps.remove_user(channel, address, id)?;
        }
        breakpoint.unbind();
        Ok(Some(breakpoint))
    }

    pub fn get(&self, id: BreakpointId) -> Option<&Breakpoint> {
        self.breakpoints.get(&id)
    }

    pub fn all(&self) -> Vec<Breakpoint> {
        self.breakpoints.values().cloned().collect()
    }

    pub fn traps(&self) -> &TrapTable {
        &self.traps
    }

    pub fn traps_mut(&mut self) -> &mut TrapTable {
        &mut self.traps
    }

    /// 未解決のブレークポイントをロード済みの全モジュールで解決する
    pub fn bind_all(&mut self, registry: &Registry, channel: &mut dyn DebugChannel) {
        for module in registry.modules() {
            self.bind_in_module(module, channel);
        }
    }

    /// 未解決のブレークポイントをこのモジュールで解決する
    ///
    /// 行にコードが無い場合やトラップを書けない場合は未解決のまま残します。
    pub fn bind_in_module(&mut self, module: &Module, channel: &mut dyn DebugChannel) {
        for breakpoint in self.breakpoints.values() {
            if breakpoint.had_been_set() {
                continue;
            }

            let binding = match breakpoint.location() {
                BreakpointLocation::Source { file, line } => {
                    module.resolve_line(file, *line).map(|range| Binding {
                        address: range.start,
                        segment: Some(range.segment),
                    })
                }
                BreakpointLocation::Address(address) if module.contains(*address) => {
                    Some(Binding {
                        address: *address,
                        segment: module.line_at(*address).map(|r| r.segment),
                    })
                }
                BreakpointLocation::Address(_) => None,
            };
            let Some(binding) = binding else {
                continue;
            };

            match self.traps.add_user(channel, binding.address, breakpoint.id()) {
                Ok(()) => {
                    tracing::debug!(
                        "Breakpoint {} ({}) bound at 0x{:x} in {}",
                        breakpoint.id(),
                        breakpoint.location(),
                        binding.address,
                        module.info.name
                    );
                    breakpoint.bind(binding);
                }
                Err(e) => tracing::warn!(
                    "Failed to set breakpoint {} at 0x{:x}: {:#}",
                    breakpoint.id(),
                    binding.address,
                    e
                ),
            }
        }
    }

    /// アンロードされたモジュールの範囲にある解決を取り消す
    pub fn unbind_range(&mut self, base: u64, size: u64) {
        let end = base.saturating_add(size);
        self.traps.forget_range(base, end);
        for breakpoint in self.breakpoints.values() {
            if breakpoint.address().is_some_and(|a| a >= base && a < end) {
                breakpoint.unbind();
            }
        }
    }

    /// プロセス終了時にすべての解決を取り消す（次の実行で解決し直す）
    pub fn clear_bindings(&mut self) {
        self.traps.forget_range(0, u64::MAX);
        for breakpoint in self.breakpoints.values() {
            breakpoint.unbind();
        }
    }

    /// ユーザーのブレークポイントがこのアドレスにあり、有効か
    pub fn enabled_at(&self, address: u64) -> bool {
        self.traps
            .users(address)
            .filter_map(|id| self.breakpoints.get(&id))
            .any(Breakpoint::is_enabled)
    }

    /// トラップのヒットを記録し、停止すべきブレークポイントを返す
    ///
    /// 無効なブレークポイントは数えずに読み飛ばします。
    pub fn hit(&mut self, address: u64) -> Option<Breakpoint> {
        let mut first = None;
        for id in self.traps.users(address) {
            let Some(breakpoint) = self.breakpoints.get(&id) else {
                continue;
            };
            let mut state = breakpoint.inner.state.lock();
            if state.enabled {
                state.hit_count += 1;
                first.get_or_insert_with(|| breakpoint.clone());
            }
        }
        first
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModuleInfo;
    use ndbg_symbols::SymbolProvider;
    use ndbg_target::{LaunchSpec, Launcher, SimFunction, SimLauncher, SimOp, SimProgram, TRAP_BYTE};
    use std::path::PathBuf;

    fn setup() -> (SimProgram, Module, Box<dyn DebugChannel>) {
        let program = SimProgram::builder("/sim/Program.exe", "Src/Program.cs")
            .function(
                SimFunction::new("Main")
                    .open(3)
                    .line(4, [SimOp::print("Mark 1\n")])
                    .line(5, [SimOp::print("Mark 2\n")])
                    .close(6),
            )
            .build()
            .unwrap();
        let symbols = program
            .symbol_provider()
            .load(program.path())
            .unwrap();
        let module = Module {
            info: ModuleInfo::new(program.path().to_path_buf(), 0x40_0000, 0x1000, true),
            symbols,
        };
        let channel = SimLauncher::new(program.clone())
            .launch(&LaunchSpec {
                executable: PathBuf::from("/sim/Program.exe"),
                working_directory: PathBuf::from("/sim"),
                arguments: Vec::new(),
            })
            .unwrap();
        (program, module, channel)
    }

    #[test]
    fn test_bind_on_module_load() {
        let (_program, module, mut channel) = setup();
        let mut manager = BreakpointManager::new();
        let bp = manager.add(BreakpointLocation::Source {
            file: "Program.cs".to_string(),
            line: 5,
        });
        let missing = manager.add(BreakpointLocation::Source {
            file: "Program.cs".to_string(),
            line: 42,
        });
        assert!(!bp.had_been_set());

        manager.bind_in_module(&module, channel.as_mut());
        assert!(bp.had_been_set());
        assert_eq!(bp.source_segment().unwrap().start_line, 5);
        assert!(!missing.had_been_set());

        let address = bp.address().unwrap();
        assert_eq!(channel.read_memory(address, 1).unwrap(), vec![TRAP_BYTE]);

        let mut code = channel.read_memory(address, 1).unwrap();
        manager.traps().mask(address, &mut code);
        assert_ne!(code[0], TRAP_BYTE);
    }

    #[test]
    fn test_shared_trap_ownership() {
        let (_program, module, mut channel) = setup();
        let mut manager = BreakpointManager::new();
        let location = BreakpointLocation::Source {
            file: "Src/Program.cs".to_string(),
            line: 4,
        };
        let first = manager.add(location.clone());
        let second = manager.add(location);
        manager.bind_in_module(&module, channel.as_mut());
        let address = first.address().unwrap();
        assert_eq!(second.address(), Some(address));

        manager.traps_mut().add_internal(channel.as_mut(), address).unwrap();
        manager.remove(first.id(), Some(channel.as_mut())).unwrap();
        manager.remove(second.id(), Some(channel.as_mut())).unwrap();
        // ステップ実行がまだ使っている
        assert!(manager.traps().contains(address));

        manager.traps_mut().remove_internal(channel.as_mut(), address).unwrap();
        assert!(!manager.traps().contains(address));
        assert_ne!(channel.read_memory(address, 1).unwrap(), vec![TRAP_BYTE]);
    }

    #[test]
    fn test_disabled_breakpoint_is_skipped() {
        let (_program, module, mut channel) = setup();
        let mut manager = BreakpointManager::new();
        let bp = manager.add(BreakpointLocation::Source {
            file: "Program.cs".to_string(),
            line: 4,
        });
        manager.bind_in_module(&module, channel.as_mut());
        let address = bp.address().unwrap();

        bp.disable();
        assert!(!manager.enabled_at(address));
        assert!(manager.hit(address).is_none());
        assert_eq!(bp.hit_count(), 0);
        assert!(bp.had_been_set());

        bp.enable();
        assert_eq!(manager.hit(address), Some(bp.clone()));
        assert_eq!(bp.hit_count(), 1);
    }

    #[test]
    fn test_address_breakpoint_and_clear() {
        let (program, module, mut channel) = setup();
        let mut manager = BreakpointManager::new();
        let main = program.function_address("Main").unwrap();
        let bp = manager.add(BreakpointLocation::Address(main));
        let outside = manager.add(BreakpointLocation::Address(0x10));
        manager.bind_in_module(&module, channel.as_mut());

        assert_eq!(bp.address(), Some(main));
        assert_eq!(bp.source_segment().unwrap().start_line, 3);
        assert!(!outside.had_been_set());

        manager.clear_bindings();
        assert!(!bp.had_been_set());
        assert!(!manager.traps().contains(main));
    }
}
