//! デバッグセッション
//!
//! デバッグチャネルのイベントを処理し、実行状態・登録情報・ブレークポイント・ステップ実行を管理します。
//! セッションは制御スレッドからだけ操作されます（[`crate::dispatcher`] を参照）。

use crate::breakpoint::{Breakpoint, BreakpointId, BreakpointLocation, BreakpointManager};
use crate::callstack::{self, StackFrame};
use crate::registry::{Module, ModuleInfo, ProcessInfo, Registry, ThreadInfo};
use crate::stepping::{Arrival, RunTo, StepAction, StepKind, Stepper};
use crate::value::{ArrayValue, Value, ValueReader, Variable};
use crate::{DebuggerConfig, DebuggerError, DebuggerEvent, PausedReason, Result};
use ndbg_symbols::SymbolProvider;
use ndbg_target::{
    DebugChannel, DebugEvent, LaunchSpec, Launcher, ResumeMode, ThreadContext, ThreadId, TrapKind,
    TRAP_LEN,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 強制終了後に終了イベントを待つ時間
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// 実行状態
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RunState {
    NotStarted,
    Running,
    Paused {
        reason: PausedReason,
        thread: ThreadId,
    },
    /// `error` はチャネルの失敗で終わった場合のメッセージ
    Exited {
        code: Option<i32>,
        error: Option<String>,
    },
}

impl RunState {
    pub(crate) fn describe(&self) -> String {
        match self {
            RunState::NotStarted => "not started".to_string(),
            RunState::Running => "running".to_string(),
            RunState::Paused { reason, .. } => format!("paused ({:?})", reason),
            RunState::Exited { code: Some(code), .. } => format!("exited with code {}", code),
            RunState::Exited { error: Some(error), .. } => format!("faulted ({})", error),
            RunState::Exited { .. } => "exited".to_string(),
        }
    }
}

/// 待機側に公開する状態
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Status {
    pub state: RunState,
    pub generation: u64,
}

/// 標準出力の断片を行に分ける
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    partial: String,
}

impl LineBuffer {
    /// 断片を追加し、完成した行（末尾に `\n` 付き）を返す
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.partial.push_str(text);
        let mut lines = Vec::new();
        while let Some(end) = self.partial.find('\n') {
            let mut line: String = self.partial.drain(..=end).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            line.push('\n');
            lines.push(line);
        }
        lines
    }

    /// 改行で終わらなかった残りを返す
    pub fn flush(&mut self) -> Option<String> {
        (!self.partial.is_empty()).then(|| std::mem::take(&mut self.partial))
    }
}

/// デバッグセッション
pub(crate) struct Session {
    config: DebuggerConfig,
    launcher: Arc<dyn Launcher>,
    symbols: Arc<dyn SymbolProvider>,
    channel: Option<Box<dyn DebugChannel>>,
    registry: Registry,
    breakpoints: BreakpointManager,
    state: RunState,
    /// 停止と再開のたびに増える（フレームと値の有効期限）
    generation: u64,
    stepper: Option<Stepper>,
    output: LineBuffer,
    outbox: Vec<DebuggerEvent>,
}

impl Session {
    pub fn new(
        launcher: Arc<dyn Launcher>,
        symbols: Arc<dyn SymbolProvider>,
        config: DebuggerConfig,
    ) -> Self {
        Self {
            config,
            launcher,
            symbols,
            channel: None,
            registry: Registry::default(),
            breakpoints: BreakpointManager::new(),
            state: RunState::NotStarted,
            generation: 0,
            stepper: None,
            output: LineBuffer::default(),
            outbox: Vec::new(),
        }
    }

    pub fn config(&self) -> &DebuggerConfig {
        &self.config
    }

    pub fn status(&self) -> Status {
        Status {
            state: self.state.clone(),
            generation: self.generation,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }

    /// 処理中に発生したイベントを取り出す
    pub fn take_events(&mut self) -> Vec<DebuggerEvent> {
        std::mem::take(&mut self.outbox)
    }

    fn invalid(&self, operation: &'static str, expected: &'static str) -> DebuggerError {
        DebuggerError::InvalidState {
            operation,
            expected,
            actual: self.state.describe(),
        }
    }

    fn require_paused(&self, operation: &'static str) -> Result<ThreadId> {
        match self.state {
            RunState::Paused { thread, .. } => Ok(thread),
            _ => Err(self.invalid(operation, "paused")),
        }
    }

    fn channel_ref(&self) -> anyhow::Result<&dyn DebugChannel> {
        self.channel
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("No process is attached"))
    }

    fn channel_mut(&mut self) -> anyhow::Result<&mut (dyn DebugChannel + 'static)> {
        self.channel
            .as_deref_mut()
            .ok_or_else(|| anyhow::anyhow!("No process is attached"))
    }

    /// チャネルの失敗を致命的なエラーとして扱い、プロセスを終了済みにする
    fn fail(&mut self, error: anyhow::Error) -> DebuggerError {
        let message = format!("{:#}", error);
        if !matches!(self.state, RunState::Exited { .. }) {
            tracing::error!("Debug channel failed: {}", message);
            self.on_exited(None, Some(message.clone()));
        }
        DebuggerError::Channel(message)
    }

    fn guard<T>(&mut self, result: anyhow::Result<T>) -> Result<T> {
        result.map_err(|e| self.fail(e))
    }

    // ---- ライフサイクル ----

    /// デバッグ対象を起動して実行を始める
    pub fn start(&mut self, spec: LaunchSpec) -> Result<()> {
        if !matches!(self.state, RunState::NotStarted | RunState::Exited { .. }) {
            return Err(self.invalid("start", "not started or exited"));
        }

        let channel = self.launcher.launch(&spec).map_err(|e| DebuggerError::Launch {
            path: spec.executable.clone(),
            message: format!("{:#}", e),
        })?;
        tracing::info!("Started {} (pid {})", spec.executable.display(), channel.pid());

        self.registry.reset(ProcessInfo {
            pid: channel.pid(),
            executable: spec.executable,
            working_directory: spec.working_directory,
            arguments: spec.arguments,
            has_exited: false,
            exit_code: None,
        });
        self.channel = Some(channel);
        self.state = RunState::Running;
        self.stepper = None;
        self.output = LineBuffer::default();

        let result = self.run_from_entry();
        self.guard(result)
    }

    /// 起動直後の通知（スレッドとモジュール）を処理し、ブレークポイントを解決してから走らせる
    fn run_from_entry(&mut self) -> anyhow::Result<()> {
        loop {
            let event = self.channel_mut()?.poll_event(Duration::ZERO)?;
            let Some(event) = event else {
                break;
            };
            let stop = event.is_stop();
            self.handle_event(event)?;
            if stop || !self.is_running() {
                return Ok(());
            }
        }
        self.channel_mut()?.resume(ResumeMode::Continue)
    }

    /// 実行中なら次のネイティブイベントを1つ待って処理する
    pub fn pump(&mut self, timeout: Duration) {
        if !self.is_running() {
            return;
        }
        let event = match self.channel_mut().and_then(|c| c.poll_event(timeout)) {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(e) => {
                self.fail(e);
                return;
            }
        };
        if let Err(e) = self.handle_event(event) {
            self.fail(e);
        }
    }

    pub fn terminate(&mut self) -> Result<()> {
        if !matches!(self.state, RunState::Running | RunState::Paused { .. }) {
            return Err(self.invalid("terminate", "running or paused"));
        }
        tracing::info!("Terminating the debuggee");
        let result = self.channel_mut().and_then(|c| c.terminate());
        self.guard(result)?;

        let deadline = Instant::now() + TERMINATE_TIMEOUT;
        while !matches!(self.state, RunState::Exited { .. }) {
            if Instant::now() >= deadline {
                return Err(self.fail(anyhow::anyhow!("Process did not exit after being killed")));
            }
            let poll_interval = self.config.poll_interval;
            let event = match self.channel_mut().and_then(|c| c.poll_event(poll_interval)) {
                Ok(event) => event,
                Err(e) => return Err(self.fail(e)),
            };
            match event {
                Some(DebugEvent::Exited { code }) => self.on_exited(Some(code), None),
                Some(event) if event.is_stop() => {
                    tracing::debug!("Ignoring {:?} while terminating", event);
                }
                Some(event) => {
                    let result = self.handle_event(event);
                    self.guard(result)?;
                }
                None => {}
            }
        }
        Ok(())
    }

    pub fn break_execution(&mut self) -> Result<()> {
        if !self.is_running() {
            return Err(self.invalid("break_execution", "running"));
        }
        let result = self.channel_mut().and_then(|c| c.interrupt());
        self.guard(result)
    }

    // ---- 実行制御 ----

    pub fn continue_execution(&mut self) -> Result<()> {
        let thread = self.require_paused("continue_execution")?;
        let result = self.resume(thread, ResumeMode::Continue);
        self.guard(result)
    }

    pub fn step(&mut self, kind: StepKind) -> Result<()> {
        let operation = match kind {
            StepKind::Into => "step_into",
            StepKind::Over => "step_over",
            StepKind::Out => "step_out",
        };
        let thread = self.require_paused(operation)?;
        let result = self.begin_step(kind, thread);
        self.guard(result)
    }

    fn begin_step(&mut self, kind: StepKind, thread: ThreadId) -> anyhow::Result<()> {
        let context = self.channel_ref()?.context(thread)?;
        let origin = self.registry.line_at(context.pc);
        tracing::debug!(
            "Step {:?} from 0x{:x} ({})",
            kind,
            context.pc,
            origin
                .as_ref()
                .map_or_else(|| "no line".to_string(), |l| l.segment.to_string())
        );
        let cfa = callstack::canonical_frame_address(
            self.channel_ref()?,
            self.breakpoints.traps(),
            &self.registry,
            &context,
        );
        self.stepper = Some(Stepper::new(kind, thread, origin.as_ref(), cfa));
        match kind {
            StepKind::Out => self.step_out_from(thread),
            StepKind::Into | StepKind::Over => self.step_action(thread),
        }
    }

    /// 停止中のスレッドを再開する
    ///
    /// トラップの上にいる場合は、トラップを外して1命令実行してから書き戻します。
    fn resume(&mut self, thread: ThreadId, mode: ResumeMode) -> anyhow::Result<()> {
        if matches!(self.state, RunState::Paused { .. }) {
            self.generation += 1;
        }
        self.state = RunState::Running;

        let pc = self.channel_ref()?.context(thread)?.pc;
        if self.breakpoints.traps().contains(pc) {
            match self.step_over_trap(thread, pc)? {
                // 乗り越える途中で停止した（例外や終了）
                Some(event) => return self.handle_event(event),
                None if mode == ResumeMode::Step(thread) => {
                    let pc = self.channel_ref()?.context(thread)?.pc;
                    return self.on_single_step(thread, pc);
                }
                None => {}
            }
        }
        self.channel_mut()?.resume(mode)
    }

    /// トラップを外して1命令だけ実行する
    ///
    /// 途中で届いた通知は処理し、シングルステップ以外の停止はそのまま返します。
    fn step_over_trap(&mut self, thread: ThreadId, pc: u64) -> anyhow::Result<Option<DebugEvent>> {
        let poll_interval = self.config.poll_interval;
        let channel = self
            .channel
            .as_deref_mut()
            .ok_or_else(|| anyhow::anyhow!("No process is attached"))?;
        self.breakpoints.traps_mut().lift(channel, pc)?;
        channel.resume(ResumeMode::Step(thread))?;

        let mut notifications = Vec::new();
        let stop = loop {
            match channel.poll_event(poll_interval)? {
                Some(event) if event.is_stop() || matches!(event, DebugEvent::Exited { .. }) => {
                    break event;
                }
                Some(event) => notifications.push(event),
                None => {}
            }
        };
        if !matches!(stop, DebugEvent::Exited { .. }) {
            self.breakpoints.traps_mut().restore(channel, pc)?;
        }

        for event in notifications {
            self.handle_event(event)?;
        }
        match stop {
            DebugEvent::Trap {
                tid,
                kind: TrapKind::SingleStep,
                ..
            } if tid == thread => Ok(None),
            other => Ok(Some(other)),
        }
    }

    // ---- イベント処理 ----

    fn handle_event(&mut self, event: DebugEvent) -> anyhow::Result<()> {
        match event {
            DebugEvent::ThreadCreated { tid } => {
                tracing::debug!("Thread {} created", tid);
                self.registry.add_thread(tid);
            }
            DebugEvent::ThreadExited { tid } => {
                tracing::debug!("Thread {} exited", tid);
                self.registry.remove_thread(tid);
            }
            DebugEvent::ModuleLoaded { path, base, size } => self.load_module(path, base, size),
            DebugEvent::ModuleUnloaded { base } => {
                if let Some(module) = self.registry.remove_module(base) {
                    tracing::debug!("Module {} unloaded", module.info.name);
                    self.breakpoints.unbind_range(module.info.base, module.info.size);
                }
            }
            DebugEvent::Output(text) => {
                for line in self.output.push(&text) {
                    self.outbox.push(DebuggerEvent::LogMessage(line));
                }
            }
            DebugEvent::Trap { tid, pc, kind } => self.on_trap(tid, pc, kind)?,
            DebugEvent::Exception {
                tid,
                signal,
                description,
            } => {
                tracing::info!("Thread {} stopped by signal {}: {}", tid, signal, description);
                self.cancel_step()?;
                self.pause(PausedReason::Exception, tid);
            }
            DebugEvent::Exited { code } => self.on_exited(Some(code), None),
        }
        Ok(())
    }

    fn load_module(&mut self, path: std::path::PathBuf, base: u64, size: u64) {
        let symbols = match self.symbols.load(&path) {
            Ok(symbols) => symbols,
            Err(e) => {
                tracing::warn!("Failed to load symbols for {}: {:#}", path.display(), e);
                None
            }
        };
        tracing::debug!(
            "Module {} loaded at 0x{:x} (symbols: {})",
            path.display(),
            base,
            symbols.is_some()
        );

        let info = ModuleInfo::new(path, base, size, symbols.is_some());
        let module = self.registry.add_module(Module { info, symbols });
        if let Some(channel) = self.channel.as_deref_mut() {
            self.breakpoints.bind_in_module(module, channel);
        }
    }

    fn on_exited(&mut self, code: Option<i32>, error: Option<String>) {
        if let Some(rest) = self.output.flush() {
            self.outbox.push(DebuggerEvent::LogMessage(rest));
        }
        tracing::info!("Process exited (code {:?})", code);

        self.stepper = None;
        self.breakpoints.clear_bindings();
        self.registry.mark_exited(code);
        self.channel = None;
        self.generation += 1;
        self.state = RunState::Exited { code, error };
        self.outbox.push(DebuggerEvent::Exited { code });
    }

    fn pause(&mut self, reason: PausedReason, thread: ThreadId) {
        self.generation += 1;
        self.registry.set_current_thread(thread);
        self.state = RunState::Paused { reason, thread };
        tracing::debug!("Paused ({:?}) on thread {}", reason, thread);
        self.outbox.push(DebuggerEvent::Paused { reason, thread });
    }

    fn on_trap(&mut self, thread: ThreadId, pc: u64, kind: TrapKind) -> anyhow::Result<()> {
        match kind {
            TrapKind::Interrupt => {
                self.cancel_step()?;
                self.pause(PausedReason::ForcedBreak, thread);
            }
            TrapKind::Break => {
                self.cancel_step()?;
                self.pause(PausedReason::Break, thread);
            }
            TrapKind::SingleStep => self.on_single_step(thread, pc)?,
            TrapKind::Software => {
                let address = pc.wrapping_sub(TRAP_LEN);
                if self.breakpoints.traps().contains(address) {
                    // 注入したトラップなので、PC を元の命令に戻す
                    let channel = self.channel_mut()?;
                    let context = channel.context(thread)?;
                    channel.set_context(thread, &ThreadContext { pc: address, ..context })?;
                    self.on_trap_hit(thread, address)?;
                } else {
                    self.cancel_step()?;
                    self.pause(PausedReason::Break, thread);
                }
            }
        }
        Ok(())
    }

    fn on_trap_hit(&mut self, thread: ThreadId, address: u64) -> anyhow::Result<()> {
        if let Some(breakpoint) = self.breakpoints.hit(address) {
            tracing::debug!("Breakpoint {} hit at 0x{:x}", breakpoint.id(), address);
            self.cancel_step()?;
            self.pause(PausedReason::Breakpoint, thread);
            return Ok(());
        }

        let waiting = self
            .stepper
            .as_ref()
            .filter(|s| s.thread == thread)
            .and_then(|s| s.run_to)
            .filter(|r| r.address == address);
        if let Some(run_to) = waiting {
            let sp = self.channel_ref()?.context(thread)?.sp;
            if sp == run_to.sp {
                self.clear_run_to()?;
                return self.on_step_arrived(thread);
            }
            tracing::debug!("Return trap at 0x{:x} hit in another frame", address);
        }

        // 無効なブレークポイントや別フレームでの一時トラップは読み飛ばす
        self.resume(thread, ResumeMode::Continue)
    }

    fn on_single_step(&mut self, thread: ThreadId, pc: u64) -> anyhow::Result<()> {
        if self.stepper.as_ref().map_or(true, |s| s.thread != thread) {
            tracing::debug!("Unexpected single step on thread {}", thread);
            return self.resume(thread, ResumeMode::Continue);
        }

        // 到着位置の有効なブレークポイントは、実行する前にここで止まる
        if self.breakpoints.enabled_at(pc) {
            self.breakpoints.hit(pc);
            self.cancel_step()?;
            self.pause(PausedReason::Breakpoint, thread);
            return Ok(());
        }
        self.on_step_arrived(thread)
    }

    fn on_step_arrived(&mut self, thread: ThreadId) -> anyhow::Result<()> {
        let channel = self.channel_ref()?;
        let context = channel.context(thread)?;
        let cfa = callstack::canonical_frame_address(
            channel,
            self.breakpoints.traps(),
            &self.registry,
            &context,
        );
        let line = self.registry.line_at(context.pc);
        let registry = &self.registry;
        let Some(stepper) = self.stepper.as_mut() else {
            return Ok(());
        };
        let arrival = stepper.arrived(&context, cfa, line.as_ref(), || {
            registry
                .function_at(context.pc)
                .is_some_and(|f| f.has_line_info)
        });

        match arrival {
            Arrival::Complete => {
                self.stepper = None;
                self.pause(PausedReason::StepComplete, thread);
                Ok(())
            }
            Arrival::Continue => self.step_action(thread),
            Arrival::RunTo(target) => {
                tracing::debug!("Stepping out of 0x{:x}, which has no line info", context.pc);
                self.run_to(thread, target)
            }
            Arrival::StepOutAgain => self.step_out_from(thread),
        }
    }

    /// 現在位置の命令を見て1命令実行するか、呼び出しを飛ばす
    fn step_action(&mut self, thread: ThreadId) -> anyhow::Result<()> {
        let channel = self.channel_ref()?;
        let context = channel.context(thread)?;
        let insn = self.breakpoints.traps().decode(channel, context.pc)?;
        let Some(stepper) = self.stepper.as_mut() else {
            return Ok(());
        };
        match stepper.next_action(&context, &insn) {
            StepAction::SingleStep => self.resume(thread, ResumeMode::Step(thread)),
            StepAction::RunTo(target) => self.run_to(thread, target),
        }
    }

    /// 現在のフレームの戻りアドレスまで実行する（呼び出し元が無ければ continue と同じ）
    fn step_out_from(&mut self, thread: ThreadId) -> anyhow::Result<()> {
        let frames = callstack::walk(
            self.channel_ref()?,
            self.breakpoints.traps(),
            &self.registry,
            thread,
            2,
            self.generation,
        )?;
        match frames.get(1) {
            Some(caller) => self.run_to(
                thread,
                RunTo {
                    address: caller.pc,
                    sp: caller.sp,
                },
            ),
            None => {
                self.stepper = None;
                self.resume(thread, ResumeMode::Continue)
            }
        }
    }

    fn run_to(&mut self, thread: ThreadId, target: RunTo) -> anyhow::Result<()> {
        let channel = self
            .channel
            .as_deref_mut()
            .ok_or_else(|| anyhow::anyhow!("No process is attached"))?;
        self.breakpoints.traps_mut().add_internal(channel, target.address)?;
        if let Some(stepper) = self.stepper.as_mut() {
            stepper.run_to = Some(target);
        }
        self.resume(thread, ResumeMode::Continue)
    }

    /// 待ち合わせ中の一時トラップを取り除く
    fn clear_run_to(&mut self) -> anyhow::Result<()> {
        let Some(run_to) = self.stepper.as_mut().and_then(|s| s.run_to.take()) else {
            return Ok(());
        };
        if let Some(channel) = self.channel.as_deref_mut() {
            self.breakpoints
                .traps_mut()
                .remove_internal(channel, run_to.address)?;
        }
        Ok(())
    }

    fn cancel_step(&mut self) -> anyhow::Result<()> {
        self.clear_run_to()?;
        if self.stepper.take().is_some() {
            tracing::debug!("Step cancelled");
        }
        Ok(())
    }

    // ---- ブレークポイント ----

    pub fn add_breakpoint(&mut self, location: BreakpointLocation) -> Breakpoint {
        let breakpoint = self.breakpoints.add(location);
        if let Some(channel) = self.channel.as_deref_mut() {
            self.breakpoints.bind_all(&self.registry, channel);
        }
        breakpoint
    }

    pub fn remove_breakpoint(&mut self, id: BreakpointId) -> Result<()> {
        let channel = self
            .channel
            .as_deref_mut()
            .map(|c| c as &mut dyn DebugChannel);
        match self.breakpoints.remove(id, channel) {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(DebuggerError::BreakpointNotFound(id)),
            Err(e) => Err(DebuggerError::channel(e)),
        }
    }

    pub fn breakpoint(&self, id: BreakpointId) -> Option<Breakpoint> {
        self.breakpoints.get(id).cloned()
    }

    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        self.breakpoints.all()
    }

    // ---- 問い合わせ ----

    pub fn process(&self) -> Option<ProcessInfo> {
        self.registry.process().cloned()
    }

    pub fn modules(&self) -> Vec<ModuleInfo> {
        self.registry.modules().map(|m| m.info.clone()).collect()
    }

    pub fn get_module(&self, name: &str) -> Option<ModuleInfo> {
        self.registry.get_module(name).map(|m| m.info.clone())
    }

    pub fn threads(&self) -> Vec<ThreadInfo> {
        self.registry.threads()
    }

    pub fn current_thread(&self) -> Result<ThreadInfo> {
        let thread = self.require_paused("current_thread")?;
        Ok(ThreadInfo {
            id: thread,
            is_current: true,
        })
    }

    pub fn current_function(&self) -> Result<StackFrame> {
        let thread = self.require_paused("current_function")?;
        self.walk(thread, 1)?
            .into_iter()
            .next()
            .ok_or_else(|| DebuggerError::Channel("Empty call stack".to_string()))
    }

    pub fn callstack(&self, thread: ThreadId) -> Result<Vec<StackFrame>> {
        self.require_paused("callstack")?;
        if !self.registry.has_thread(thread) {
            return Err(DebuggerError::ThreadNotFound(thread));
        }
        self.walk(thread, self.config.max_frames)
    }

    fn walk(&self, thread: ThreadId, max_frames: usize) -> Result<Vec<StackFrame>> {
        let channel = self.channel_ref().map_err(DebuggerError::channel)?;
        callstack::walk(
            channel,
            self.breakpoints.traps(),
            &self.registry,
            thread,
            max_frames,
            self.generation,
        )
        .map_err(DebuggerError::channel)
    }

    // ---- 値 ----

    fn reader(&self, generation: u64, operation: &'static str) -> Result<ValueReader<'_>> {
        if generation != self.generation {
            return Err(DebuggerError::StaleFrame {
                frame: generation,
                current: self.generation,
            });
        }
        self.require_paused(operation)?;
        Ok(ValueReader {
            channel: self.channel_ref().map_err(DebuggerError::channel)?,
            config: &self.config,
            generation: self.generation,
        })
    }

    pub fn arguments(&self, frame: &StackFrame) -> Result<Vec<Variable>> {
        let reader = self.reader(frame.generation, "arguments")?;
        Ok(frame
            .info
            .iter()
            .flat_map(|f| f.arguments.iter())
            .map(|info| reader.variable(frame, info))
            .collect())
    }

    pub fn locals(&self, frame: &StackFrame) -> Result<Vec<Variable>> {
        let reader = self.reader(frame.generation, "locals")?;
        Ok(frame
            .info
            .iter()
            .flat_map(|f| f.locals.iter())
            .map(|info| reader.variable(frame, info))
            .collect())
    }

    pub fn array_element(&self, array: &ArrayValue, index: usize) -> Result<Value> {
        let reader = self.reader(self.generation, "array_element")?;
        reader.element(array, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_splits_and_normalizes() {
        let mut buffer = LineBuffer::default();
        assert_eq!(buffer.push("Hello wor"), Vec::<String>::new());
        assert_eq!(buffer.push("ld!\r\nMark 1\nMark"), vec!["Hello world!\n", "Mark 1\n"]);
        // CRLF が断片の境界で分かれても1つの改行になる
        assert_eq!(buffer.push(" 2\r"), Vec::<String>::new());
        assert_eq!(buffer.push("\n"), vec!["Mark 2\n"]);
        assert_eq!(buffer.flush(), None);

        buffer.push("tail");
        assert_eq!(buffer.flush(), Some("tail".to_string()));
    }

    #[test]
    fn test_run_state_description() {
        assert_eq!(RunState::NotStarted.describe(), "not started");
        assert_eq!(
            RunState::Exited {
                code: None,
                error: Some("broken pipe".to_string())
            }
            .describe(),
            "faulted (broken pipe)"
        );
    }
}
