//! デバッガのメインロジック
//!
//! [`Debugger`] はセッションを操作する公開インターフェースです。
//! 操作はすべて制御スレッドで実行され、結果は呼び出し元に同期的に返ります。

use crate::breakpoint::{Breakpoint, BreakpointId, BreakpointLocation};
use crate::callstack::StackFrame;
use crate::dispatcher::Dispatcher;
use crate::registry::{ModuleInfo, ProcessInfo, ThreadInfo};
use crate::session::{RunState, Session, Status};
use crate::stepping::StepKind;
use crate::value::{ArrayValue, Value, Variable};
use crate::{DebuggerConfig, DebuggerError, DebuggerEvent, PausedReason, Result};
use crossbeam_channel::Receiver;
use ndbg_symbols::{DwarfSymbolProvider, SymbolProvider};
use ndbg_target::{LaunchSpec, Launcher, PtraceLauncher, SimLauncher, SimProgram, ThreadId};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Inner {
    dispatcher: Dispatcher,
    config: DebuggerConfig,
}

/// デバッガ
///
/// クローンは同じセッションを指し、どのスレッドからでも呼び出せます。
#[derive(Clone)]
pub struct Debugger {
    inner: Arc<Inner>,
}

impl Debugger {
    /// ランチャーとシンボルプロバイダを指定してデバッガを作成する
    pub fn new(
        launcher: Arc<dyn Launcher>,
        symbols: Arc<dyn SymbolProvider>,
        config: DebuggerConfig,
    ) -> Result<Self> {
        let session = Session::new(launcher, symbols, config.clone());
        let dispatcher = Dispatcher::new(session, config.marshal_mode)?;
        Ok(Self {
            inner: Arc::new(Inner { dispatcher, config }),
        })
    }

    /// ptrace と DWARF を使う実プロセス用のデバッガ
    pub fn native(config: DebuggerConfig) -> Result<Self> {
        Self::new(
            Arc::new(PtraceLauncher),
            Arc::new(DwarfSymbolProvider::new()),
            config,
        )
    }

    /// シミュレータ上のプログラムをデバッグする
    pub fn simulated(program: SimProgram, config: DebuggerConfig) -> Result<Self> {
        let symbols = Arc::new(program.symbol_provider());
        Self::new(Arc::new(SimLauncher::new(program)), symbols, config)
    }

    pub fn config(&self) -> &DebuggerConfig {
        &self.inner.config
    }

    fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    fn call<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Session) -> Result<R> + Send + 'static,
    {
        self.dispatcher().call(f)
    }

    // ---- ライフサイクル ----

    /// 実行可能ファイルを起動してデバッグを開始する
    ///
    /// プロセスが走り出した時点で戻ります。ブレークポイントはロード済みのモジュールに対して解決され、
    /// 以降はモジュールのロードごとに解決されます。
    pub fn start(
        &self,
        executable: impl Into<PathBuf>,
        working_directory: impl Into<PathBuf>,
        arguments: &[String],
    ) -> Result<()> {
        let spec = LaunchSpec {
            executable: executable.into(),
            working_directory: working_directory.into(),
            arguments: arguments.to_vec(),
        };
        self.call(move |session| session.start(spec))
    }

    /// デバッグ対象を強制終了する
    pub fn terminate(&self) -> Result<()> {
        self.call(|session| session.terminate())
    }

    /// 実行中のデバッグ対象を停止させる（`ForcedBreak` で停止する）
    pub fn break_execution(&self) -> Result<()> {
        self.call(|session| session.break_execution())
    }

    // ---- ブレークポイント ----

    /// ソースの行にブレークポイントを設定する
    ///
    /// 対応するコードが見つからなくてもエラーにはならず、未解決のまま残ります。
    pub fn add_breakpoint(&self, file: &str, line: u32) -> Result<Breakpoint> {
        let location = BreakpointLocation::Source {
            file: file.to_string(),
            line,
        };
        self.call(move |session| Ok(session.add_breakpoint(location)))
    }

    /// アドレスにブレークポイントを設定する
    pub fn add_breakpoint_at(&self, address: u64) -> Result<Breakpoint> {
        self.call(move |session| Ok(session.add_breakpoint(BreakpointLocation::Address(address))))
    }

    pub fn remove_breakpoint(&self, breakpoint: &Breakpoint) -> Result<()> {
        let id = breakpoint.id();
        self.call(move |session| session.remove_breakpoint(id))
    }

    pub fn breakpoint(&self, id: BreakpointId) -> Result<Option<Breakpoint>> {
        self.call(move |session| Ok(session.breakpoint(id)))
    }

    pub fn breakpoints(&self) -> Result<Vec<Breakpoint>> {
        self.call(|session| Ok(session.breakpoints()))
    }

    // ---- 実行制御 ----

    pub fn continue_execution(&self) -> Result<()> {
        self.call(|session| session.continue_execution())
    }

    pub fn step_into(&self) -> Result<()> {
        self.call(|session| session.step(StepKind::Into))
    }

    pub fn step_over(&self) -> Result<()> {
        self.call(|session| session.step(StepKind::Over))
    }

    pub fn step_out(&self) -> Result<()> {
        self.call(|session| session.step(StepKind::Out))
    }

    // ---- 待機 ----

    /// デバッグ対象が停止するまで待つ
    ///
    /// 既に停止していればすぐに戻ります。待っている間に終了した場合は `ProcessExited`。
    pub fn wait_for_pause(&self) -> Result<()> {
        self.dispatcher()
            .wait(None, pause_check)
            .unwrap_or(Err(DebuggerError::Disconnected))
    }

    /// タイムアウト付きで停止を待つ。時間内に停止しなければ `Ok(false)`
    pub fn wait_for_pause_timeout(&self, timeout: Duration) -> Result<bool> {
        // 表せないほど長いタイムアウトは無期限として扱う
        let deadline = Instant::now().checked_add(timeout);
        match self.dispatcher().wait(deadline, pause_check) {
            Some(result) => result.map(|()| true),
            None => Ok(false),
        }
    }

    /// デバッグ対象が終了するまで待ち、終了コードを返す
    ///
    /// 先に停止した場合は `UnexpectedPause` を返し、デバッグ対象は停止したままになります。
    pub fn wait_for_process_exit(&self) -> Result<Option<i32>> {
        self.dispatcher()
            .wait(None, exit_check)
            .unwrap_or(Err(DebuggerError::Disconnected))
    }

    // ---- 状態の問い合わせ ----

    fn status(&self) -> Status {
        self.dispatcher().status()
    }

    pub fn is_paused(&self) -> bool {
        matches!(self.status().state, RunState::Paused { .. })
    }

    pub fn is_running(&self) -> bool {
        self.status().state == RunState::Running
    }

    pub fn has_exited(&self) -> bool {
        matches!(self.status().state, RunState::Exited { .. })
    }

    pub fn paused_reason(&self) -> Result<PausedReason> {
        match self.status().state {
            RunState::Paused { reason, .. } => Ok(reason),
            state => Err(DebuggerError::InvalidState {
                operation: "paused_reason",
                expected: "paused",
                actual: state.describe(),
            }),
        }
    }

    /// 停止したスレッド
    pub fn current_thread(&self) -> Result<ThreadInfo> {
        self.call(|session| session.current_thread())
    }

    /// 現在のスレッドの最も内側のフレーム
    pub fn current_function(&self) -> Result<StackFrame> {
        self.call(|session| session.current_function())
    }

    pub fn threads(&self) -> Result<Vec<ThreadInfo>> {
        self.call(|session| Ok(session.threads()))
    }

    pub fn modules(&self) -> Result<Vec<ModuleInfo>> {
        self.call(|session| Ok(session.modules()))
    }

    /// ファイル名（またはフルパス）でモジュールを探す
    pub fn get_module(&self, name: &str) -> Result<Option<ModuleInfo>> {
        let name = name.to_string();
        self.call(move |session| Ok(session.get_module(&name)))
    }

    pub fn process(&self) -> Result<Option<ProcessInfo>> {
        self.call(|session| Ok(session.process()))
    }

    // ---- 値の確認 ----

    /// スレッドのコールスタック（最も内側が先頭）
    pub fn callstack(&self, thread: ThreadId) -> Result<Vec<StackFrame>> {
        self.call(move |session| session.callstack(thread))
    }

    /// フレームの引数（宣言順）
    pub fn arguments(&self, frame: &StackFrame) -> Result<Vec<Variable>> {
        let frame = frame.clone();
        self.call(move |session| session.arguments(&frame))
    }

    /// フレームのローカル変数（宣言順）
    pub fn locals(&self, frame: &StackFrame) -> Result<Vec<Variable>> {
        let frame = frame.clone();
        self.call(move |session| session.locals(&frame))
    }

    pub fn array_element(&self, array: &ArrayValue, index: usize) -> Result<Value> {
        let array = array.clone();
        self.call(move |session| session.array_element(&array, index))
    }

    // ---- イベント ----

    /// イベントハンドラを登録する
    ///
    /// `Automatic` モードではハンドラは制御スレッドで呼ばれます。
    /// ハンドラの中からデバッガを操作すると `Reentrant` になります。
    pub fn subscribe(&self, handler: impl Fn(&DebuggerEvent) + Send + Sync + 'static) {
        self.dispatcher().subscribe(Arc::new(handler));
    }

    /// 標準出力の1行ごとに呼ばれるハンドラを登録する
    pub fn on_log_message(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        self.subscribe(move |event| {
            if let DebuggerEvent::LogMessage(text) = event {
                handler(text);
            }
        });
    }

    /// 以降のイベントを受け取るチャネル
    pub fn events(&self) -> Receiver<DebuggerEvent> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        self.subscribe(move |event| {
            let _ = sender.send(event.clone());
        });
        receiver
    }
}

fn pause_check(status: &Status) -> Option<Result<()>> {
    match &status.state {
        RunState::Paused { .. } => Some(Ok(())),
        RunState::Running => None,
        RunState::NotStarted => Some(Err(DebuggerError::InvalidState {
            operation: "wait_for_pause",
            expected: "started",
            actual: status.state.describe(),
        })),
        RunState::Exited {
            error: Some(error), ..
        } => Some(Err(DebuggerError::Faulted(error.clone()))),
        RunState::Exited { code, .. } => Some(Err(DebuggerError::ProcessExited { code: *code })),
    }
}

fn exit_check(status: &Status) -> Option<Result<Option<i32>>> {
    match &status.state {
        RunState::Exited {
            error: Some(error), ..
        } => Some(Err(DebuggerError::Faulted(error.clone()))),
        RunState::Exited { code, .. } => Some(Ok(*code)),
        RunState::Running => None,
        RunState::Paused { reason, .. } => {
            Some(Err(DebuggerError::UnexpectedPause { reason: *reason }))
        }
        RunState::NotStarted => Some(Err(DebuggerError::InvalidState {
            operation: "wait_for_process_exit",
            expected: "started",
            actual: status.state.describe(),
        })),
    }
}
