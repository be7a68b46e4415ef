//! スレッド管理機能

/// スレッドID
pub type ThreadId = i32;

/// スレッドの実行状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Running,
    Stopped,
    /// SIGSTOP を送って停止を待っている
    StopRequested,
}

/// デバッグ対象のスレッド
#[derive(Debug, Clone)]
pub struct Thread {
    tid: ThreadId,
    state: ThreadState,
    /// 次の再開時に配送するシグナル
    pending_signal: Option<nix::sys::signal::Signal>,
}

impl Thread {
    /// スレッドを作成する
    pub fn new(tid: ThreadId, state: ThreadState) -> Self {
        Self {
            tid,
            state,
            pending_signal: None,
        }
    }

    /// スレッドIDを取得する
    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn set_state(&mut self, state: ThreadState) {
        self.state = state;
    }

    pub fn set_pending_signal(&mut self, signal: nix::sys::signal::Signal) {
        self.pending_signal = Some(signal);
    }

    /// 配送待ちのシグナルを取り出す
    pub fn take_pending_signal(&mut self) -> Option<nix::sys::signal::Signal> {
        self.pending_signal.take()
    }
}
