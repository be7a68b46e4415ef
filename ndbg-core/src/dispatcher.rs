//! 制御スレッドへの呼び出しの受け渡し
//!
//! セッションの状態はすべて1つの制御スレッドで変更します。
//!
//! - `Automatic`: デバッガが専用の制御スレッドを持ちます。呼び出しはクロージャとしてキューに積まれ、
//!   呼び出し元は結果が返るまで待ちます。制御スレッドは空き時間にネイティブイベントを処理します。
//! - `Manual`: 呼び出し元のスレッドがその場でセッションを操作します。
//!   ネイティブイベントは待機関数（`wait_for_pause` など）の中で処理します。
//!
//! どちらのモードでも、イベントハンドラはセッションのロックを持たない状態で呼ばれ、
//! 待機側が見る状態はイベントをすべて配送した後に公開されます。

use crate::session::{RunState, Session, Status};
use crate::{DebuggerError, DebuggerEvent, EventHandler, MarshalMode, Result};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// 制御スレッドで結果を返すための後処理
type Reply = Box<dyn FnOnce() + Send>;
/// 制御スレッドで実行する呼び出し
type Command = Box<dyn FnOnce(&mut Session) -> Reply + Send>;

/// スレッド間で共有する状態とハンドラ
struct Shared {
    status: Mutex<Status>,
    changed: Condvar,
    handlers: Mutex<Vec<EventHandler>>,
}

impl Shared {
    fn publish(&self, status: Status) {
        *self.status.lock() = status;
        self.changed.notify_all();
    }

    fn dispatch(&self, events: Vec<DebuggerEvent>) {
        if events.is_empty() {
            return;
        }
        // ハンドラの中から購読を追加できるように、ロックを外してから呼ぶ
        let handlers: Vec<EventHandler> = self.handlers.lock().clone();
        for event in &events {
            for handler in &handlers {
                handler(event);
            }
        }
    }

    fn fault(&self) -> Option<String> {
        match &self.status.lock().state {
            RunState::Exited {
                error: Some(error), ..
            } => Some(error.clone()),
            _ => None,
        }
    }
}

enum Marshal {
    Automatic {
        commands: Sender<Command>,
        control_thread: thread::ThreadId,
    },
    Manual {
        session: Mutex<Session>,
    },
}

/// セッションへの呼び出しを制御スレッドに渡す
pub(crate) struct Dispatcher {
    marshal: Marshal,
    shared: Arc<Shared>,
    poll_interval: Duration,
}

impl Dispatcher {
    pub fn new(session: Session, mode: MarshalMode) -> Result<Self> {
        let poll_interval = session.config().poll_interval;
        let shared = Arc::new(Shared {
            status: Mutex::new(session.status()),
            changed: Condvar::new(),
            handlers: Mutex::new(Vec::new()),
        });

        let marshal = match mode {
            MarshalMode::Manual => Marshal::Manual {
                session: Mutex::new(session),
            },
            MarshalMode::Automatic => {
                let (commands, receiver) = crossbeam_channel::unbounded();
                let loop_shared = Arc::clone(&shared);
                let handle = thread::Builder::new()
                    .name("ndbg-control".to_string())
                    .spawn(move || control_loop(session, receiver, loop_shared, poll_interval))
                    .map_err(|e| {
                        DebuggerError::Channel(format!("Failed to spawn control thread: {}", e))
                    })?;
                Marshal::Automatic {
                    commands,
                    control_thread: handle.thread().id(),
                }
            }
        };

        Ok(Self {
            marshal,
            shared,
            poll_interval,
        })
    }

    /// 制御スレッドでセッションを操作し、結果を返す
    pub fn call<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Session) -> Result<R> + Send + 'static,
    {
        if let Some(error) = self.shared.fault() {
            return Err(DebuggerError::Faulted(error));
        }

        match &self.marshal {
            Marshal::Automatic {
                commands,
                control_thread,
            } => {
                if thread::current().id() == *control_thread {
                    return Err(DebuggerError::Reentrant);
                }
                let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
                let command: Command = Box::new(move |session: &mut Session| -> Reply {
                    let result = f(session);
                    Box::new(move || {
                        let _ = reply_tx.send(result);
                    })
                });
                commands.send(command).map_err(|_| self.disconnected())?;
                reply_rx.recv().map_err(|_| self.disconnected())?
            }
            Marshal::Manual { session } => {
                let (result, events, status) = {
                    let mut session = session.lock();
                    let result = f(&mut session);
                    (result, session.take_events(), session.status())
                };
                self.shared.dispatch(events);
                self.shared.publish(status);
                result
            }
        }
    }

    fn disconnected(&self) -> DebuggerError {
        match self.shared.fault() {
            Some(error) => DebuggerError::Faulted(error),
            None => DebuggerError::Disconnected,
        }
    }

    /// 公開済みの状態
    pub fn status(&self) -> Status {
        self.shared.status.lock().clone()
    }

    /// 状態が条件を満たすまで待つ
    ///
    /// `check` が Some を返したらその結果を返します。`deadline` を過ぎたら None。
    pub fn wait<R>(
        &self,
        deadline: Option<Instant>,
        mut check: impl FnMut(&Status) -> Option<Result<R>>,
    ) -> Option<Result<R>> {
        match &self.marshal {
            Marshal::Automatic { control_thread, .. } => {
                if thread::current().id() == *control_thread {
                    return Some(Err(DebuggerError::Reentrant));
                }
                let mut status = self.shared.status.lock();
                loop {
                    if let Some(result) = check(&status) {
                        return Some(result);
                    }
                    match deadline {
                        Some(deadline) => {
                            if self.shared.changed.wait_until(&mut status, deadline).timed_out() {
                                return check(&status);
                            }
                        }
                        None => self.shared.changed.wait(&mut status),
                    }
                }
            }
            Marshal::Manual { session } => loop {
                let status = self.status();
                if let Some(result) = check(&status) {
                    return Some(result);
                }
                let timeout = match deadline {
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            return None;
                        }
                        self.poll_interval.min(deadline - now)
                    }
                    None => self.poll_interval,
                };
                let (events, status) = {
                    let mut session = session.lock();
                    session.pump(timeout);
                    (session.take_events(), session.status())
                };
                self.shared.dispatch(events);
                self.shared.publish(status);
            },
        }
    }

    pub fn subscribe(&self, handler: EventHandler) {
        self.shared.handlers.lock().push(handler);
    }
}

/// 制御スレッドの本体
///
/// 実行中は呼び出しの合間にネイティブイベントを処理し、停止中は呼び出しだけを待ちます。
/// デバッガが破棄される（送信側が無くなる）か、チャネルが失敗すると終了します。
fn control_loop(
    mut session: Session,
    commands: Receiver<Command>,
    shared: Arc<Shared>,
    poll_interval: Duration,
) {
    tracing::debug!("Control thread started");

    loop {
        let command = if session.is_running() {
            match commands.try_recv() {
                Ok(command) => Some(command),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => break,
            }
        } else {
            match commands.recv() {
                Ok(command) => Some(command),
                Err(_) => break,
            }
        };

        let reply = match command {
            Some(command) => Some(command(&mut session)),
            None => {
                session.pump(poll_interval);
                None
            }
        };

        let status = session.status();
        shared.dispatch(session.take_events());
        let faulted = matches!(status.state, RunState::Exited { error: Some(_), .. });
        shared.publish(status);
        if let Some(reply) = reply {
            reply();
        }
        if faulted {
            tracing::warn!("Control thread stopping after a channel failure");
            break;
        }
    }

    tracing::debug!("Control thread finished");
}
