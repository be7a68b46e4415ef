//! デバッガが外部に通知するイベント

use ndbg_target::ThreadId;
use std::sync::Arc;

/// 停止の理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PausedReason {
    /// デバッグ対象のコード内のブレーク（INT3 や SIGTRAP）
    Break,
    Breakpoint,
    StepComplete,
    /// 未処理のシグナル
    Exception,
    /// `break_execution` による停止
    ForcedBreak,
}

/// デバッガのイベント
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebuggerEvent {
    /// 標準出力の1行（改行は `\n` に正規化され、末尾に付いたまま）
    LogMessage(String),
    Paused {
        reason: PausedReason,
        thread: ThreadId,
    },
    /// プロセスの終了（チャネルの失敗で終わった場合は `code` が None）
    Exited { code: Option<i32> },
}

/// イベントハンドラ（制御スレッドで呼ばれる）
pub type EventHandler = Arc<dyn Fn(&DebuggerEvent) + Send + Sync>;
