//! デバッガのエラー型

use crate::{BreakpointId, PausedReason};
use ndbg_target::ThreadId;
use std::path::PathBuf;

/// デバッガ操作のエラー
///
/// 下位クレート（ndbg-target / ndbg-symbols）の `anyhow::Error` は境界でこの型に変換します。
#[derive(Debug, Clone, thiserror::Error)]
pub enum DebuggerError {
    #[error("Failed to launch {path}: {message}")]
    Launch { path: PathBuf, message: String },

    #[error("{operation} requires the debugger to be {expected}, but it is {actual}")]
    InvalidState {
        operation: &'static str,
        expected: &'static str,
        actual: String,
    },

    #[error("Frame was read at pause {frame} but the debuggee has moved on to {current}")]
    StaleFrame { frame: u64, current: u64 },

    /// デバッグチャネルの致命的な失敗
    #[error("Debug channel failure: {0}")]
    Channel(String),

    /// 以前の致命的な失敗によりセッションが使えない
    #[error("Debugger faulted: {0}")]
    Faulted(String),

    #[error("Process exited (code {code:?})")]
    ProcessExited { code: Option<i32> },

    #[error("Debuggee paused ({reason:?}) while waiting for it to exit")]
    UnexpectedPause { reason: PausedReason },

    #[error("Debugger called from its own event handler on the control thread")]
    Reentrant,

    #[error("Control thread has stopped")]
    Disconnected,

    #[error("Breakpoint {0} not found")]
    BreakpointNotFound(BreakpointId),

    #[error("Thread {0} not found")]
    ThreadNotFound(ThreadId),

    #[error("Index {index} is out of range for an array of length {len}")]
    IndexOutOfRange { index: usize, len: usize },
}

impl DebuggerError {
    pub(crate) fn channel(error: anyhow::Error) -> Self {
        DebuggerError::Channel(format!("{:#}", error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = DebuggerError::InvalidState {
            operation: "continue_execution",
            expected: "paused",
            actual: "running".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "continue_execution requires the debugger to be paused, but it is running"
        );

        let err = DebuggerError::channel(anyhow::anyhow!("inner").context("outer"));
        assert_eq!(err.to_string(), "Debug channel failure: outer: inner");
    }
}
