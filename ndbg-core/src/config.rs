//! デバッガの設定

use std::time::Duration;

/// 呼び出しを制御スレッドへ渡す方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MarshalMode {
    /// デバッガが専用の制御スレッドを持つ
    #[default]
    Automatic,
    /// 呼び出し元のスレッドが制御スレッドになる（待機中にイベントループを回す）
    Manual,
}

/// デバッガの設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebuggerConfig {
    pub marshal_mode: MarshalMode,
    /// ネイティブイベントを待つ1回あたりの時間
    pub poll_interval: Duration,
    /// コールスタックの最大深さ
    pub max_frames: usize,
    /// 文字列として読み取る最大バイト数
    pub max_string_len: usize,
    /// 配列として扱う最大要素数
    pub max_array_len: usize,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            marshal_mode: MarshalMode::Automatic,
            poll_interval: Duration::from_millis(10),
            max_frames: 256,
            max_string_len: 4096,
            max_array_len: 1 << 20,
        }
    }
}

impl DebuggerConfig {
    pub fn with_marshal_mode(mut self, mode: MarshalMode) -> Self {
        self.marshal_mode = mode;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames.max(1);
        self
    }

    pub fn with_max_string_len(mut self, len: usize) -> Self {
        self.max_string_len = len;
        self
    }

    pub fn with_max_array_len(mut self, len: usize) -> Self {
        self.max_array_len = len;
        self
    }
}
