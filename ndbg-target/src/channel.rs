//! デバッグチャネルのインターフェース
//!
//! OSのデバッグ機構（ptrace）やシミュレータを同じ形で扱うためのトレイトとイベント型です。
//! エンジンはこのトレイト越しにだけデバッグ対象を操作します。

use crate::{Result, ThreadId};
use std::path::PathBuf;
use std::time::Duration;

/// トラップ命令（INT3）のバイト
pub const TRAP_BYTE: u8 = 0xCC;

/// トラップ命令の長さ
///
/// ソフトウェアトラップで停止したとき、報告される PC はトラップ命令の直後を指します。
pub const TRAP_LEN: u64 = 1;

/// トラップ停止の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    /// INT3 の実行（注入したものかコード内のものかはエンジンが判定する）
    Software,
    /// シングルステップの完了
    SingleStep,
    /// デバッグ対象が自分で送ったブレークシグナル
    Break,
    /// [`DebugChannel::interrupt`] による停止
    Interrupt,
}

/// デバッグ対象から届くイベント
///
/// `Trap` と `Exception` の後はすべてのスレッドが停止しており、
/// [`DebugChannel::resume`] を呼ぶまで再開しません。それ以外のイベントは通知のみです。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugEvent {
    ThreadCreated {
        tid: ThreadId,
    },
    ThreadExited {
        tid: ThreadId,
    },
    ModuleLoaded {
        path: PathBuf,
        base: u64,
        size: u64,
    },
    ModuleUnloaded {
        base: u64,
    },
    /// 標準出力に書かれたテキスト（行の区切りとは無関係な断片）
    Output(String),
    Trap {
        tid: ThreadId,
        pc: u64,
        kind: TrapKind,
    },
    /// 未処理のシグナル（次の再開時に配送される）
    Exception {
        tid: ThreadId,
        signal: i32,
        description: String,
    },
    Exited {
        code: i32,
    },
}

impl DebugEvent {
    /// このイベントの後にデバッグ対象が停止しているか
    pub fn is_stop(&self) -> bool {
        matches!(self, DebugEvent::Trap { .. } | DebugEvent::Exception { .. })
    }
}

/// 再開の方法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    /// すべてのスレッドを再開する
    Continue,
    /// 指定スレッドだけを1命令実行する（他のスレッドは停止したまま）
    Step(ThreadId),
}

/// スタックの巻き戻しと実行位置の変更に必要なレジスタ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThreadContext {
    pub pc: u64,
    pub sp: u64,
    pub fp: u64,
}

/// 命令の分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionKind {
    Call,
    Return,
    /// `push rbp`（プロローグの先頭）
    PushFramePointer,
    Other,
}

/// デコード済みの1命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub address: u64,
    pub len: u64,
    pub kind: InstructionKind,
}

impl Instruction {
    /// 次の命令のアドレス（call の場合は戻りアドレス）
    pub fn next_address(&self) -> u64 {
        self.address.wrapping_add(self.len)
    }
}

/// デバッグ対象の起動パラメータ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub working_directory: PathBuf,
    pub arguments: Vec<String>,
}

/// デバッグ対象との接続
///
/// 実装はスレッド間で移動できる必要がありますが、呼び出しは常に1つのスレッドから行われます。
pub trait DebugChannel: Send {
    /// プロセスID
    fn pid(&self) -> i32;

    /// 次のイベントを待つ（`timeout` 以内に無ければ None）
    fn poll_event(&mut self, timeout: Duration) -> Result<Option<DebugEvent>>;

    /// 停止中のデバッグ対象を再開する
    fn resume(&mut self, mode: ResumeMode) -> Result<()>;

    fn read_memory(&self, address: u64, len: usize) -> Result<Vec<u8>>;

    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<()>;

    fn context(&self, tid: ThreadId) -> Result<ThreadContext>;

    fn set_context(&mut self, tid: ThreadId, context: &ThreadContext) -> Result<()>;

    /// `code` の先頭の1命令を分類する
    ///
    /// `code` はトラップを取り除いた元のバイト列を渡します。
    fn decode(&self, address: u64, code: &[u8]) -> Result<Instruction>;

    /// 実行中のデバッグ対象に停止を要求する（`TrapKind::Interrupt` で停止する）
    fn interrupt(&mut self) -> Result<()>;

    /// デバッグ対象を強制終了する（続いて `Exited` が届く）
    fn terminate(&mut self) -> Result<()>;
}

/// デバッグ対象を起動してチャネルを作る
pub trait Launcher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn DebugChannel>>;
}
