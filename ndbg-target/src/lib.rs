//! ndbg ターゲットプロセス制御
//!
//! このクレートは、デバッグ対象のプロセスを制御するための低レベル機能を提供します。
//! ptrace、レジスタアクセス、メモリアクセス、トラップの注入などを行い、
//! OSのデバッグイベントを [`DebugChannel`] のイベント列に変換します。
//! テスト用に、同じインターフェースを持つシミュレータ（[`sim`]）も含みます。

pub mod channel;
pub mod process;
pub mod thread;
pub mod memory;
pub mod registers;
pub mod breakpoint;
pub mod disasm;
pub mod sim;

pub use channel::{
    DebugChannel, DebugEvent, Instruction, InstructionKind, LaunchSpec, Launcher, ResumeMode,
    ThreadContext, TrapKind, TRAP_BYTE, TRAP_LEN,
};
pub use process::{PtraceChannel, PtraceLauncher};
pub use thread::{Thread, ThreadId, ThreadState};
pub use memory::{read_value, Memory, MemoryReadable};
pub use registers::Registers;
pub use breakpoint::SoftwareBreakpoint;
pub use sim::{SimChannel, SimData, SimFunction, SimLauncher, SimOp, SimProgram, SimType};

/// ターゲット制御の結果型
pub type Result<T> = anyhow::Result<T>;
