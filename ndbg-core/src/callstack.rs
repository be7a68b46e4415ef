//! コールスタックの巻き戻し
//!
//! フレームポインタ（RBP）のチェーンをたどります。
//! 最も内側のフレームが関数の先頭（push rbp の前）や ret 命令の上にあるときは、
//! まだフレームが無い（またはもう無い）ので、戻りアドレスを RSP から読みます。
//! push rbp の直後は、積んだ RBP の位置をフレームとして扱います。

use crate::breakpoint::TrapTable;
use crate::registry::{Module, Registry};
use ndbg_symbols::{FrameBase, FunctionInfo, SourceSegment};
use ndbg_target::{read_value, DebugChannel, InstructionKind, ThreadContext, ThreadId};
use std::sync::Arc;

/// スタックフレーム
///
/// 読み取った停止の世代を持ち、デバッグ対象が再開した後は使えません。
#[derive(Debug, Clone, PartialEq)]
pub struct StackFrame {
    /// 0 が最も内側
    pub index: usize,
    pub thread: ThreadId,
    pub function: String,
    /// モジュールのファイル名
    pub module: Option<String>,
    pub segment: Option<SourceSegment>,
    pub pc: u64,
    pub sp: u64,
    pub fp: u64,
    pub(crate) frame_base: FrameBase,
    pub(crate) info: Option<Arc<FunctionInfo>>,
    pub(crate) generation: u64,
}

impl StackFrame {
    /// このフレームを読み取った停止の世代
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn function_info(&self) -> Option<&FunctionInfo> {
        self.info.as_deref()
    }
}

/// 最も内側のフレームがプロローグ・エピローグのどこにいるか
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    /// 関数の先頭か ret の上。戻りアドレスは [sp]
    NoFrame,
    /// push rbp の直後。呼び出し元の RBP が [sp]、戻りアドレスが [sp + 8]
    Pushed,
    /// mov rbp, rsp の後
    Framed,
}

fn innermost_state(
    channel: &dyn DebugChannel,
    traps: &TrapTable,
    module: Option<&Module>,
    info: Option<&FunctionInfo>,
    pc: u64,
) -> FrameState {
    if let (Some(module), Some(info)) = (module, info) {
        let entry = module.info.base + info.low;
        if pc == entry {
            return FrameState::NoFrame;
        }
        let pushed = traps.decode(channel, entry).is_ok_and(|insn| {
            insn.kind == InstructionKind::PushFramePointer && insn.next_address() == pc
        });
        if pushed {
            return FrameState::Pushed;
        }
    }
    if traps
        .decode(channel, pc)
        .is_ok_and(|insn| insn.kind == InstructionKind::Return)
    {
        FrameState::NoFrame
    } else {
        FrameState::Framed
    }
}

/// 現在のフレームの CFA（呼び出し直前の RSP）
///
/// プロローグの途中でも変わらないので、ステップ実行でフレームを見分けるのに使う。
pub(crate) fn canonical_frame_address(
    channel: &dyn DebugChannel,
    traps: &TrapTable,
    registry: &Registry,
    context: &ThreadContext,
) -> u64 {
    let module = registry.module_at(context.pc);
    let info = module.and_then(|m| m.function_at(context.pc));
    match innermost_state(channel, traps, module, info.as_deref(), context.pc) {
        FrameState::NoFrame => context.sp.wrapping_add(8),
        FrameState::Pushed => context.sp.wrapping_add(16),
        FrameState::Framed => context.fp.wrapping_add(16),
    }
}

/// スレッドのコールスタックを内側から順に作る
pub(crate) fn walk(
    channel: &dyn DebugChannel,
    traps: &TrapTable,
    registry: &Registry,
    thread: ThreadId,
    max_frames: usize,
    generation: u64,
) -> anyhow::Result<Vec<StackFrame>> {
    let context = channel.context(thread)?;
    let (mut pc, mut sp, mut fp) = (context.pc, context.sp, context.fp);
    let mut frames: Vec<StackFrame> = Vec::new();

    while frames.len() < max_frames {
        let index = frames.len();
        // 呼び出し元は戻りアドレスが次のステートメントを指すことがあるので、call 命令の中で引く
        let lookup = if index == 0 { pc } else { pc.saturating_sub(1) };
        let module = registry.module_at(lookup);
        let info = module.and_then(|m| m.function_at(lookup));
        let segment = module.and_then(|m| m.line_at(lookup)).map(|r| r.segment);

        let state = if index == 0 {
            innermost_state(channel, traps, module, info.as_deref(), pc)
        } else {
            FrameState::Framed
        };
        // フレームが出来ていない間は、push rbp で積まれる（積まれた）位置をフレームとみなす
        let frame_fp = match state {
            FrameState::NoFrame => sp.wrapping_sub(8),
            FrameState::Pushed => sp,
            FrameState::Framed => fp,
        };

        frames.push(StackFrame {
            index,
            thread,
            function: info
                .as_ref()
                .map_or_else(|| format!("<unknown 0x{:x}>", pc), |f| f.name.clone()),
            module: module.map(|m| m.info.name.clone()),
            segment,
            pc,
            sp,
            fp: frame_fp,
            frame_base: info.as_ref().map_or(FrameBase::FramePointer, |f| f.frame_base),
            info,
            generation,
        });

        let unwound = match state {
            FrameState::NoFrame => unwind_frameless(channel, sp, fp),
            FrameState::Pushed => unwind_frame(channel, sp),
            FrameState::Framed if fp == 0 => break,
            FrameState::Framed => unwind_frame(channel, fp),
        };
        let (ret, caller_fp, caller_sp) = match unwound {
            Ok(values) => values,
            Err(e) => {
                tracing::debug!("Stack walk stopped at frame {}: {:#}", index, e);
                break;
            }
        };
        if ret == 0 {
            break;
        }
        // スタックは下に伸びるので、呼び出し元のフレームは必ず上にある
        if state == FrameState::Framed && caller_fp != 0 && caller_fp <= fp {
            tracing::debug!("Frame pointer chain is not increasing at 0x{:x}", fp);
            break;
        }

        pc = ret;
        sp = caller_sp;
        fp = caller_fp;
    }

    Ok(frames)
}

/// フレームが無い関数から抜ける: 戻りアドレスは RSP の位置にある
fn unwind_frameless(channel: &dyn DebugChannel, sp: u64, fp: u64) -> anyhow::Result<(u64, u64, u64)> {
    let caller_sp = sp
        .checked_add(8)
        .ok_or_else(|| anyhow::anyhow!("Stack pointer 0x{:x} is at the end of memory", sp))?;
    Ok((read_value::<u64>(channel, sp)?, fp, caller_sp))
}

/// RBP のチェーンを1段たどる: [fp] = 呼び出し元の RBP、[fp + 8] = 戻りアドレス
///
/// RBP を汎用レジスタとして使う関数ではゴミが入っているので、桁あふれはエラーにする。
fn unwind_frame(channel: &dyn DebugChannel, fp: u64) -> anyhow::Result<(u64, u64, u64)> {
    let caller_sp = fp
        .checked_add(16)
        .ok_or_else(|| anyhow::anyhow!("Frame pointer 0x{:x} is not a stack address", fp))?;
    let ret = read_value::<u64>(channel, fp + 8)?;
    let caller_fp = read_value::<u64>(channel, fp)?;
    Ok((ret, caller_fp, caller_sp))
}
