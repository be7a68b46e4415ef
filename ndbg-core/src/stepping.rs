//! ソース行単位のステップ実行
//!
//! ステップは「1命令実行」と「戻りアドレスまで全速で実行（RunTo）」の組み合わせで進めます。
//! ここでは停止位置ごとの判断だけを行い、実際の再開とトラップの操作はセッションが行います。

use ndbg_symbols::LineRange;
use ndbg_target::{Instruction, InstructionKind, ThreadContext, ThreadId};
use std::ops::Range;

/// ステップの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Into,
    Over,
    Out,
}

/// 一時的なトラップでの待ち合わせ
///
/// `address` に到達し、かつ SP が `sp` に一致したとき（同じフレームに戻ったとき）に成立します。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunTo {
    pub address: u64,
    pub sp: u64,
}

/// 停止位置で次にすること
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    /// 1命令だけ実行する
    SingleStep,
    /// トラップを置いて全速で実行する
    RunTo(RunTo),
}

/// 到着位置の判定結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    Complete,
    /// まだ完了していないので次の動作を決める
    Continue,
    /// 行情報の無い呼び出し先から戻りアドレスまで抜ける
    RunTo(RunTo),
    /// 行情報の無い場所に戻ったので、さらに外側へ抜ける
    StepOutAgain,
}

/// 実行中のステップの状態
#[derive(Debug, Clone)]
pub(crate) struct Stepper {
    pub kind: StepKind,
    pub thread: ThreadId,
    /// 開始したステートメントの範囲（絶対アドレス）
    origin: Option<Range<u64>>,
    /// 開始したフレームの CFA
    origin_cfa: u64,
    /// 待ち合わせ中の一時トラップ
    pub run_to: Option<RunTo>,
    /// StepInto で直前に実行した call の戻り先
    pending_call: Option<RunTo>,
}

impl Stepper {
    /// `cfa` は開始位置のフレームの CFA
    pub fn new(kind: StepKind, thread: ThreadId, origin: Option<&LineRange>, cfa: u64) -> Self {
        Self {
            kind,
            thread,
            origin: origin.map(|r| r.start..r.end),
            origin_cfa: cfa,
            run_to: None,
            pending_call: None,
        }
    }

    /// 停止位置の命令から次の動作を決める（StepInto / StepOver）
    pub fn next_action(&mut self, context: &ThreadContext, insn: &Instruction) -> StepAction {
        if insn.kind != InstructionKind::Call {
            return StepAction::SingleStep;
        }
        let ret = RunTo {
            address: insn.next_address(),
            sp: context.sp,
        };
        match self.kind {
            StepKind::Over => StepAction::RunTo(ret),
            _ => {
                self.pending_call = Some(ret);
                StepAction::SingleStep
            }
        }
    }

    /// 新しい位置に到着したときに完了かどうかを判定する
    ///
    /// `cfa` は到着位置のフレームの CFA、`line` は到着位置を含むステートメント、
    /// `callee_has_lines` は到着位置の関数に行情報があるか。
    pub fn arrived(
        &mut self,
        context: &ThreadContext,
        cfa: u64,
        line: Option<&LineRange>,
        callee_has_lines: impl FnOnce() -> bool,
    ) -> Arrival {
        if let Some(ret) = self.pending_call.take() {
            if !callee_has_lines() {
                return Arrival::RunTo(ret);
            }
        }

        if self.kind == StepKind::Out {
            return if line.is_some() {
                Arrival::Complete
            } else {
                Arrival::StepOutAgain
            };
        }

        if self.origin.as_ref().is_some_and(|r| r.contains(&context.pc)) {
            return Arrival::Continue;
        }

        let at_statement = line.is_some_and(|l| l.start == context.pc);
        let deeper = self.kind == StepKind::Over && cfa < self.origin_cfa;
        if at_statement && !deeper {
            Arrival::Complete
        } else {
            Arrival::Continue
        }
    }
}
