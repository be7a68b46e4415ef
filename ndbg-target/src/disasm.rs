//! 逆アセンブル機能
//!
//! ステップ実行で call / ret を見分けるために、先頭の1命令だけを分類します。

use crate::{Instruction, InstructionKind, Result};
use capstone::prelude::*;

/// x86-64 の命令長の上限
pub const MAX_INSTRUCTION_LEN: usize = 15;

fn capstone() -> Result<Capstone> {
    Capstone::new()
        .x86()
        .mode(arch::x86::ArchMode::Mode64)
        .syntax(arch::x86::ArchSyntax::Intel)
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to create Capstone: {}", e))
}

/// バイト列の先頭の命令を分類する
///
/// # Arguments
/// * `code` - 命令のバイト列（トラップを取り除いたもの）
/// * `address` - 命令のアドレス
pub fn classify(code: &[u8], address: u64) -> Result<Instruction> {
    let cs = capstone()?;
    let insns = cs
        .disasm_count(code, address, 1)
        .map_err(|e| anyhow::anyhow!("Failed to disassemble at 0x{:x}: {}", address, e))?;

    let insn = insns
        .as_ref()
        .first()
        .ok_or_else(|| anyhow::anyhow!("No instruction at 0x{:x}", address))?;

    // mnemonic が "call" / "ret"（AT&T 構文なら "callq" / "retq"）
    let kind = match (insn.mnemonic().unwrap_or(""), insn.op_str().unwrap_or("")) {
        ("call" | "callq", _) => InstructionKind::Call,
        ("ret" | "retq", _) => InstructionKind::Return,
        ("push" | "pushq", "rbp" | "%rbp") => InstructionKind::PushFramePointer,
        _ => InstructionKind::Other,
    };

    Ok(Instruction {
        address,
        len: insn.bytes().len() as u64,
        kind,
    })
}
