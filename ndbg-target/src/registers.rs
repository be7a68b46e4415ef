//! レジスタアクセス機能

use crate::{Result, ThreadContext, ThreadId};
use nix::unistd::Pid;

/// スレッドのレジスタ
pub struct Registers {
    tid: Pid,
}

impl Registers {
    /// レジスタアクセスを作成する
    pub fn new(tid: ThreadId) -> Self {
        Self {
            tid: Pid::from_raw(tid),
        }
    }

    /// レジスタを読み取る
    pub fn read(&self) -> Result<nix::libc::user_regs_struct> {
        let regs = nix::sys::ptrace::getregs(self.tid)
            .map_err(|e| anyhow::anyhow!("Failed to read registers of {}: {}", self.tid, e))?;
        Ok(regs)
    }

    /// レジスタに書き込む
    pub fn write(&self, regs: nix::libc::user_regs_struct) -> Result<()> {
        nix::sys::ptrace::setregs(self.tid, regs)
            .map_err(|e| anyhow::anyhow!("Failed to write registers of {}: {}", self.tid, e))?;
        Ok(())
    }

    /// RIP / RSP / RBP を取得する
    pub fn context(&self) -> Result<ThreadContext> {
        let regs = self.read()?;
        Ok(ThreadContext {
            pc: regs.rip,
            sp: regs.rsp,
            fp: regs.rbp,
        })
    }

    /// RIP / RSP / RBP を書き換える（他のレジスタはそのまま）
    pub fn set_context(&self, context: &ThreadContext) -> Result<()> {
        let mut regs = self.read()?;
        regs.rip = context.pc;
        regs.rsp = context.sp;
        regs.rbp = context.fp;
        self.write(regs)
    }
}
