//! ソフトウェアブレークポイント（トラップの注入）

use crate::{DebugChannel, Result, TRAP_BYTE};

/// ソフトウェアブレークポイント（INT3命令）
#[derive(Debug, Clone)]
pub struct SoftwareBreakpoint {
    address: u64,
    original_byte: u8,
    enabled: bool,
}

impl SoftwareBreakpoint {
    /// ブレークポイントを作成する
    pub fn new(address: u64) -> Self {
        Self {
            address,
            original_byte: 0,
            enabled: false,
        }
    }

    /// ブレークポイントのアドレスを取得する
    pub fn address(&self) -> u64 {
        self.address
    }

    /// トラップが書き込まれているか
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// 元のバイトを取得する
    pub fn original_byte(&self) -> u8 {
        self.original_byte
    }

    /// ブレークポイントを設定する
    ///
    /// 指定されたアドレスの命令を0xCC（INT3）で置き換えます。
    pub fn enable(&mut self, channel: &mut dyn DebugChannel) -> Result<()> {
        if self.enabled {
            return Ok(());
        }

        let original = channel.read_memory(self.address, 1)?;
        self.original_byte = original
            .first()
            .copied()
            .ok_or_else(|| anyhow::anyhow!("Empty read at 0x{:x}", self.address))?;

        channel.write_memory(self.address, &[TRAP_BYTE])?;

        self.enabled = true;
        Ok(())
    }

    /// ブレークポイントを解除する
    ///
    /// INT3命令を元のバイトで置き換えます。
    pub fn disable(&mut self, channel: &mut dyn DebugChannel) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        channel.write_memory(self.address, &[self.original_byte])?;

        self.enabled = false;
        Ok(())
    }

    /// プロセス終了などでメモリが無くなったときに、書き戻さずに状態だけ戻す
    pub fn forget(&mut self) {
        self.enabled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SimChannel, SimFunction, SimOp, SimProgram};
    use std::sync::Arc;

    #[test]
    fn test_enable_and_disable_restore_code() {
        let program = SimProgram::builder("/sim/Program.exe", "Src/Program.cs")
            .function(SimFunction::new("Main").line(3, [SimOp::Nop]))
            .build()
            .unwrap();
        let main = program.function_address("Main").unwrap();
        let mut channel = SimChannel::new(Arc::new(program));
        let before = channel.read_memory(main, 1).unwrap()[0];

        let mut bp = SoftwareBreakpoint::new(main);
        bp.enable(&mut channel).unwrap();
        // 2回目の enable で元のバイトを上書きしない
        bp.enable(&mut channel).unwrap();
        assert_eq!(channel.read_memory(main, 1).unwrap(), vec![TRAP_BYTE]);
        assert_eq!(bp.original_byte(), before);

        bp.disable(&mut channel).unwrap();
        assert!(!bp.is_enabled());
        assert_eq!(channel.read_memory(main, 1).unwrap(), vec![before]);
    }
}
