//! デバッガコマンド

use crate::breakpoint::{BreakpointId, BreakpointLocation};

/// `info` で表示する対象
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoTarget {
    Breakpoints,
    Modules,
    Threads,
}

/// デバッガコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// ブレークポイントを設定（`file:line` または `0xADDR`）
    Break(BreakpointLocation),
    /// ブレークポイントを削除
    Delete(BreakpointId),
    Enable(BreakpointId),
    Disable(BreakpointId),
    /// 実行継続
    Continue,
    /// ステップイン
    Step,
    /// 次の行へ
    Next,
    /// 現在の関数から抜けるまで実行
    Finish,
    /// バックトレース表示
    Backtrace,
    /// 引数表示
    Args,
    /// ローカル変数表示
    Locals,
    Info(InfoTarget),
    /// ヘルプ表示
    Help,
    /// 終了
    Quit,
}

impl Command {
    /// コマンド文字列をパースする
    pub fn parse(input: &str) -> Option<Self> {
        let parts: Vec<&str> = input.split_whitespace().collect();
        if parts.is_empty() {
            return None;
        }

        match parts[0] {
            "break" | "b" => {
                if parts.len() > 1 {
                    parse_location(&parts[1..].join(" ")).map(Command::Break)
                } else {
                    None
                }
            }
            "delete" | "d" => parse_id(&parts).map(Command::Delete),
            "enable" => parse_id(&parts).map(Command::Enable),
            "disable" => parse_id(&parts).map(Command::Disable),
            "continue" | "c" => Some(Command::Continue),
            "step" | "s" => Some(Command::Step),
            "next" | "n" => Some(Command::Next),
            "finish" | "f" => Some(Command::Finish),
            "backtrace" | "bt" => Some(Command::Backtrace),
            "args" | "a" => Some(Command::Args),
            "locals" | "l" => Some(Command::Locals),
            "info" | "i" => match parts.get(1).copied() {
                Some("breakpoints" | "break" | "b") => Some(Command::Info(InfoTarget::Breakpoints)),
                Some("modules" | "m") => Some(Command::Info(InfoTarget::Modules)),
                Some("threads" | "t") => Some(Command::Info(InfoTarget::Threads)),
                _ => None,
            },
            "help" | "h" | "?" => Some(Command::Help),
            "quit" | "q" | "exit" => Some(Command::Quit),
            _ => None,
        }
    }
}

fn parse_id(parts: &[&str]) -> Option<BreakpointId> {
    match parts {
        [_, id] => id.parse().ok(),
        _ => None,
    }
}

/// `file:line` または `0xADDR` を解釈する
fn parse_location(text: &str) -> Option<BreakpointLocation> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16)
            .ok()
            .map(BreakpointLocation::Address);
    }

    // Windows 形式のパス（C:\...）でも最後のコロンで分ける
    let (file, line) = text.rsplit_once(':')?;
    if file.is_empty() {
        return None;
    }
    Some(BreakpointLocation::Source {
        file: file.to_string(),
        line: line.parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("continue"), Some(Command::Continue));
        assert_eq!(Command::parse("c"), Some(Command::Continue));
        assert_eq!(Command::parse("step"), Some(Command::Step));
        assert_eq!(Command::parse("  next  "), Some(Command::Next));
        assert_eq!(Command::parse("bt"), Some(Command::Backtrace));
        assert_eq!(Command::parse("info threads"), Some(Command::Info(InfoTarget::Threads)));
        assert_eq!(Command::parse("quit"), Some(Command::Quit));
        assert_eq!(Command::parse(""), None);
        assert_eq!(Command::parse("jump 3"), None);
    }

    #[test]
    fn test_parse_breakpoint_locations() {
        assert_eq!(
            Command::parse("break Program.cs:12"),
            Some(Command::Break(BreakpointLocation::Source {
                file: "Program.cs".to_string(),
                line: 12
            }))
        );
        assert_eq!(
            Command::parse("b C:\\src\\Program.cs:7"),
            Some(Command::Break(BreakpointLocation::Source {
                file: "C:\\src\\Program.cs".to_string(),
                line: 7
            }))
        );
        assert_eq!(
            Command::parse("b 0x401000"),
            Some(Command::Break(BreakpointLocation::Address(0x401000)))
        );
        assert_eq!(Command::parse("break Program.cs"), None);
        assert_eq!(Command::parse("break :3"), None);
        assert_eq!(Command::parse("break"), None);
    }

    #[test]
    fn test_parse_breakpoint_ids() {
        assert_eq!(Command::parse("delete 2"), Some(Command::Delete(2)));
        assert_eq!(Command::parse("disable 1"), Some(Command::Disable(1)));
        assert_eq!(Command::parse("enable 1"), Some(Command::Enable(1)));
        assert_eq!(Command::parse("delete x"), None);
        assert_eq!(Command::parse("delete"), None);
    }
}
