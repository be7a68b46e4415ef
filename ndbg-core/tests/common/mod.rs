//! 統合テスト用のシミュレーションプログラム
//!
//! 行番号は `Src/Program.cs` のものとして扱います。

#![allow(dead_code)]

use ndbg_core::{Debugger, DebuggerConfig, DebuggerEvent, MarshalMode};
use ndbg_target::{SimData, SimFunction, SimOp, SimProgram, SimType};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub const EXE: &str = "/sim/Program.exe";
pub const SOURCE: &str = "Src/Program.cs";
pub const LIBRARY: &str = "/sim/System.Runtime.dll";
pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn builder() -> ndbg_target::sim::SimProgramBuilder {
    SimProgram::builder(EXE, SOURCE)
}

/// 何もせずに終了する
pub fn simple_program() -> SimProgram {
    builder()
        .function(SimFunction::new("Main").open(3).line(4, [SimOp::Nop]).close(5))
        .library(LIBRARY, 0x1000)
        .build()
        .unwrap()
}

/// 改行コードの混ざった出力
pub fn hello_world() -> SimProgram {
    builder()
        .function(
            SimFunction::new("Main")
                .open(3)
                .line(4, [SimOp::print("Hello "), SimOp::print("world!\r\n")])
                .close(5),
        )
        .build()
        .unwrap()
}

/// コード内のブレーク
pub fn break_program() -> SimProgram {
    builder()
        .function(
            SimFunction::new("Main")
                .open(3)
                .line(4, [SimOp::Break])
                .line(5, [SimOp::print("after break\n")])
                .close(6),
        )
        .library(LIBRARY, 0x1000)
        .build()
        .unwrap()
}

/// 行 5 にブレークポイントを置く前提の出力
pub fn marks() -> SimProgram {
    builder()
        .function(
            SimFunction::new("Main")
                .open(3)
                .line(4, [SimOp::print("Mark 1\n")])
                .line(5, [SimOp::Nop])
                .line(6, [SimOp::print("Mark 2\n")])
                .close(7),
        )
        .build()
        .unwrap()
}

/// Main → Sub1 → Sub2
///
/// - Main: 3 `{`, 4 `Sub1();`, 5 `Console.WriteLine("done");`, 6 `}`
/// - Sub1: 8 `{`, 9 `Sub2();`, 10 `;`, 11 `}`
/// - Sub2: 13 `{`, 14 `;`, 15 `;`, 16 `}`
pub fn nested_calls() -> SimProgram {
    builder()
        .function(
            SimFunction::new("Main")
                .open(3)
                .line(4, [SimOp::call("Sub1")])
                .line(5, [SimOp::print("done\n")])
                .close(6),
        )
        .function(
            SimFunction::new("Sub1")
                .open(8)
                .line(9, [SimOp::call("Sub2")])
                .line(10, [SimOp::Nop])
                .close(11),
        )
        .function(
            SimFunction::new("Sub2")
                .open(13)
                .line(14, [SimOp::Nop])
                .line(15, [SimOp::Nop])
                .close(16),
        )
        .build()
        .unwrap()
}

/// 行情報の無い関数を経由して Sub2 を呼ぶ
///
/// - Main: 3 `{`, 4 `Wrapper();`, 5 `;`, 6 `}`
pub fn hidden_wrapper() -> SimProgram {
    builder()
        .function(
            SimFunction::new("Main")
                .open(3)
                .line(4, [SimOp::call("Wrapper")])
                .line(5, [SimOp::Nop])
                .close(6),
        )
        .function(
            SimFunction::new("Wrapper")
                .hidden([SimOp::Nop])
                .hidden([SimOp::call("Sub2")])
                .hidden([SimOp::Nop]),
        )
        .function(
            SimFunction::new("Sub2")
                .open(13)
                .line(14, [SimOp::Nop])
                .close(16),
        )
        .build()
        .unwrap()
}

/// 引数の型が異なる呼び出しを3回行う
///
/// - Main: 4, 5, 6 がそれぞれ `Func(...)`
/// - Func(int i, string s, int[] args): 10 `{`, 11 `;`, 12 `}`
pub fn argument_variables() -> SimProgram {
    let call = |i: i32, s: Option<&str>, args: Vec<i32>| {
        [
            SimOp::SetArg(0, SimData::Int(i)),
            SimOp::SetArg(1, SimData::Str(s.map(str::to_string))),
            SimOp::SetArg(2, SimData::IntArray(args)),
            SimOp::call("Func"),
        ]
    };
    builder()
        .function(
            SimFunction::new("Main")
                .open(3)
                .line(4, call(1, Some("a"), vec![]))
                .line(5, call(2, None, vec![7]))
                .line(6, call(3, Some("c"), vec![8, 9]))
                .close(7),
        )
        .function(
            SimFunction::new("Func")
                .arg("i", SimType::Int)
                .arg("s", SimType::Str)
                .arg("args", SimType::IntArray)
                .local("flag", SimType::Bool)
                .local("owner", SimType::Object("Program".to_string()))
                .open(10)
                .line(
                    11,
                    [
                        SimOp::store("flag", SimData::Bool(true)),
                        SimOp::store("owner", SimData::Object(None)),
                    ],
                )
                .line(12, [SimOp::Nop])
                .close(13),
        )
        .build()
        .unwrap()
}

/// Sub を3回呼ぶ
pub fn repeated_calls() -> SimProgram {
    builder()
        .function(
            SimFunction::new("Main")
                .open(3)
                .line(4, [SimOp::call("Sub")])
                .line(5, [SimOp::call("Sub")])
                .line(6, [SimOp::call("Sub")])
                .close(7),
        )
        .function(
            SimFunction::new("Sub")
                .open(9)
                .line(10, [SimOp::print("tick\n")])
                .close(11),
        )
        .build()
        .unwrap()
}

/// 終わらないループ
pub fn endless_loop() -> SimProgram {
    builder()
        .function(
            SimFunction::new("Main")
                .open(3)
                .line(4, [SimOp::Nop])
                .line(5, [SimOp::Jump(0)])
                .close(6),
        )
        .build()
        .unwrap()
}

/// 未処理のシグナルで停止する
pub fn faulting() -> SimProgram {
    builder()
        .function(
            SimFunction::new("Main")
                .open(3)
                .line(4, [SimOp::Fault(11, "SIGSEGV".to_string())])
                .close(5),
        )
        .build()
        .unwrap()
}

/// スレッドとライブラリを途中で作る
pub fn threads_and_libraries() -> SimProgram {
    builder()
        .function(
            SimFunction::new("Main")
                .open(3)
                .line(4, [SimOp::SpawnThread(4201), SimOp::LoadLibrary(0)])
                .line(5, [SimOp::Break])
                .line(6, [SimOp::EndThread(4201)])
                .line(7, [SimOp::Break])
                .close(8),
        )
        .delayed_library(LIBRARY, 0x2000)
        .build()
        .unwrap()
}

pub fn debugger(program: SimProgram) -> Debugger {
    Debugger::simulated(program, DebuggerConfig::default()).unwrap()
}

pub fn manual_debugger(program: SimProgram) -> Debugger {
    let config = DebuggerConfig::default().with_marshal_mode(MarshalMode::Manual);
    Debugger::simulated(program, config).unwrap()
}

pub fn start(debugger: &Debugger) {
    debugger.start(EXE, "/sim", &[]).unwrap();
}

/// 停止を待つ（テストが止まらないようにタイムアウト付き）
pub fn wait_pause(debugger: &Debugger) {
    assert!(
        debugger.wait_for_pause_timeout(TIMEOUT).unwrap(),
        "debuggee did not pause"
    );
}

/// 出力をすべて連結して記録する
pub fn capture_log(debugger: &Debugger) -> Arc<Mutex<String>> {
    let log = Arc::new(Mutex::new(String::new()));
    let sink = Arc::clone(&log);
    debugger.on_log_message(move |line| sink.lock().push_str(line));
    log
}

/// 停止イベントの数
pub fn count_pauses(events: &[DebuggerEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, DebuggerEvent::Paused { .. }))
        .count()
}

/// 現在の行
pub fn current_line(debugger: &Debugger) -> u32 {
    debugger
        .current_function()
        .unwrap()
        .segment
        .expect("current location should have a line")
        .start_line
}
