//! 実プロセス（ptrace + DWARF）でのテスト
//!
//! 事前に `demos/testee` をビルドしておく必要があり、ptrace の権限も要るので通常は実行しません。
//! `cargo build -p testee && cargo test -p ndbg-core --test test_native -- --ignored`
//! 別の場所のバイナリを使う場合は `NDBG_TESTEE` で指定します。

use ndbg_core::{Debugger, DebuggerConfig, DebuggerError, PausedReason, Primitive, Value};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(30);

fn testee() -> PathBuf {
    match std::env::var_os("NDBG_TESTEE") {
        Some(path) => PathBuf::from(path),
        None => PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../target/debug/testee"),
    }
}

fn launch(scenario: &str, breakpoint_line: Option<u32>) -> (Debugger, Arc<Mutex<String>>) {
    let debugger = Debugger::native(DebuggerConfig::default()).unwrap();
    let log = Arc::new(Mutex::new(String::new()));
    let sink = Arc::clone(&log);
    debugger.on_log_message(move |line| sink.lock().push_str(line));
    if let Some(line) = breakpoint_line {
        debugger.add_breakpoint("testee/src/main.rs", line).unwrap();
    }

    let exe = testee();
    let cwd = exe.parent().unwrap().to_path_buf();
    debugger.start(exe, cwd, &[scenario.to_string()]).unwrap();
    (debugger, log)
}

fn wait_pause(debugger: &Debugger) {
    assert!(debugger.wait_for_pause_timeout(TIMEOUT).unwrap());
}

#[test]
#[ignore]
fn test_native_hello_world() {
    let (debugger, log) = launch("HelloWorld", None);
    assert_eq!(debugger.wait_for_process_exit().unwrap(), Some(0));
    assert_eq!(log.lock().as_str(), "Hello world!\n");
}

#[test]
#[ignore]
fn test_native_break() {
    let (debugger, log) = launch("Break", None);
    wait_pause(&debugger);
    assert_eq!(debugger.paused_reason().unwrap(), PausedReason::Break);

    let testee = debugger.get_module("testee").unwrap().unwrap();
    assert!(testee.symbols_loaded);

    debugger.continue_execution().unwrap();
    assert_eq!(debugger.wait_for_process_exit().unwrap(), Some(0));
    assert_eq!(log.lock().as_str(), "after break\n");
}

#[test]
#[ignore]
fn test_native_breakpoint() {
    let (debugger, log) = launch("Breakpoint", Some(34));
    wait_pause(&debugger);
    assert_eq!(debugger.paused_reason().unwrap(), PausedReason::Breakpoint);
    assert_eq!(log.lock().as_str(), "Mark 1\n");

    let breakpoint = debugger.breakpoints().unwrap().remove(0);
    assert!(breakpoint.had_been_set());
    assert_eq!(breakpoint.source_segment().unwrap().start_line, 34);

    debugger.continue_execution().unwrap();
    assert_eq!(debugger.wait_for_process_exit().unwrap(), Some(0));
    assert_eq!(log.lock().as_str(), "Mark 1\nMark 2\n");
}

#[test]
#[ignore]
fn test_native_callstack_and_step_out() {
    let (debugger, _) = launch("Callstack", Some(46));
    wait_pause(&debugger);

    let thread = debugger.current_thread().unwrap().id;
    let frames = debugger.callstack(thread).unwrap();
    let names: Vec<&str> = frames.iter().take(3).map(|f| f.function.as_str()).collect();
    assert!(names[0].ends_with("sub2"), "{:?}", names);
    assert!(names[1].ends_with("sub1"), "{:?}", names);
    assert!(names[2].ends_with("main"), "{:?}", names);

    debugger.step_out().unwrap();
    wait_pause(&debugger);
    assert_eq!(debugger.paused_reason().unwrap(), PausedReason::StepComplete);
    assert!(debugger.current_function().unwrap().function.ends_with("sub1"));

    debugger.continue_execution().unwrap();
    assert_eq!(debugger.wait_for_process_exit().unwrap(), Some(0));
}

#[test]
#[ignore]
fn test_native_stepping() {
    let (debugger, _) = launch("Stepping", Some(40));
    wait_pause(&debugger);
    let function = |debugger: &Debugger| debugger.current_function().unwrap().function;
    let line = |debugger: &Debugger| {
        let frame = debugger.current_function().unwrap();
        frame.segment.unwrap().start_line
    };

    debugger.step_into().unwrap();
    wait_pause(&debugger);
    assert!(function(&debugger).ends_with("sub2"));
    assert_eq!(line(&debugger), 45);

    // 開始行からの StepOver は関数の中に留まる
    debugger.step_over().unwrap();
    wait_pause(&debugger);
    assert_eq!(debugger.paused_reason().unwrap(), PausedReason::StepComplete);
    assert!(function(&debugger).ends_with("sub2"));
    assert_eq!(line(&debugger), 46);

    debugger.step_out().unwrap();
    wait_pause(&debugger);
    assert!(function(&debugger).ends_with("sub1"));

    debugger.continue_execution().unwrap();
    assert_eq!(debugger.wait_for_process_exit().unwrap(), Some(0));
}

#[test]
#[ignore]
fn test_native_start_in_missing_directory() {
    let debugger = Debugger::native(DebuggerConfig::default()).unwrap();
    let error = debugger
        .start(testee(), "/definitely/not/here", &["HelloWorld".to_string()])
        .unwrap_err();
    assert!(matches!(error, DebuggerError::Launch { .. }), "{:?}", error);
    assert!(!debugger.is_running());
}

#[test]
#[ignore]
fn test_native_function_arguments() {
    let (debugger, _) = launch("FunctionArgumentVariables", Some(52));

    for (round, text) in ["a", "", "c"].iter().enumerate() {
        wait_pause(&debugger);
        let frame = debugger.current_function().unwrap();
        let arguments = debugger.arguments(&frame).unwrap();
        let names: Vec<&str> = arguments.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["i", "s", "args"]);
        assert_eq!(
            arguments[0].value,
            Value::Primitive(Primitive::Int(round as i64 + 1))
        );
        assert_eq!(arguments[1].value, Value::String(text.to_string()));
        assert_eq!(arguments[2].value.as_array().unwrap().len(), round);
        debugger.continue_execution().unwrap();
    }
    assert_eq!(debugger.wait_for_process_exit().unwrap(), Some(0));
}
