//! ブレークポイントのテスト

mod common;

use common::*;
use ndbg_core::{BreakpointLocation, DebuggerError, DebuggerEvent, PausedReason};

#[test]
fn test_breakpoint_binds_when_module_loads() {
    let debugger = debugger(marks());
    let log = capture_log(&debugger);
    let breakpoint = debugger.add_breakpoint("Program.cs", 5).unwrap();
    assert!(!breakpoint.had_been_set());
    assert_eq!(breakpoint.source_segment(), None);

    start(&debugger);
    wait_pause(&debugger);
    assert_eq!(debugger.paused_reason().unwrap(), PausedReason::Breakpoint);
    assert!(breakpoint.had_been_set());
    let segment = breakpoint.source_segment().unwrap();
    assert_eq!(segment.start_line, 5);
    assert!(segment.file.ends_with("Program.cs"));
    assert_eq!(current_line(&debugger), 5);
    assert_eq!(log.lock().as_str(), "Mark 1\n");

    debugger.continue_execution().unwrap();
    assert_eq!(debugger.wait_for_process_exit().unwrap(), Some(0));
    assert_eq!(log.lock().as_str(), "Mark 1\nMark 2\n");
    assert_eq!(breakpoint.hit_count(), 1);
}

#[test]
fn test_breakpoint_with_full_source_path() {
    let debugger = debugger(marks());
    let breakpoint = debugger.add_breakpoint("C:\\work\\Src\\Program.cs", 5).unwrap();
    start(&debugger);
    wait_pause(&debugger);
    assert!(breakpoint.had_been_set());
    debugger.terminate().unwrap();
}

#[test]
fn test_breakpoint_added_while_paused() {
    let debugger = debugger(nested_calls());
    debugger.add_breakpoint("Program.cs", 4).unwrap();
    start(&debugger);
    wait_pause(&debugger);

    let inner = debugger.add_breakpoint("Program.cs", 14).unwrap();
    // ロード済みのモジュールに対してすぐに解決される
    assert!(inner.had_been_set());
    assert_eq!(debugger.breakpoints().unwrap().len(), 2);

    debugger.continue_execution().unwrap();
    wait_pause(&debugger);
    assert_eq!(current_line(&debugger), 14);
    assert_eq!(debugger.current_function().unwrap().function, "Sub2");
    debugger.terminate().unwrap();
}

#[test]
fn test_unresolvable_line_stays_unbound() {
    let debugger = debugger(marks());
    let breakpoint = debugger.add_breakpoint("Program.cs", 100).unwrap();
    let other_file = debugger.add_breakpoint("Other.cs", 5).unwrap();
    let anchor = debugger.add_breakpoint("Program.cs", 6).unwrap();

    start(&debugger);
    wait_pause(&debugger);
    assert!(anchor.had_been_set());
    assert!(!breakpoint.had_been_set());
    assert!(!other_file.had_been_set());

    debugger.continue_execution().unwrap();
    assert_eq!(debugger.wait_for_process_exit().unwrap(), Some(0));
}

#[test]
fn test_disabled_breakpoint_never_pauses() {
    let debugger = debugger(repeated_calls());
    let events = debugger.events();
    let disabled = debugger.add_breakpoint("Program.cs", 10).unwrap();
    disabled.disable();
    let anchor = debugger.add_breakpoint("Program.cs", 6).unwrap();

    start(&debugger);
    wait_pause(&debugger);
    // Sub の2回の呼び出しを通り過ぎて Main の 6 行目で止まる
    assert_eq!(current_line(&debugger), 6);
    assert!(disabled.had_been_set());
    assert!(!disabled.is_enabled());
    assert_eq!(disabled.hit_count(), 0);
    assert_eq!(anchor.hit_count(), 1);

    // 有効に戻すと次の呼び出しで止まる
    disabled.enable();
    debugger.continue_execution().unwrap();
    wait_pause(&debugger);
    assert_eq!(current_line(&debugger), 10);
    assert_eq!(disabled.hit_count(), 1);

    debugger.continue_execution().unwrap();
    assert_eq!(debugger.wait_for_process_exit().unwrap(), Some(0));
    let events: Vec<DebuggerEvent> = events.try_iter().collect();
    assert_eq!(count_pauses(&events), 2);
}

#[test]
fn test_breakpoint_hits_once_per_call() {
    let debugger = debugger(repeated_calls());
    let breakpoint = debugger.add_breakpoint("Program.cs", 10).unwrap();
    start(&debugger);

    for hit in 1..=3 {
        wait_pause(&debugger);
        assert_eq!(debugger.paused_reason().unwrap(), PausedReason::Breakpoint);
        assert_eq!(breakpoint.hit_count(), hit);
        debugger.continue_execution().unwrap();
    }
    assert_eq!(debugger.wait_for_process_exit().unwrap(), Some(0));
}

#[test]
fn test_remove_breakpoint() {
    let debugger = debugger(repeated_calls());
    let breakpoint = debugger.add_breakpoint("Program.cs", 10).unwrap();
    start(&debugger);
    wait_pause(&debugger);

    debugger.remove_breakpoint(&breakpoint).unwrap();
    assert!(debugger.breakpoint(breakpoint.id()).unwrap().is_none());
    assert!(matches!(
        debugger.remove_breakpoint(&breakpoint),
        Err(DebuggerError::BreakpointNotFound(_))
    ));

    // 止まっていた位置のトラップも取り除かれている
    debugger.continue_execution().unwrap();
    assert_eq!(debugger.wait_for_process_exit().unwrap(), Some(0));
    assert_eq!(breakpoint.hit_count(), 1);
}

#[test]
fn test_shared_trap_survives_removal_of_one_owner() {
    let debugger = debugger(repeated_calls());
    let first = debugger.add_breakpoint("Program.cs", 10).unwrap();
    let second = debugger.add_breakpoint("Program.cs", 10).unwrap();
    assert_ne!(first.id(), second.id());

    start(&debugger);
    wait_pause(&debugger);
    assert_eq!(first.address(), second.address());

    debugger.remove_breakpoint(&first).unwrap();
    debugger.continue_execution().unwrap();
    wait_pause(&debugger);
    assert_eq!(current_line(&debugger), 10);
    debugger.terminate().unwrap();
}

#[test]
fn test_address_breakpoint_at_function_entry() {
    let program = nested_calls();
    let sub1 = program.function_address("Sub1").unwrap();
    let debugger = debugger(program);
    let breakpoint = debugger.add_breakpoint_at(sub1).unwrap();
    assert_eq!(breakpoint.location(), &BreakpointLocation::Address(sub1));

    start(&debugger);
    wait_pause(&debugger);
    assert_eq!(debugger.paused_reason().unwrap(), PausedReason::Breakpoint);
    assert_eq!(breakpoint.address(), Some(sub1));
    // 関数の先頭ではまだフレームが無い
    let thread = debugger.current_thread().unwrap().id;
    let names: Vec<String> = debugger
        .callstack(thread)
        .unwrap()
        .into_iter()
        .map(|f| f.function)
        .collect();
    assert_eq!(names, vec!["Sub1", "Main"]);
    assert_eq!(breakpoint.source_segment().map(|s| s.start_line), Some(8));

    debugger.continue_execution().unwrap();
    assert_eq!(debugger.wait_for_process_exit().unwrap(), Some(0));
}

#[test]
fn test_callstack_after_frame_pointer_push() {
    let program = nested_calls();
    // push rbp の直後、mov rbp, rsp の手前
    let pushed = program.function_address("Sub1").unwrap() + 1;
    let debugger = debugger(program);
    debugger.add_breakpoint_at(pushed).unwrap();

    start(&debugger);
    wait_pause(&debugger);
    let thread = debugger.current_thread().unwrap().id;
    let frames = debugger.callstack(thread).unwrap();
    let names: Vec<&str> = frames.iter().map(|f| f.function.as_str()).collect();
    assert_eq!(names, vec!["Sub1", "Main"]);
    assert_eq!(frames[1].segment.as_ref().map(|s| s.start_line), Some(4));

    debugger.continue_execution().unwrap();
    assert_eq!(debugger.wait_for_process_exit().unwrap(), Some(0));
}
