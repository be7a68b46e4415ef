//! コールスタックと変数のテスト

mod common;

use common::*;
use ndbg_core::{Debugger, DebuggerError, Primitive, Value};

fn paused_in_func() -> Debugger {
    let debugger = debugger(argument_variables());
    debugger.add_breakpoint("Program.cs", 12).unwrap();
    start(&debugger);
    wait_pause(&debugger);
    debugger
}

#[test]
fn test_callstack_of_nested_calls() {
    let debugger = debugger(nested_calls());
    debugger.add_breakpoint("Program.cs", 14).unwrap();
    start(&debugger);
    wait_pause(&debugger);

    let thread = debugger.current_thread().unwrap();
    assert!(thread.is_current);
    let frames = debugger.callstack(thread.id).unwrap();
    let names: Vec<&str> = frames.iter().map(|f| f.function.as_str()).collect();
    assert_eq!(names, vec!["Sub2", "Sub1", "Main"]);

    // 呼び出し元のフレームは呼び出しを行った行を指す
    let lines: Vec<u32> = frames
        .iter()
        .map(|f| f.segment.as_ref().unwrap().start_line)
        .collect();
    assert_eq!(lines, vec![14, 9, 4]);
    assert!(frames.iter().all(|f| f.module.as_deref() == Some("Program.exe")));
    assert!(frames.windows(2).all(|w| w[0].fp < w[1].fp));
    assert_eq!(frames[0].index, 0);
    assert_eq!(frames[2].index, 2);

    assert!(matches!(
        debugger.callstack(9999),
        Err(DebuggerError::ThreadNotFound(9999))
    ));
    debugger.terminate().unwrap();
}

#[test]
fn test_callstack_respects_max_frames() {
    let config = ndbg_core::DebuggerConfig::default().with_max_frames(2);
    let debugger = Debugger::simulated(nested_calls(), config).unwrap();
    debugger.add_breakpoint("Program.cs", 14).unwrap();
    start(&debugger);
    wait_pause(&debugger);

    let thread = debugger.current_thread().unwrap().id;
    assert_eq!(debugger.callstack(thread).unwrap().len(), 2);
    debugger.terminate().unwrap();
}

#[test]
fn test_function_argument_variables() {
    let debugger = paused_in_func();
    let expected_strings = [Some("a"), None, Some("c")];

    for (round, expected) in expected_strings.iter().enumerate() {
        if round > 0 {
            debugger.continue_execution().unwrap();
            wait_pause(&debugger);
        }
        let frame = debugger.current_function().unwrap();
        assert_eq!(frame.function, "Func");

        let arguments = debugger.arguments(&frame).unwrap();
        let names: Vec<&str> = arguments.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["i", "s", "args"]);

        assert_eq!(
            arguments[0].value,
            Value::Primitive(Primitive::Int(round as i64 + 1))
        );
        match expected {
            Some(text) => assert_eq!(arguments[1].value, Value::String(text.to_string())),
            None => assert!(arguments[1].value.is_null()),
        }

        let array = arguments[2].value.as_array().unwrap();
        assert_eq!(array.len(), round);
        for index in 0..array.len() {
            assert!(matches!(
                debugger.array_element(array, index).unwrap(),
                Value::Primitive(Primitive::Int(_))
            ));
        }
        assert!(matches!(
            debugger.array_element(array, round),
            Err(DebuggerError::IndexOutOfRange { .. })
        ));
    }

    debugger.continue_execution().unwrap();
    assert_eq!(debugger.wait_for_process_exit().unwrap(), Some(0));
}

#[test]
fn test_array_element_values() {
    let debugger = paused_in_func();
    for _ in 0..2 {
        debugger.continue_execution().unwrap();
        wait_pause(&debugger);
    }

    let frame = debugger.current_function().unwrap();
    let arguments = debugger.arguments(&frame).unwrap();
    let array = arguments[2].value.as_array().unwrap();
    let values: Vec<Value> = (0..array.len())
        .map(|i| debugger.array_element(array, i).unwrap())
        .collect();
    assert_eq!(
        values,
        vec![
            Value::Primitive(Primitive::Int(8)),
            Value::Primitive(Primitive::Int(9))
        ]
    );
    assert_eq!(arguments[2].value.as_string(), "i32[2]");
    debugger.terminate().unwrap();
}

#[test]
fn test_locals() {
    let debugger = paused_in_func();
    let frame = debugger.current_function().unwrap();
    let locals = debugger.locals(&frame).unwrap();

    let names: Vec<&str> = locals.iter().map(|v| v.name.as_str()).collect();
    assert_eq!(names, vec!["flag", "owner"]);
    assert_eq!(locals[0].value, Value::Primitive(Primitive::Bool(true)));
    assert!(locals[1].value.is_null());
    assert_eq!(locals[1].value.as_string(), "null");
    debugger.terminate().unwrap();
}

#[test]
fn test_stale_frame_after_resume() {
    let debugger = paused_in_func();
    let frame = debugger.current_function().unwrap();
    let arguments = debugger.arguments(&frame).unwrap();
    let array = arguments[2].value.as_array().unwrap().clone();

    debugger.continue_execution().unwrap();
    wait_pause(&debugger);

    assert!(matches!(
        debugger.arguments(&frame),
        Err(DebuggerError::StaleFrame { .. })
    ));
    assert!(matches!(
        debugger.locals(&frame),
        Err(DebuggerError::StaleFrame { .. })
    ));
    assert!(matches!(
        debugger.array_element(&array, 0),
        Err(DebuggerError::StaleFrame { .. })
    ));

    // 新しい停止で読み直せば使える
    let frame = debugger.current_function().unwrap();
    assert_eq!(debugger.arguments(&frame).unwrap().len(), 3);
    debugger.terminate().unwrap();
}

#[test]
fn test_inspection_requires_pause() {
    let debugger = paused_in_func();
    let frame = debugger.current_function().unwrap();
    let thread = frame.thread;
    debugger.terminate().unwrap();

    assert!(matches!(
        debugger.callstack(thread),
        Err(DebuggerError::InvalidState { .. })
    ));
    assert!(matches!(
        debugger.arguments(&frame),
        Err(DebuggerError::StaleFrame { .. })
    ));
}
