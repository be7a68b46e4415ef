//! ndbg でデバッグするためのサンプルプログラム
//!
//! 第1引数でシナリオを選びます。行番号はテストから参照されるので、関数の位置を動かさないこと。

use nix::sys::signal::{raise, Signal};
use std::hint::black_box;

fn main() {
    let scenario = std::env::args().nth(1).unwrap_or_default();
    match scenario.as_str() {
        "SimpleProgram" => {}
        "HelloWorld" => println!("Hello world!"),
        "Break" => {
            let _ = raise(Signal::SIGTRAP);
            println!("after break");
        }
        "Breakpoint" => breakpoint(),
        "Stepping" | "Callstack" => sub1(),
        "FunctionArgumentVariables" => {
            function_argument_variables(1, "a", &[]);
            function_argument_variables(2, "", &[7]);
            function_argument_variables(3, "c", &[8, 9]);
        }
        other => {
            eprintln!("unknown scenario: {}", other);
            std::process::exit(2);
        }
    }
}

#[inline(never)]
fn breakpoint() {
    println!("Mark 1");
    black_box(0);
    println!("Mark 2");
}

#[inline(never)]
fn sub1() {
    sub2();
    black_box(1);
}

#[inline(never)]
fn sub2() {
    black_box(2);
    black_box(3);
}

#[inline(never)]
fn function_argument_variables(i: i32, s: &str, args: &[i32]) {
    black_box((i, s, args));
}
