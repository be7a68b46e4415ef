//! ndbg CLI - コマンドラインインターフェース
//!
//! ネイティブプロセスデバッガ ndbg のREPLインターフェース

use anyhow::Result;
use clap::{Parser, Subcommand};
use ndbg_core::{
    BreakpointLocation, Command, Debugger, DebuggerConfig, DebuggerError, InfoTarget, MarshalMode,
    StackFrame, Variable,
};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// ndbg - Native Process Debugger
#[derive(Parser)]
#[command(name = "ndbg")]
#[command(version = "0.1.0")]
#[command(about = "Source-level debugger for native processes", long_about = None)]
struct Cli {
    /// Run debugger calls on the REPL thread instead of a dedicated control thread
    #[arg(long, global = true)]
    manual_marshal: bool,

    /// How long the event loop waits for a native event per iteration
    #[arg(long, global = true, default_value_t = 10)]
    poll_interval_ms: u64,

    /// Maximum number of frames in a backtrace
    #[arg(long, global = true, default_value_t = 256)]
    max_frames: usize,

    #[command(subcommand)]
    command: DebugCommand,
}

#[derive(Subcommand)]
enum DebugCommand {
    /// Launch and debug an executable
    Run {
        /// Path to the executable binary
        binary: PathBuf,

        /// Working directory of the debuggee (defaults to the current directory)
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Breakpoints to set before the program starts (file:line or 0xADDR)
        #[arg(short, long = "break")]
        breakpoints: Vec<String>,

        /// Arguments to pass to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

impl Cli {
    fn config(&self) -> DebuggerConfig {
        let mode = if self.manual_marshal {
            MarshalMode::Manual
        } else {
            MarshalMode::Automatic
        };
        DebuggerConfig::default()
            .with_marshal_mode(mode)
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms.max(1)))
            .with_max_frames(self.max_frames)
    }
}

fn main() -> Result<()> {
    // ログはデバッグ対象の出力と混ざらないように stderr へ
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    println!("ndbg - Native Process Debugger");
    println!("Version 0.1.0");
    println!();

    let cli = Cli::parse();
    let config = cli.config();
    tracing::debug!("Debugger configuration: {:?}", config);
    let debugger = Debugger::native(config)?;
    debugger.on_log_message(|line| {
        print!("{}", line);
        let _ = std::io::stdout().flush();
    });

    match cli.command {
        DebugCommand::Run {
            binary,
            cwd,
            breakpoints,
            args,
        } => {
            for location in &breakpoints {
                match Command::parse(&format!("break {}", location)) {
                    Some(Command::Break(location)) => handle_break(&debugger, location)?,
                    _ => eprintln!("Invalid breakpoint location: {}", location),
                }
            }

            let cwd = match cwd {
                Some(cwd) => cwd,
                None => std::env::current_dir()?,
            };
            println!("Starting {}", binary.display());
            println!();
            debugger.start(binary, cwd, &args)?;
        }
    }

    if wait_and_report(&debugger)? {
        run_repl(&debugger)?;
    }
    Ok(())
}

/// REPLループを実行する
fn run_repl(debugger: &Debugger) -> Result<()> {
    println!("Type 'help' for available commands, 'quit' to exit.");
    println!();

    let mut rl = DefaultEditor::new()?;

    loop {
        let readline = rl.readline("(ndbg) ");
        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                rl.add_history_entry(line)?;

                match handle_command(debugger, line) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => eprintln!("Error: {}", e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    if debugger.is_paused() || debugger.is_running() {
        debugger.terminate()?;
    }
    Ok(())
}

/// コマンドを実行する。REPL を続けるなら true
fn handle_command(debugger: &Debugger, line: &str) -> Result<bool> {
    let Some(command) = Command::parse(line) else {
        println!("Unknown command: {}", line);
        println!("Type 'help' for available commands.");
        return Ok(true);
    };

    match command {
        Command::Help => print_help(),
        Command::Quit => {
            println!("Goodbye!");
            return Ok(false);
        }
        Command::Break(location) => handle_break(debugger, location)?,
        Command::Delete(id) => match debugger.breakpoint(id)? {
            Some(breakpoint) => {
                debugger.remove_breakpoint(&breakpoint)?;
                println!("Deleted breakpoint {}", id);
            }
            None => println!("No breakpoint {}", id),
        },
        Command::Enable(id) | Command::Disable(id) => match debugger.breakpoint(id)? {
            Some(breakpoint) => {
                let enable = matches!(command, Command::Enable(_));
                breakpoint.set_enabled(enable);
                println!(
                    "Breakpoint {} {}",
                    id,
                    if enable { "enabled" } else { "disabled" }
                );
            }
            None => println!("No breakpoint {}", id),
        },
        Command::Continue => {
            println!("Continuing execution...");
            debugger.continue_execution()?;
            return wait_and_report(debugger);
        }
        Command::Step => {
            debugger.step_into()?;
            return wait_and_report(debugger);
        }
        Command::Next => {
            debugger.step_over()?;
            return wait_and_report(debugger);
        }
        Command::Finish => {
            debugger.step_out()?;
            return wait_and_report(debugger);
        }
        Command::Backtrace => {
            let thread = debugger.current_thread()?.id;
            for frame in debugger.callstack(thread)? {
                println!("  {}", describe_frame(&frame));
            }
        }
        Command::Args => {
            let frame = debugger.current_function()?;
            print_variables("arguments", &debugger.arguments(&frame)?);
        }
        Command::Locals => {
            let frame = debugger.current_function()?;
            print_variables("locals", &debugger.locals(&frame)?);
        }
        Command::Info(target) => handle_info(debugger, target)?,
    }

    Ok(true)
}

/// Breakコマンドを処理する
fn handle_break(debugger: &Debugger, location: BreakpointLocation) -> Result<()> {
    let breakpoint = match &location {
        BreakpointLocation::Source { file, line } => debugger.add_breakpoint(file, *line)?,
        BreakpointLocation::Address(address) => debugger.add_breakpoint_at(*address)?,
    };
    match breakpoint.address() {
        Some(address) => println!(
            "Breakpoint {} set at {} (0x{:x})",
            breakpoint.id(),
            location,
            address
        ),
        None => println!(
            "Breakpoint {} pending at {} (no loaded code yet)",
            breakpoint.id(),
            location
        ),
    }
    Ok(())
}

fn handle_info(debugger: &Debugger, target: InfoTarget) -> Result<()> {
    match target {
        InfoTarget::Breakpoints => {
            let breakpoints = debugger.breakpoints()?;
            if breakpoints.is_empty() {
                println!("No breakpoints");
            }
            for bp in breakpoints {
                let at = match (bp.source_segment(), bp.address()) {
                    (Some(segment), Some(address)) => format!("{} (0x{:x})", segment, address),
                    (None, Some(address)) => format!("0x{:x}", address),
                    _ => "pending".to_string(),
                };
                println!(
                    "  {}. {} [{}] {} hits: {}",
                    bp.id(),
                    bp.location(),
                    if bp.is_enabled() { "enabled" } else { "disabled" },
                    at,
                    bp.hit_count()
                );
            }
        }
        InfoTarget::Modules => {
            for module in debugger.modules()? {
                println!(
                    "  0x{:016x} {:>10} {}{}",
                    module.base,
                    module.size,
                    module.path.display(),
                    if module.symbols_loaded { "" } else { " (no symbols)" }
                );
            }
        }
        InfoTarget::Threads => {
            for thread in debugger.threads()? {
                println!(
                    "{} Thread {}",
                    if thread.is_current { "*" } else { " " },
                    thread.id
                );
            }
        }
    }
    Ok(())
}

/// 停止または終了を待って表示する。デバッグ対象が生きていれば true
fn wait_and_report(debugger: &Debugger) -> Result<bool> {
    match debugger.wait_for_pause() {
        Ok(()) => {
            let reason = debugger.paused_reason()?;
            println!();
            println!("Stopped ({:?})", reason);
            match debugger.current_function() {
                Ok(frame) => println!("  {}", describe_frame(&frame)),
                Err(e) => println!("  (location unavailable: {})", e),
            }
            Ok(true)
        }
        Err(DebuggerError::ProcessExited { code }) => {
            println!();
            match code {
                Some(code) => println!("Process exited with code {}", code),
                None => println!("Process exited"),
            }
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

fn describe_frame(frame: &StackFrame) -> String {
    let location = match &frame.segment {
        Some(segment) => segment.to_string(),
        None => format!("0x{:x}", frame.pc),
    };
    format!("#{} {} at {}", frame.index, frame.function, location)
}

fn print_variables(title: &str, variables: &[Variable]) {
    if variables.is_empty() {
        println!("No {}", title);
        return;
    }
    for variable in variables {
        println!("  {}: {} = {}", variable.name, variable.type_name, variable.value);
    }
}

fn print_help() {
    println!("Available commands:");
    println!();
    println!("  help           - Show this help message");
    println!("  quit/exit/q    - Exit the debugger");
    println!();
    println!("Breakpoints:");
    println!("  break <loc>    - Set breakpoint at file:line or address");
    println!("  delete <id>    - Delete a breakpoint");
    println!("  enable <id>    - Enable a breakpoint");
    println!("  disable <id>   - Disable a breakpoint");
    println!();
    println!("Execution:");
    println!("  continue (c)   - Continue execution");
    println!("  step (s)       - Step into the next line");
    println!("  next (n)       - Step over the next line");
    println!("  finish (f)     - Run until the current function returns");
    println!();
    println!("Inspection:");
    println!("  backtrace (bt) - Show the call stack");
    println!("  args (a)       - Show arguments of the current function");
    println!("  locals (l)     - Show local variables of the current function");
    println!("  info breakpoints|modules|threads");
    println!();
    println!("Examples:");
    println!("  break src/main.rs:42");
    println!("  break 0x401136");
}
