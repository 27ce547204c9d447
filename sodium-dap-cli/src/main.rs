//! Sodium DAP CLI - コマンドラインインターフェース
//!
//! Sodiumデバッガブリッジ sodium-dap のREPLインターフェース

use anyhow::{Context, Result};
use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use sodium_dap_core::config::DEFAULT_SESSION_ID;
use sodium_dap_core::{
    DebugEvent, PathSanitizer, SessionConfig, SodiumBridge, VariableScope,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Sodium DAP - Sodium Debugger Bridge
#[derive(Parser)]
#[command(name = "sodium-dap")]
#[command(version = "0.1.0")]
#[command(about = "Interactive bridge to the Sodium debugger console protocol", long_about = None)]
struct Cli {
    /// Path to the SodiumDebugger executable
    #[arg(long, default_value = r"C:\projects\Sodium\Setup\SodiumDebugger.exe")]
    debugger: PathBuf,

    /// Working directory for the debugger process
    #[arg(long, default_value = r"C:\projects\Sodium\Setup")]
    cwd: PathBuf,

    /// Sodium session id (prompted interactively when omitted)
    #[arg(long)]
    session_id: Option<String>,

    /// Log every command and reply
    #[arg(long)]
    trace: bool,

    /// Step once after attaching instead of running freely
    #[arg(long)]
    stop_on_entry: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.trace { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    println!("Sodium DAP - Sodium Debugger Bridge");
    println!("Version 0.1.0");
    println!();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let config = SessionConfig {
        debugger_path: cli.debugger,
        working_dir: cli.cwd,
        session_id: cli.session_id,
        trace: cli.trace,
    };

    let (bridge, events) = {
        let _guard = runtime.enter();
        SodiumBridge::connect(
            config,
            PathSanitizer::default(),
            Box::new(prompt_session_id),
        )?
    };
    let bridge = Arc::new(bridge);

    runtime.spawn(print_events(events, bridge.clone()));

    // セッションIDを確定させる（未指定なら対話プロンプト）
    if bridge.initialize().is_none() {
        eprintln!("Warning: no session id supplied; attach will be rejected");
    }

    println!("Set breakpoints, then 'done' and 'attach' to start the session.");
    run_repl(&runtime, &bridge, cli.stop_on_entry)?;

    bridge.terminate();
    Ok(())
}

/// セッションIDの対話プロンプト
fn prompt_session_id() -> Option<String> {
    print!("Sodium Session Id [{}]: ", DEFAULT_SESSION_ID);
    let _ = std::io::stdout().flush();

    let mut input = String::new();
    if std::io::stdin().read_line(&mut input).is_err() {
        return None;
    }
    let trimmed = input.trim();
    if trimmed.is_empty() {
        Some(DEFAULT_SESSION_ID.to_string())
    } else {
        Some(trimmed.to_string())
    }
}

/// ブリッジのイベントを整形して表示する
async fn print_events(mut events: mpsc::UnboundedReceiver<DebugEvent>, bridge: Arc<SodiumBridge>) {
    while let Some(event) = events.recv().await {
        match event {
            DebugEvent::Initialized => println!("Session initialized"),
            DebugEvent::StoppedEntry => println!("Stopped on entry"),
            DebugEvent::StoppedStep => println!("Stopped after step"),
            DebugEvent::StoppedBreakpoint => {
                let stop = bridge.stop_location();
                match stop.breakpoint_id {
                    Some(id) => println!(
                        "Breakpoint {} hit: {} at {}:{}",
                        id, stop.procedure, stop.file, stop.line
                    ),
                    None => println!("Stopped at {}:{}", stop.file, stop.line),
                }
            }
            DebugEvent::StoppedDataBreakpoint => println!("Stopped on data breakpoint"),
            DebugEvent::StoppedException => println!("Stopped on exception"),
            DebugEvent::BreakpointValidated { id, verified } => {
                println!("Breakpoint {} verified: {}", id, verified);
            }
            DebugEvent::Output { text, .. } => println!("{}", text),
            DebugEvent::Terminated => println!("Debug session ended"),
        }
    }
}

/// REPLループを実行する
fn run_repl(
    runtime: &tokio::runtime::Runtime,
    bridge: &Arc<SodiumBridge>,
    stop_on_entry: bool,
) -> Result<()> {
    println!("Type 'help' for available commands, 'quit' to exit.");
    println!();

    let mut rl = DefaultEditor::new()?;

    loop {
        let readline = rl.readline("(sodium) ");
        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                rl.add_history_entry(line)?;

                if let Err(e) = handle_command(runtime, bridge, stop_on_entry, line) {
                    eprintln!("Error: {}", e);
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

    Ok(())
}

fn handle_command(
    runtime: &tokio::runtime::Runtime,
    bridge: &Arc<SodiumBridge>,
    stop_on_entry: bool,
    line: &str,
) -> Result<()> {
    let head = line.split_whitespace().next().unwrap_or("");
    let rest = line[head.len()..].trim();

    match head {
        "help" | "h" | "?" => print_help(),
        "quit" | "q" | "exit" => handle_quit(bridge),
        "done" => bridge.configuration_done(),
        "attach" => runtime.block_on(bridge.attach(stop_on_entry))?,
        "break" | "b" => handle_break(runtime, bridge, rest)?,
        "clear" => handle_clear(runtime, bridge, rest)?,
        "delete" => handle_delete(bridge, rest)?,
        "info" => handle_info(bridge, rest),
        "continue" | "c" => runtime.block_on(bridge.continue_exec())?,
        "next" | "n" => runtime.block_on(bridge.next())?,
        "step" | "s" => runtime.block_on(bridge.step_in())?,
        "finish" | "f" => runtime.block_on(bridge.step_out())?,
        "backtrace" | "bt" => handle_backtrace(runtime, bridge)?,
        "locals" | "l" => handle_variables(runtime, bridge, VariableScope::Locals)?,
        "args" => handle_variables(runtime, bridge, VariableScope::Args)?,
        "globals" => handle_variables(runtime, bridge, VariableScope::Globals)?,
        "whatis" | "w" => handle_whatis(runtime, bridge, rest)?,
        "frame" => handle_frame(runtime, bridge, rest)?,
        _ => {
            println!("Unknown command: {}", line);
            println!("Type 'help' for available commands.");
        }
    }

    Ok(())
}

/// Quitコマンドを処理する
fn handle_quit(bridge: &Arc<SodiumBridge>) {
    bridge.terminate();
    println!("Goodbye!");
    std::process::exit(0);
}

/// Breakコマンドを処理する
fn handle_break(
    runtime: &tokio::runtime::Runtime,
    bridge: &Arc<SodiumBridge>,
    loc: &str,
) -> Result<()> {
    let (path, line) = split_location(loc)?;
    let bp = runtime.block_on(bridge.set_breakpoint(path, line))?;
    println!(
        "Breakpoint {} set at {}:{} (awaiting confirmation)",
        bp.provisional_id, path, line
    );
    Ok(())
}

/// Clearコマンドを処理する
fn handle_clear(
    runtime: &tokio::runtime::Runtime,
    bridge: &Arc<SodiumBridge>,
    path: &str,
) -> Result<()> {
    if path.is_empty() {
        println!("Usage: clear <file>");
        return Ok(());
    }
    let removed = runtime.block_on(bridge.clear_breakpoints(path))?;
    println!("Removed {} breakpoint(s) from {}", removed, path);
    Ok(())
}

/// Deleteコマンドを処理する（ローカルのみ）
fn handle_delete(bridge: &Arc<SodiumBridge>, loc: &str) -> Result<()> {
    let (path, line) = split_location(loc)?;
    match bridge.remove_breakpoint(path, line) {
        Some(bp) => println!("Deleted breakpoint {} at {}:{}", bp.id(), path, line),
        None => println!("No breakpoint at {}:{}", path, line),
    }
    Ok(())
}

/// Infoコマンドを処理する
fn handle_info(bridge: &Arc<SodiumBridge>, path: &str) {
    if path.is_empty() {
        println!("Usage: info <file>");
        return;
    }
    let lines = bridge.breakpoint_locations(path);
    if lines.is_empty() {
        println!("No breakpoints in {}", path);
        return;
    }
    println!("Breakpoints in {}:", path);
    for line in lines {
        println!("  line {}", line);
    }
}

/// Backtraceコマンドを処理する
fn handle_backtrace(runtime: &tokio::runtime::Runtime, bridge: &Arc<SodiumBridge>) -> Result<()> {
    let frames = runtime.block_on(bridge.request_stack(0, 1000))?;
    if frames.is_empty() {
        println!("No stack frames");
        return Ok(());
    }
    for (i, frame) in frames.iter().enumerate() {
        println!("  #{} {} at {}:{}", i, frame.name, frame.file, frame.line);
    }
    Ok(())
}

/// 変数問い合わせコマンドを処理する
fn handle_variables(
    runtime: &tokio::runtime::Runtime,
    bridge: &Arc<SodiumBridge>,
    scope: VariableScope,
) -> Result<()> {
    let variables = runtime.block_on(bridge.request_variables(scope))?;
    if variables.is_empty() {
        println!("No variables");
        return Ok(());
    }
    for var in &variables {
        println!(
            "  {} = {} ({})",
            var.name,
            var.value,
            var.type_name.as_deref().unwrap_or("?")
        );
    }
    Ok(())
}

/// Whatisコマンドを処理する
fn handle_whatis(
    runtime: &tokio::runtime::Runtime,
    bridge: &Arc<SodiumBridge>,
    expr: &str,
) -> Result<()> {
    if expr.is_empty() {
        println!("Usage: whatis <expression>");
        return Ok(());
    }
    let value = runtime.block_on(bridge.evaluate(expr))?;
    println!("{} = {}", expr, value);
    Ok(())
}

/// Frameコマンドを処理する
fn handle_frame(
    runtime: &tokio::runtime::Runtime,
    bridge: &Arc<SodiumBridge>,
    index: &str,
) -> Result<()> {
    let index: u32 = index.parse().context("Usage: frame <index>")?;
    runtime.block_on(bridge.set_frame(index))?;
    println!("Selected frame {}", index);
    Ok(())
}

/// `<file>:<line>` 形式の位置指定をパースする
fn split_location(loc: &str) -> Result<(&str, u32)> {
    let (path, line) = loc
        .rsplit_once(':')
        .context("expected a <file>:<line> location")?;
    let line = line.trim().parse().context("line must be a number")?;
    Ok((path, line))
}

fn print_help() {
    println!("Available commands:");
    println!();
    println!("  help            - Show this help message");
    println!("  quit/exit/q     - Kill the debugger and exit");
    println!();
    println!("Session commands:");
    println!("  break <f>:<l>   - Set a breakpoint (b)");
    println!("  clear <f>       - Clear all breakpoints in a file");
    println!("  delete <f>:<l>  - Forget a single breakpoint");
    println!("  info <f>        - List breakpoint lines in a file");
    println!("  done            - Signal that configuration is finished");
    println!("  attach          - Attach to the Sodium session and start");
    println!();
    println!("Execution commands:");
    println!("  continue (c)    - Continue execution");
    println!("  next (n)        - Step over");
    println!("  step (s)        - Step in");
    println!("  finish (f)      - Step out");
    println!();
    println!("Inspection commands:");
    println!("  backtrace (bt)  - Show the stack frames");
    println!("  locals (l)      - Show local variables");
    println!("  args            - Show procedure arguments");
    println!("  globals         - Show global variables");
    println!("  whatis <expr>   - Evaluate an expression (w)");
    println!("  frame <n>       - Select a stack frame");
    println!();
    println!("Examples:");
    println!("  break main.sqlx:6");
    println!("  whatis nTotal");
    println!("  frame 0");
}
