//! Tansa CLI
//!
//! スクリプトの起動、実行中プロセスへのアタッチ、対話型コントローラを提供します。

mod console;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tansa_attach::{exit_code, inject, AttachAgent};
use tansa_core::{DebuggerConfig, InterceptionStrategy};
use tansa_proto::connect_and_serve;
use tansa_script::{ScriptError, ScriptRuntime};
use tracing_subscriber::EnvFilter;

/// ログレベルを指定する環境変数
const ENV_LOG: &str = "TANSA_LOG";

/// Tansa - runtime debugger for interpreted scripts
#[derive(Parser)]
#[command(name = "tansa")]
#[command(version)]
#[command(about = "Runtime debugger for interpreted scripts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: TansaCommand,
}

#[derive(Subcommand)]
enum TansaCommand {
    /// Run a script under the debugger
    Run {
        /// Path to the script
        script: PathBuf,

        /// Connect to a controller before the script starts
        #[arg(long, value_name = "HOST:PORT")]
        connect: Option<String>,

        /// Interception strategy (auto, trace, frame-eval)
        #[arg(long)]
        interception: Option<InterceptionStrategy>,

        /// Files or directories (ending with '/') that are never traced
        #[arg(long = "dont-trace", value_name = "PATH")]
        dont_trace: Vec<String>,
    },

    /// Ask a running process to connect to a controller
    Attach {
        /// Process ID of the target
        #[arg(short, long)]
        pid: u32,

        /// Controller host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Controller port
        #[arg(long, default_value_t = 5678)]
        port: u16,

        /// Seconds to wait for the target to respond
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },

    /// Wait for a debuggee and control it interactively
    Listen {
        /// Port to listen on
        #[arg(short, long, default_value_t = 5678)]
        port: u16,
    },
}

fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    match cli.command {
        TansaCommand::Run {
            script,
            connect,
            interception,
            dont_trace,
        } => {
            let mut config = DebuggerConfig::from_env()?;
            if let Some(strategy) = interception {
                config.interception = strategy;
            }
            config.dont_trace.extend(dont_trace);
            let code = run_script(&script, connect.as_deref(), config)?;
            std::process::exit(code);
        }
        TansaCommand::Attach {
            pid,
            host,
            port,
            timeout,
        } => {
            let address = format!("{}:{}", host, port);
            let result = inject(pid, &address, Duration::from_secs(timeout));
            match &result {
                Ok(()) => println!("Process {} connected to {}", pid, address),
                Err(e) => eprintln!("Error: {}", e),
            }
            std::process::exit(exit_code(&result));
        }
        TansaCommand::Listen { port } => {
            let listener = TcpListener::bind(("127.0.0.1", port))
                .with_context(|| format!("failed to listen on port {}", port))?;
            println!("Waiting for a debuggee on {}", listener.local_addr()?);
            let (stream, peer) = listener.accept()?;
            println!("Debuggee connected from {}", peer);
            console::run(stream)?;
        }
    }

    Ok(())
}

/// `TANSA_LOG` に従ってログを標準エラーへ出す（既定は warn）
fn init_logging() {
    let filter = EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// スクリプトを実行し、終了コードを返す
///
/// 接続先があれば開始前に接続します。どちらの場合もアタッチ要求を受け付け、
/// セッションが生きている間の要求は拒否されます。
fn run_script(script: &Path, connect: Option<&str>, config: DebuggerConfig) -> Result<i32> {
    let runtime = ScriptRuntime::new();
    let agent = Arc::new(AttachAgent::new(Arc::new(runtime.clone()), config.clone()));
    agent.arm()?;

    match connect {
        Some(address) => {
            let session = connect_and_serve(Arc::new(runtime.clone()), config, address)
                .with_context(|| format!("failed to start a debug session with {}", address))?;
            agent.adopt(session);
        }
        None => eprintln!(
            "tansa: running {} as pid {} (attach with `tansa attach --pid {}`)",
            script.display(),
            std::process::id(),
            std::process::id()
        ),
    }

    let weak: Weak<AttachAgent> = Arc::downgrade(&agent);
    runtime.set_safepoint(Some(Arc::new(move || {
        if let Some(agent) = weak.upgrade() {
            agent.poll();
        }
    })));
    let result = runtime.run_file(script);
    runtime.set_safepoint(None);
    agent.process_exiting(status_code(&result));

    match &result {
        Err(ScriptError::Uncaught { .. }) | Ok(()) => {}
        Err(e) => eprintln!("Error: {}", e),
    }
    Ok(status_code(&result))
}

fn status_code(result: &tansa_script::Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(_) => 1,
    }
}
