mod access;
mod cache;
mod calc;
mod db;
mod ipc;
mod optimistic;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser)]
#[command(name = "gradebookd")]
#[command(about = "Gradebook sidecar: JSON requests on stdin, responses on stdout", long_about = None)]
struct Cli {
    /// Workspace directory to open before reading requests
    #[arg(long, value_name = "DIR")]
    workspace: Option<PathBuf>,

    /// Log filter directives (overrides RUST_LOG), e.g. "gradebookd=debug"
    #[arg(long, value_name = "FILTER")]
    log_filter: Option<String>,
}

fn log_filter(cli: &Cli) -> EnvFilter {
    if let Some(directives) = cli.log_filter.as_deref() {
        match EnvFilter::try_new(directives) {
            Ok(f) => return f,
            Err(e) => eprintln!("ignoring --log-filter {directives:?}: {e}"),
        }
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout carries the protocol; logs go to stderr only.
    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .with_writer(io::stderr)
        .with_filter(log_filter(&cli));
    tracing_subscriber::registry().with(stderr_layer).init();

    let mut state = ipc::AppState::new();
    if let Some(dir) = cli.workspace.as_deref() {
        ipc::select_workspace(&mut state, dir)
            .with_context(|| format!("open workspace {}", dir.display()))?;
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "gradebookd ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "stdin closed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // No id to echo back.
                tracing::warn!(error = %e, "unparseable request line");
                let reply = json!({
                    "id": null,
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() },
                });
                let _ = writeln!(stdout, "{}", reply);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
    Ok(())
}
