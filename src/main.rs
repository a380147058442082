mod config;
mod db;
mod grading;
mod ipc;
mod ranking;
mod store;

use clap::Parser;
use std::io::{self, BufRead, Write};
use tracing_subscriber::EnvFilter;

fn init_tracing(filter: &str) {
    // Stdout carries the protocol; logs go to stderr only.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();
}

fn write_response(out: &mut impl Write, resp: &serde_json::Value) -> io::Result<()> {
    let line = serde_json::to_string(resp).unwrap_or_else(|_| "{\"ok\":false}".to_string());
    writeln!(out, "{}", line)?;
    out.flush()
}

/// One request per line in, one response per line out, until input closes.
fn serve(state: &mut ipc::AppState, input: impl BufRead, mut out: impl Write) -> io::Result<()> {
    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let resp = match serde_json::from_str::<ipc::Request>(&line) {
            Ok(req) => ipc::handle_request(state, req),
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed request line");
                ipc::bad_json(&e)
            }
        };
        write_response(&mut out, &resp)?;
    }
    Ok(())
}

fn main() {
    let cli = config::Cli::parse();
    init_tracing(&cli.log_filter);

    let mut state = ipc::AppState::default();
    if let Some(path) = cli.workspace.as_ref() {
        match state.open_workspace(path) {
            Ok(()) => {
                tracing::info!(workspace = %path.display(), "workspace opened from config");
            }
            Err(e) => {
                tracing::error!(workspace = %path.display(), error = %e, "failed to open configured workspace");
            }
        }
    }

    let stdin = io::stdin();
    if let Err(e) = serve(&mut state, stdin.lock(), io::stdout()) {
        tracing::error!(error = %e, "stdio closed");
    }
}
