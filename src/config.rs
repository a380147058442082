use clap::Parser;
use std::path::PathBuf;

/// Exam results sidecar: newline-delimited JSON requests on stdin, responses on stdout.
#[derive(Debug, Parser)]
#[command(name = "exambookd", version)]
pub struct Cli {
    /// Workspace directory to open at start-up instead of waiting for `workspace.select`.
    #[arg(long, env = "EXAMBOOKD_WORKSPACE")]
    pub workspace: Option<PathBuf>,

    /// Log filter for stderr output, e.g. `info` or `exambookd=debug`.
    #[arg(long = "log", env = "EXAMBOOKD_LOG", default_value = "info")]
    pub log_filter: String,
}
