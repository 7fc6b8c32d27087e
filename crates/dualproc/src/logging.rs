//! Logging setup for worker executables.
//!
//! The worker's stdout carries the IPC channel, so everything goes to stderr,
//! which the broker passes through to its own terminal.
//!
//! # Environment Variables
//!
//! - `DUALPROC_LOG` - Log filter (overrides RUST_LOG)
//! - `RUST_LOG` - Standard Rust log filter (fallback)

use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

/// Environment variable holding the worker's log filter.
pub const LOG_ENV: &str = "DUALPROC_LOG";

/// Build the log filter for a worker from the environment.
///
/// Without any filter in the environment only warnings are shown; `verbose`
/// raises that default to debug. A filter set in the environment always wins.
pub fn worker_filter(verbose: bool) -> EnvFilter {
    let spec = std::env::var(LOG_ENV)
        .or_else(|_| std::env::var(EnvFilter::DEFAULT_ENV))
        .unwrap_or_default();
    filter_from(&spec, verbose)
}

fn filter_from(spec: &str, verbose: bool) -> EnvFilter {
    let default = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    EnvFilter::builder()
        .with_default_directive(default.into())
        .parse_lossy(spec)
}

/// Install a stderr subscriber for the worker process.
///
/// Does nothing if a global subscriber is already installed.
pub fn init_worker(verbose: bool) {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(worker_filter(verbose))
        .with_target(false)
        .try_init();
}
