//! Tracing setup: one sink per process, chosen at startup.
//!
//! Nodes prefer an append-only log file under the XDG state directory so a
//! long-running master's history survives restarts; when that file cannot
//! be opened (read-only home, containers without a state dir) the
//! subscriber writes to stderr instead. `RUST_LOG` overrides the filter.

use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,dvt_core=debug,dvt_cli=debug";

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

fn open_state_log() -> anyhow::Result<(std::fs::File, PathBuf)> {
    let path = xdg::BaseDirectories::with_prefix("dvt")?.place_state_file("node.log")?;
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok((file, path))
}

/// Install the process-wide subscriber. Infallible by construction: the
/// stderr sink is the fallback, not an error path the caller handles.
pub fn init() {
    match open_state_log() {
        Ok((file, path)) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .init();
            tracing::debug!(log = %path.display(), "logging to state dir");
        }
        Err(err) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(io::stderr)
                .with_ansi(false)
                .init();
            tracing::debug!("state-dir log unavailable ({err:#}), logging to stderr");
        }
    }
}
