//! Logging setup.
//!
//! CLI invocations log to stderr through `tracing` with an env-filter;
//! `BD_DEBUG` turns on debug traces. The daemon additionally appends
//! human-readable lines to `.beads/daemon.log` in the
//! `[YYYY-MM-DD HH:MM:SS] message` format so the log survives restarts
//! and is greppable without tooling.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use crate::error::Result;
use crate::util::env_truthy;

/// Initialize the stderr tracing subscriber.
///
/// Level resolution: `RUST_LOG` if set, else debug when `BD_DEBUG` is
/// truthy or `verbose` is passed, else warn (info with `-v`).
pub fn init_logging(verbose: bool, quiet: bool) -> Result<()> {
    let default_level = if quiet {
        "error"
    } else if verbose || env_truthy("BD_DEBUG") {
        "debug"
    } else {
        "warn"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("beads={default_level},bd={default_level}")));

    // A second init (tests, library reuse) is not an error worth surfacing.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();

    Ok(())
}

/// Append-only daemon log file.
///
/// Lines are flushed per write; the daemon holds one instance for its
/// whole lifetime and every subsystem logs through it.
#[derive(Debug)]
pub struct DaemonLog {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl DaemonLog {
    /// Open (creating if needed) the log file in append mode.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one `[YYYY-MM-DD HH:MM:SS] message` line.
    pub fn log(&self, message: &str) {
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let mut file = self.file.lock();
        if writeln!(file, "[{stamp}] {message}").is_err() {
            tracing::warn!("failed to append to daemon log");
        }
        let _ = file.flush();
    }
}
