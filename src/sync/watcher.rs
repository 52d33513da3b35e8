//! File watcher: notice external changes to `beads.jsonl` and the
//! repository's `refs/heads` tree.
//!
//! Two modes. Event mode subscribes to filesystem notifications via
//! `notify`, watching the *parent* directory of the JSONL so the watch
//! survives the exporter's remove-and-rename dance. Polling mode compares
//! modification time and size on an interval, for filesystems where
//! notifications are unavailable (network mounts, some containers).
//!
//! Raw events funnel through a debouncer so a burst of writes produces a
//! single callback invocation.

use notify::{RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;

use crate::error::{BeadsError, Result};

use super::debounce::Debouncer;

/// Floor for the polling interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Quiet period between a raw event and the callback.
const CALLBACK_DEBOUNCE: Duration = Duration::from_millis(100);

/// Watches the JSONL file (and optionally `refs/heads`) and invokes a
/// single-flight callback on change.
pub struct FileWatcher {
    jsonl_path: PathBuf,
    refs_dir: Option<PathBuf>,
    /// Use polling instead of filesystem events. Tests tune this.
    pub polling_mode: bool,
    /// Polling interval; clamped to [`MIN_POLL_INTERVAL`] outside tests.
    pub poll_interval: Duration,
    callback: Arc<dyn Fn() + Send + Sync>,
    // Some while running; dropping disarms the notify subscription.
    watcher: Mutex<Option<notify::RecommendedWatcher>>,
    stop: Mutex<Option<CancellationToken>>,
}

impl FileWatcher {
    pub fn new(
        jsonl_path: PathBuf,
        refs_dir: Option<PathBuf>,
        on_change: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            jsonl_path,
            refs_dir,
            polling_mode: false,
            poll_interval: MIN_POLL_INTERVAL,
            callback: Arc::new(on_change),
            watcher: Mutex::new(None),
            stop: Mutex::new(None),
        }
    }

    /// Start watching. Honors `token` for cancellation; `close` stops too.
    pub fn start(&self, token: &CancellationToken) -> Result<()> {
        let stop = token.child_token();
        *self.stop.lock() = Some(stop.clone());

        let debouncer = Arc::new(Debouncer::new(CALLBACK_DEBOUNCE, {
            let callback = Arc::clone(&self.callback);
            move || callback()
        }));

        if self.polling_mode {
            self.start_polling(stop, debouncer);
            return Ok(());
        }
        self.start_events(stop, &debouncer)
    }

    fn start_events(&self, stop: CancellationToken, debouncer: &Arc<Debouncer>) -> Result<()> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<()>();
        let jsonl_name = self
            .jsonl_path
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| BeadsError::Config("watch path has no file name".into()))?;
        let refs_dir = self.refs_dir.clone();

        let mut watcher = notify::recommended_watcher(
            move |event: std::result::Result<notify::Event, notify::Error>| {
                let Ok(event) = event else { return };
                let relevant = event.paths.iter().any(|p| {
                    p.file_name() == Some(jsonl_name.as_os_str())
                        || refs_dir.as_ref().is_some_and(|refs| p.starts_with(refs))
                });
                if relevant {
                    let _ = tx.send(());
                }
            },
        )
        .map_err(|e| BeadsError::Config(format!("failed to create file watcher: {e}")))?;

        // Watch the parent directory, not the file: the exporter replaces
        // the file via rename, and a file-level watch would die with the
        // old inode.
        let watch_dir = self
            .jsonl_path
            .parent()
            .ok_or_else(|| BeadsError::Config("watch path has no parent".into()))?;
        watcher
            .watch(watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| BeadsError::Config(format!("failed to watch {}: {e}", watch_dir.display())))?;
        if let Some(ref refs) = self.refs_dir {
            if refs.is_dir() {
                // branch tips move on pull/fetch; recursive for nested branch names
                if let Err(e) = watcher.watch(refs, RecursiveMode::Recursive) {
                    tracing::warn!(error = %e, "could not watch refs/heads; branch moves invisible");
                }
            }
        }
        *self.watcher.lock() = Some(watcher);

        let debouncer = Arc::clone(debouncer);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    received = rx.recv() => {
                        if received.is_none() {
                            break;
                        }
                        debouncer.trigger();
                    }
                }
            }
        });
        Ok(())
    }

    fn start_polling(&self, stop: CancellationToken, debouncer: Arc<Debouncer>) {
        let path = self.jsonl_path.clone();
        let interval = if cfg!(test) {
            self.poll_interval
        } else {
            self.poll_interval.max(MIN_POLL_INTERVAL)
        };

        tokio::spawn(async move {
            let mut last = stat(&path);
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    () = tokio::time::sleep(interval) => {
                        let current = stat(&path);
                        if current != last {
                            // change or disappearance, either way re-import
                            debouncer.trigger();
                            last = current;
                        }
                    }
                }
            }
        });
    }

    /// Stop watching. Idempotent; safe to call without `start`.
    pub fn close(&self) {
        if let Some(token) = self.stop.lock().take() {
            token.cancel();
        }
        *self.watcher.lock() = None;
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

/// (mtime, size) fingerprint; `None` when the file is gone.
fn stat(path: &std::path::Path) -> Option<(SystemTime, u64)> {
    let meta = std::fs::metadata(path).ok()?;
    let mtime = meta.modified().ok()?;
    Some((mtime, meta.len()))
}
