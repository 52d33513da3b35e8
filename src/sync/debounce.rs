//! Debounced flushing: coalesce mutation bursts into one JSONL export.
//!
//! Every mutation calls [`FlushController::mark_dirty`]; the debouncer
//! fires once the burst goes quiet and the controller exports the whole
//! database. Export failures back off exponentially so a wedged filesystem
//! does not turn into a busy loop.

use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::storage::SqliteStorage;

use super::export::{export_to_jsonl, ExportConfig};

/// Consecutive failures after which the pipeline reports itself wedged.
const FAILURE_DIAGNOSTIC_THRESHOLD: u32 = 3;
/// Ceiling for the failure back-off.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Coalesces rapid triggers into a single action invocation, fired
/// `duration` after the *last* trigger.
///
/// A monotonic sequence token guards against stale timers: each trigger
/// bumps the sequence, and a timer only fires if its token is still
/// current when it wakes. The action is never invoked while the internal
/// lock is held.
pub struct Debouncer {
    inner: Arc<DebounceInner>,
}

struct DebounceInner {
    duration: Duration,
    state: Mutex<DebounceState>,
    action: Box<dyn Fn() + Send + Sync>,
}

#[derive(Default)]
struct DebounceState {
    seq: u64,
    cancelled: bool,
}

impl Debouncer {
    pub fn new(duration: Duration, action: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(DebounceInner {
                duration,
                state: Mutex::new(DebounceState::default()),
                action: Box::new(action),
            }),
        }
    }

    /// Arm (or re-arm) the timer. Must be called within a tokio runtime.
    pub fn trigger(&self) {
        let seq = {
            let mut state = self.inner.state.lock();
            state.cancelled = false;
            state.seq += 1;
            state.seq
        };
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(inner.duration).await;
            let fire = {
                let state = inner.state.lock();
                state.seq == seq && !state.cancelled
            };
            // Lock dropped before the action runs.
            if fire {
                (inner.action)();
            }
        });
    }

    /// Disarm any pending timer. Safe to call repeatedly.
    pub fn cancel(&self) {
        self.inner.state.lock().cancelled = true;
    }
}

/// Exponential back-off for consecutive flush failures.
#[must_use]
pub fn failure_backoff(failures: u32, base: Duration) -> Duration {
    let shift = failures.min(6);
    let delay = base.saturating_mul(2u32.saturating_pow(shift));
    delay.min(MAX_BACKOFF)
}

struct FlushShared {
    storage: Arc<Mutex<SqliteStorage>>,
    jsonl_path: PathBuf,
    debounce: Duration,
    state: Mutex<FlushState>,
}

#[derive(Default)]
struct FlushState {
    dirty: bool,
    full_export: bool,
    failures: u32,
}

/// The flush pipeline: dirty marking, debounced export, failure back-off.
pub struct FlushController {
    shared: Arc<FlushShared>,
    debouncer: Debouncer,
}

impl FlushController {
    pub fn new(
        storage: Arc<Mutex<SqliteStorage>>,
        jsonl_path: PathBuf,
        debounce: Duration,
    ) -> Self {
        let shared = Arc::new(FlushShared {
            storage,
            jsonl_path,
            debounce,
            state: Mutex::new(FlushState::default()),
        });
        let action_shared = Arc::clone(&shared);
        let debouncer = Debouncer::new(debounce, move || {
            flush(&action_shared);
        });
        Self { shared, debouncer }
    }

    /// Record a mutation and (re-)arm the flush timer.
    pub fn mark_dirty(&self) {
        self.shared.state.lock().dirty = true;
        self.debouncer.trigger();
    }

    /// Record a bulk change (deletion, import) that must rewrite the file
    /// even past the export safety guards.
    pub fn mark_dirty_full(&self) {
        {
            let mut state = self.shared.state.lock();
            state.dirty = true;
            state.full_export = true;
        }
        self.debouncer.trigger();
    }

    /// Synchronous flush, bypassing the debounce (shutdown path).
    pub fn flush_now(&self) {
        self.debouncer.cancel();
        self.shared.state.lock().dirty = true;
        flush(&self.shared);
    }

    /// Consecutive failures so far (0 when healthy).
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.shared.state.lock().failures
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.shared.state.lock().dirty
    }
}

fn flush(shared: &Arc<FlushShared>) {
    let full_export = {
        let state = shared.state.lock();
        if !state.dirty {
            return;
        }
        state.full_export
    };

    let result = {
        let mut storage = shared.storage.lock();
        export_to_jsonl(
            &mut storage,
            &shared.jsonl_path,
            &ExportConfig {
                force: full_export,
                ..ExportConfig::default()
            },
        )
    };

    match result {
        Ok(export) => {
            let mut state = shared.state.lock();
            state.dirty = false;
            state.full_export = false;
            state.failures = 0;
            tracing::debug!(exported = export.exported, "flush complete");
        }
        Err(e) => {
            let failures = {
                let mut state = shared.state.lock();
                state.failures += 1;
                state.failures
            };
            if failures == FAILURE_DIAGNOSTIC_THRESHOLD {
                tracing::error!(
                    failures,
                    error = %e,
                    "flush pipeline wedged; backing off (JSONL is stale until this clears)"
                );
            } else {
                tracing::warn!(failures, error = %e, "flush failed");
            }

            let delay = failure_backoff(failures, shared.debounce);
            let retry_shared = Arc::clone(shared);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if retry_shared.state.lock().dirty {
                    flush(&retry_shared);
                }
            });
        }
    }
}
