//! Daemon lifecycle: PID-file ownership, signals, the run loop, and the
//! periodic sync cycle.
//!
//! States: Starting → Running → Stopping → Stopped. `Starting` acquires
//! the PID file with exclusive-create semantics; a stale file (owner not
//! alive) is removed once and retried, a live owner makes this process
//! exit non-zero. The run loop owns the exclusive storage connection and
//! drives three concerns: the RPC server, the file watcher, and the
//! scheduled sync tick.

use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{
    self, ConfigPaths, KEY_AUTO_COMMIT, KEY_AUTO_PUSH, META_BD_VERSION, META_JSONL_HASH,
};
use crate::error::{BeadsError, Result};
use crate::logging::DaemonLog;
use crate::storage::SqliteStorage;
use crate::sync::debounce::FlushController;
use crate::sync::export::{export_to_jsonl, ExportConfig};
use crate::sync::git;
use crate::sync::import::{import_from_jsonl, ImportOptions};
use crate::sync::snapshot::{SnapshotKind, SnapshotManager};
use crate::sync::watcher::FileWatcher;
use crate::sync::{auto_import_if_empty, compute_jsonl_hash};
use crate::util::is_truthy;

use super::server::{self, ServerCtx};

/// Hard ceiling on one sync cycle.
pub const SYNC_CYCLE_DEADLINE: Duration = Duration::from_secs(120);
/// Deadline for each individual git call inside a cycle.
const GIT_CALL_DEADLINE: Duration = Duration::from_secs(60);

/// Lifecycle phases, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonPhase {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Whether a process with this PID is alive (signal 0 probe).
#[must_use]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

/// Read an ASCII decimal PID file.
#[must_use]
pub fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()?
        .trim()
        .parse::<u32>()
        .ok()
}

/// Exclusive PID-file ownership. The file exists exactly while the owning
/// daemon is alive; dropping removes it.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    pid: u32,
}

impl PidFile {
    /// Acquire with exclusive-create semantics. A stale file (owner dead)
    /// is removed once and the create retried; a live owner is a
    /// [`BeadsError::DaemonRunning`] conflict.
    pub fn acquire(path: &Path) -> Result<Self> {
        match Self::try_create(path) {
            Ok(pidfile) => Ok(pidfile),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if let Some(owner) = read_pid(path) {
                    if process_alive(owner) {
                        return Err(BeadsError::DaemonRunning { pid: owner });
                    }
                }
                // stale: remove once and retry; a second conflict means we
                // raced another starter and they won
                tracing::info!(path = %path.display(), "removing stale daemon.pid");
                std::fs::remove_file(path)?;
                match Self::try_create(path) {
                    Ok(pidfile) => Ok(pidfile),
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                        let pid = read_pid(path).unwrap_or(0);
                        Err(BeadsError::DaemonRunning { pid })
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn try_create(path: &Path) -> std::io::Result<Self> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let pid = std::process::id();
        writeln!(file, "{pid}")?;
        file.sync_all()?;
        Ok(Self {
            path: path.to_path_buf(),
            pid,
        })
    }

    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        // only remove our own file; a crashed-and-replaced daemon must not
        // delete its successor's
        if read_pid(&self.path) == Some(self.pid) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Settings snapshot read once per cycle.
struct CycleSettings {
    auto_commit: bool,
    auto_push: bool,
}

/// Run the daemon until a signal or RPC shutdown.
///
/// Returns `Err` when startup fails or the RPC server dies unexpectedly
/// (so a supervisor can restart the process); a requested shutdown is
/// `Ok`.
#[allow(clippy::too_many_lines)]
pub async fn run(paths: ConfigPaths) -> Result<()> {
    let log = Arc::new(DaemonLog::open(&paths.daemon_log_path())?);
    log.log(&format!("daemon starting (pid {})", std::process::id()));
    let phase = Arc::new(Mutex::new(DaemonPhase::Starting));

    let _pidfile = match PidFile::acquire(&paths.pid_path()) {
        Ok(pidfile) => pidfile,
        Err(e) => {
            log.log(&format!("startup failed: {e}"));
            return Err(e);
        }
    };

    // Exclusive storage connection for the daemon's lifetime.
    let mut storage = SqliteStorage::open(&paths.db_path)?;
    storage.set_metadata(META_BD_VERSION, env!("CARGO_PKG_VERSION"))?;
    if let Some(outcome) = auto_import_if_empty(&mut storage, &paths, "daemon")? {
        log.log(&format!(
            "auto-imported {} issues from {:?}",
            outcome.result.created, outcome.source
        ));
    }

    let debounce = config::flush_debounce(&storage);
    let tick = config::sync_interval(&storage);
    let storage = Arc::new(Mutex::new(storage));
    let flush = Arc::new(FlushController::new(
        Arc::clone(&storage),
        paths.jsonl_path.clone(),
        debounce,
    ));

    // Socket: a stale file from a crashed daemon would shadow us. The PID
    // file is authoritative for liveness, so removing it here is safe.
    let socket_path = paths.socket_path();
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }
    let listener = tokio::net::UnixListener::bind(&socket_path)
        .map_err(|e| BeadsError::Rpc {
            reason: format!("failed to bind {}: {e}", socket_path.display()),
        })?;

    let root = CancellationToken::new();
    let shutdown_requested = CancellationToken::new();
    let ctx = Arc::new(ServerCtx {
        storage: Arc::clone(&storage),
        flush: Arc::clone(&flush),
        paths: paths.clone(),
        shutdown: shutdown_requested.clone(),
        phase: Arc::clone(&phase),
        started: std::time::Instant::now(),
    });
    let mut server_handle = tokio::spawn(server::serve(listener, Arc::clone(&ctx), root.child_token()));

    // Watcher feeds the same trigger the timer does.
    let (watch_tx, mut watch_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
    let repo_dir = paths.beads_dir.parent().map(Path::to_path_buf);
    let refs_dir = repo_dir.as_deref().and_then(git::refs_heads_dir);
    let watcher = FileWatcher::new(paths.jsonl_path.clone(), refs_dir, move || {
        let _ = watch_tx.send(());
    });
    if let Err(e) = watcher.start(&root) {
        log.log(&format!("file watcher unavailable: {e}"));
    }

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;

    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await; // immediate first tick consumed at startup

    *phase.lock() = DaemonPhase::Running;
    log.log(&format!(
        "daemon running on {} (sync every {}s)",
        socket_path.display(),
        tick.as_secs()
    ));

    let mut exit: Result<()> = Ok(());
    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                log.log("SIGTERM received; shutting down");
                break;
            }
            _ = sigint.recv() => {
                log.log("SIGINT received; shutting down");
                break;
            }
            _ = sighup.recv() => {
                // reserved for config reload
                log.log("SIGHUP ignored");
            }
            () = shutdown_requested.cancelled() => {
                log.log("shutdown requested over RPC");
                break;
            }
            joined = &mut server_handle => {
                let detail = match joined {
                    Ok(()) => "rpc server terminated".to_string(),
                    Err(e) => format!("rpc server panicked: {e}"),
                };
                log.log(&format!("{detail}; exiting for restart"));
                exit = Err(BeadsError::Rpc { reason: detail });
                break;
            }
            _ = interval.tick() => {
                run_sync_cycle(&storage, &paths, &log).await;
            }
            received = watch_rx.recv() => {
                if received.is_some() {
                    log.log("external change detected");
                    run_sync_cycle(&storage, &paths, &log).await;
                }
            }
        }
    }

    *phase.lock() = DaemonPhase::Stopping;
    root.cancel();
    watcher.close();
    flush.flush_now();
    if exit.is_ok() {
        server_handle.abort();
    }
    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }
    *phase.lock() = DaemonPhase::Stopped;
    log.log("daemon stopped");
    exit
}

/// One bounded sync cycle: export, commit, pull, re-import, push.
async fn run_sync_cycle(
    storage: &Arc<Mutex<SqliteStorage>>,
    paths: &ConfigPaths,
    log: &Arc<DaemonLog>,
) {
    match tokio::time::timeout(SYNC_CYCLE_DEADLINE, sync_cycle(storage, paths)).await {
        Err(_) => log.log("sync cycle abandoned: deadline exceeded"),
        Ok(Err(e)) => log.log(&format!("sync cycle failed: {e}")),
        Ok(Ok(summary)) => {
            if !summary.is_empty() {
                log.log(&format!("sync cycle: {summary}"));
            }
        }
    }
}

/// One sync cycle outside the daemon loop (the `bd sync` command).
pub async fn sync_once(storage: Arc<Mutex<SqliteStorage>>, paths: &ConfigPaths) -> Result<String> {
    tokio::time::timeout(SYNC_CYCLE_DEADLINE, sync_cycle(&storage, paths))
        .await
        .map_err(|_| BeadsError::Timeout {
            operation: "sync cycle".to_string(),
        })?
}

async fn sync_cycle(storage: &Arc<Mutex<SqliteStorage>>, paths: &ConfigPaths) -> Result<String> {
    let settings = {
        let store = storage.lock();
        CycleSettings {
            auto_commit: store
                .get_config(KEY_AUTO_COMMIT)?
                .as_deref()
                .map(is_truthy)
                .unwrap_or(false),
            auto_push: store
                .get_config(KEY_AUTO_PUSH)?
                .as_deref()
                .map(is_truthy)
                .unwrap_or(false),
        }
    };

    let repo = paths
        .beads_dir
        .parent()
        .filter(|dir| git::in_work_tree(dir))
        .map(Path::to_path_buf);
    let mut summary = Vec::new();

    // 1. Fold in external edits (the watcher case) before the export can
    // overwrite them. No deletion detection here: without a pull there is
    // no merged state to diff against.
    if jsonl_changed(storage, paths)? {
        let result = {
            let mut store = storage.lock();
            import_from_jsonl(&mut store, &paths.jsonl_path, &daemon_import_options())?
        };
        summary.push(format!(
            "picked up {} new, {} updated",
            result.created, result.updated
        ));
    }

    // 2. Export. Failure aborts the cycle: pulling over unexported local
    // mutations could lose them. A quiet store skips the write so the
    // watcher does not chase the daemon's own exports around in a loop.
    let needs_export = !paths.jsonl_path.exists() || {
        let store = storage.lock();
        !store.get_dirty_issue_ids()?.is_empty()
    };
    if needs_export {
        let mut store = storage.lock();
        let result = export_to_jsonl(&mut store, &paths.jsonl_path, &ExportConfig::default())?;
        summary.push(format!("exported {}", result.exported));
    }

    // 3. Commit the exported JSONL. Non-fatal.
    if let Some(ref repo) = repo {
        if settings.auto_commit {
            let jsonl = paths.jsonl_path.to_string_lossy().into_owned();
            if let Err(e) = git::git_command_async(&["add", &jsonl], repo, GIT_CALL_DEADLINE).await
            {
                tracing::warn!(error = %e, "git add failed");
            } else {
                match git::git_command_async(
                    &["commit", "-q", "-m", "bd: sync issues", "--", &jsonl],
                    repo,
                    GIT_CALL_DEADLINE,
                )
                .await
                {
                    Ok(_) => summary.push("committed".to_string()),
                    // nothing-to-commit is routine; anything else is a warning
                    Err(e) => tracing::debug!(error = %e, "git commit skipped"),
                }
            }
        }
    }

    // 4. Snapshot bookkeeping: a valid base plus a left capture of the
    // just-exported local state, then pull.
    let head = repo.as_deref().and_then(git::head_commit);
    let snapshots = SnapshotManager::new(paths);
    if snapshots
        .validate(SnapshotKind::Base, head.as_deref())
        .is_err()
    {
        snapshots.initialize(head.as_deref())?;
    }
    snapshots.capture_left(head.as_deref())?;

    if let Some(ref repo) = repo {
        match git::git_command_async(&["pull", "-q"], repo, GIT_CALL_DEADLINE).await {
            Ok(_) => summary.push("pulled".to_string()),
            Err(e) => tracing::warn!(error = %e, "git pull failed"),
        }
    }

    // 5. Re-import the merged state, honoring remote deletions the local
    // side never touched.
    if jsonl_changed(storage, paths)? {
        let accepted = snapshots.compute_accepted_deletions(&paths.jsonl_path)?;
        let result = {
            let mut store = storage.lock();
            let result =
                import_from_jsonl(&mut store, &paths.jsonl_path, &daemon_import_options())?;
            if !accepted.is_empty() {
                let removed = store.remove_accepted_deletions(&accepted, "daemon")?;
                summary.push(format!("deleted {removed}"));
            }
            result
        };
        summary.push(format!(
            "imported {} new, {} updated, {} unchanged",
            result.created, result.updated, result.unchanged
        ));
    }

    // 6. New baseline after a successful import pass.
    let head_after = repo.as_deref().and_then(git::head_commit);
    snapshots.update_base(head_after.as_deref())?;

    // 7. Push, only in tandem with auto-commit.
    if let Some(ref repo) = repo {
        if settings.auto_push && settings.auto_commit {
            match git::git_command_async(&["push", "-q"], repo, GIT_CALL_DEADLINE).await {
                Ok(_) => summary.push("pushed".to_string()),
                Err(e) => tracing::warn!(error = %e, "git push failed"),
            }
        }
    }

    Ok(summary.join(", "))
}

fn daemon_import_options() -> ImportOptions {
    ImportOptions {
        resolve_collisions: true,
        skip_prefix_validation: true,
        actor: "daemon".to_string(),
        ..ImportOptions::default()
    }
}

/// Whether the JSONL on disk differs from the last state the engine
/// exported or imported.
fn jsonl_changed(storage: &Arc<Mutex<SqliteStorage>>, paths: &ConfigPaths) -> Result<bool> {
    if !paths.jsonl_path.exists() {
        return Ok(false);
    }
    let file_hash = compute_jsonl_hash(&paths.jsonl_path)?;
    let known_hash = {
        let store = storage.lock();
        store.get_metadata(META_JSONL_HASH)?.unwrap_or_default()
    };
    Ok(file_hash != known_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn pid_probe_on_self_and_nonexistent() {
        assert!(process_alive(std::process::id()));
        // above any realistic pid_max
        assert!(!process_alive(u32::try_from(i32::MAX).unwrap()));
    }

    #[test]
    fn acquire_writes_ascii_pid() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("daemon.pid");

        let pidfile = PidFile::acquire(&path).unwrap();
        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert_eq!(on_disk.trim(), pidfile.pid().to_string());

        drop(pidfile);
        assert!(!path.exists());
    }

    #[test]
    fn second_acquire_against_live_owner_fails() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("daemon.pid");

        let _held = PidFile::acquire(&path).unwrap();
        // our own pid is alive, so this conflicts
        let err = PidFile::acquire(&path).unwrap_err();
        assert!(matches!(err, BeadsError::DaemonRunning { .. }));
        // and the loser must not have altered the file
        assert_eq!(read_pid(&path), Some(std::process::id()));
    }

    #[test]
    fn stale_pid_file_is_replaced_once() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("daemon.pid");
        std::fs::write(&path, format!("{}\n", i32::MAX)).unwrap();

        let pidfile = PidFile::acquire(&path).unwrap();
        assert_eq!(read_pid(&path), Some(pidfile.pid()));
    }

    #[test]
    fn garbage_pid_file_is_treated_as_stale() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("daemon.pid");
        std::fs::write(&path, "not a pid\n").unwrap();

        let pidfile = PidFile::acquire(&path).unwrap();
        assert_eq!(read_pid(&path), Some(pidfile.pid()));
    }

    #[test]
    fn drop_leaves_foreign_pid_file_alone() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("daemon.pid");

        let pidfile = PidFile::acquire(&path).unwrap();
        // successor took over the path (simulated)
        std::fs::write(&path, "424242\n").unwrap();
        drop(pidfile);
        assert!(path.exists());
    }
}
