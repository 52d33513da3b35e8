//! RPC client: socket dialing, daemon auto-start, back-off, and the
//! direct-mode fallback decision.
//!
//! Clients never block indefinitely on a daemon. The dial/health budget is
//! 200 ms; if the socket is dead and auto-start is allowed, the client
//! takes `.startlock` (exclusive-create, stale-by-PID removal), spawns the
//! daemon binary detached, and waits up to 5 s for the socket to come up.
//! Start failures are recorded in a small JSON file next to the socket so
//! the fleet of short-lived CLI processes shares one exponential back-off
//! schedule (5 s base, doubling, capped at 120 s).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::{Duration, Instant};

use crate::config::{ConfigPaths, ENV_DAEMON_FOREGROUND, Session};
use crate::error::{BeadsError, ErrorKind, Result};
use crate::storage::SqliteStorage;

use super::lifecycle::process_alive;
use super::protocol::{methods, read_frame, write_frame, Request, Response};

/// Budget for dialing and health-probing an existing socket.
pub const DIAL_TIMEOUT: Duration = Duration::from_millis(200);
/// How long an auto-starting client waits for the socket to come up.
pub const START_WAIT: Duration = Duration::from_secs(5);
/// I/O deadline for a regular RPC call once connected.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// Auto-start back-off: base, doubling per failure, capped.
pub const BACKOFF_BASE: Duration = Duration::from_secs(5);
pub const BACKOFF_CAP: Duration = Duration::from_secs(120);

static LEGACY_SOCKET_WARNING: Once = Once::new();
static FALLBACK_WARNING: Once = Once::new();

/// Print the one-line direct-mode warning, at most once per process.
pub fn warn_direct_fallback(reason: &str) {
    FALLBACK_WARNING.call_once(|| {
        eprintln!("Warning: Daemon unreachable ({reason}); falling back to direct mode");
    });
}

/// A connected (or at least connectable) daemon endpoint.
#[derive(Debug, Clone)]
pub struct RpcClient {
    socket_path: PathBuf,
}

impl RpcClient {
    #[must_use]
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    /// One request/response exchange.
    ///
    /// An `unsupported` envelope maps to [`BeadsError::UnsupportedMethod`]
    /// so callers can treat it as a capability miss rather than a failure.
    pub fn call(&self, method: &str, args: Value) -> Result<Value> {
        let stream = UnixStream::connect(&self.socket_path).map_err(|e| BeadsError::Rpc {
            reason: format!("connect {}: {e}", self.socket_path.display()),
        })?;
        stream.set_read_timeout(Some(CALL_TIMEOUT))?;
        stream.set_write_timeout(Some(CALL_TIMEOUT))?;

        let mut stream = stream;
        let payload = serde_json::to_vec(&Request::new(method, args))?;
        write_frame(&mut stream, &payload).map_err(|e| BeadsError::Rpc {
            reason: format!("send: {e}"),
        })?;

        let raw = read_frame(&mut stream).map_err(|e| BeadsError::Rpc {
            reason: format!("receive: {e}"),
        })?;
        let response: Response = serde_json::from_slice(&raw)?;

        match response.into_result() {
            Err(BeadsError::Remote {
                kind: ErrorKind::Unsupported,
                ..
            }) => Err(BeadsError::UnsupportedMethod {
                method: method.to_string(),
            }),
            other => other,
        }
    }

    /// Health probe within the dial budget.
    #[must_use]
    pub fn probe(&self) -> bool {
        let Ok(stream) = UnixStream::connect(&self.socket_path) else {
            return false;
        };
        if stream.set_read_timeout(Some(DIAL_TIMEOUT)).is_err()
            || stream.set_write_timeout(Some(DIAL_TIMEOUT)).is_err()
        {
            return false;
        }
        let mut stream = stream;
        let Ok(payload) = serde_json::to_vec(&Request::new(methods::HEALTH, Value::Null)) else {
            return false;
        };
        if write_frame(&mut stream, &payload).is_err() {
            return false;
        }
        let Ok(raw) = read_frame(&mut stream) else {
            return false;
        };
        serde_json::from_slice::<Response>(&raw)
            .map(|r| r.ok)
            .unwrap_or(false)
    }
}

// === Back-off bookkeeping ===

/// Persisted dial-failure state (`bd.sock.backoff`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackoffState {
    pub failures: u32,
    pub next_attempt_at: DateTime<Utc>,
}

/// Delay before the next auto-start attempt after `failures` failures.
#[must_use]
pub fn backoff_delay(failures: u32) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let doubled = BACKOFF_BASE.saturating_mul(2u32.saturating_pow(failures.min(16) - 1));
    doubled.min(BACKOFF_CAP)
}

fn load_backoff(path: &Path) -> Option<BackoffState> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

fn record_failure(path: &Path) {
    let failures = load_backoff(path).map_or(0, |s| s.failures) + 1;
    let state = BackoffState {
        failures,
        next_attempt_at: Utc::now()
            + chrono::Duration::from_std(backoff_delay(failures)).unwrap_or_default(),
    };
    if let Ok(raw) = serde_json::to_vec(&state) {
        let _ = std::fs::write(path, raw);
    }
}

fn clear_backoff(path: &Path) {
    let _ = std::fs::remove_file(path);
}

fn in_backoff(path: &Path) -> bool {
    load_backoff(path).is_some_and(|state| Utc::now() < state.next_attempt_at)
}

// === Start lock ===

/// Exclusive-create lock ensuring at most one client attempts auto-start.
struct StartLock {
    path: PathBuf,
    pid: u32,
}

impl StartLock {
    /// `None` when another live process holds the lock.
    fn acquire(path: &Path) -> Option<Self> {
        for _ in 0..2 {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(mut file) => {
                    let pid = std::process::id();
                    let _ = writeln!(file, "{pid}");
                    return Some(Self {
                        path: path.to_path_buf(),
                        pid,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let owner = std::fs::read_to_string(path)
                        .ok()
                        .and_then(|s| s.trim().parse::<u32>().ok());
                    match owner {
                        Some(pid) if process_alive(pid) => return None,
                        // stale or garbage: remove and retry once
                        _ => {
                            let _ = std::fs::remove_file(path);
                        }
                    }
                }
                Err(_) => return None,
            }
        }
        None
    }
}

impl Drop for StartLock {
    fn drop(&mut self) {
        let ours = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
            == Some(self.pid);
        if ours {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

// === Connection establishment ===

fn warn_legacy_socket(paths: &ConfigPaths) {
    let Some(home) = std::env::var_os("HOME") else {
        return;
    };
    let legacy = PathBuf::from(home).join(".beads").join("bd.sock");
    if legacy.exists() && legacy != paths.socket_path() {
        LEGACY_SOCKET_WARNING.call_once(|| {
            eprintln!(
                "Warning: legacy global socket at {} is ignored; sockets now live next to the database",
                legacy.display()
            );
        });
    }
}

/// Try to reach a running daemon without starting one.
#[must_use]
pub fn connect(session: &Session) -> Option<RpcClient> {
    if !session.daemon_enabled() {
        return None;
    }
    warn_legacy_socket(&session.paths);

    let socket_path = session.paths.socket_path();
    if !socket_path.exists() {
        return None;
    }
    let client = RpcClient::new(socket_path);
    client.probe().then_some(client)
}

/// Reach a daemon, auto-starting one if allowed. `storage` supplies the
/// `auto-start-daemon` config; `None` means the caller could not open
/// storage (the daemon holds it), in which case auto-start is moot anyway.
pub fn connect_or_start(session: &Session, storage: Option<&SqliteStorage>) -> Option<RpcClient> {
    if let Some(client) = connect(session) {
        clear_backoff(&session.paths.backoff_path());
        return Some(client);
    }
    if !session.daemon_enabled() {
        return None;
    }
    let auto_start = storage.is_some_and(|s| session.auto_start_enabled(s));
    if !auto_start {
        return None;
    }

    let backoff_path = session.paths.backoff_path();
    if in_backoff(&backoff_path) {
        tracing::debug!("auto-start suppressed by back-off");
        return None;
    }

    let Some(_lock) = StartLock::acquire(&session.paths.startlock_path()) else {
        // someone else is starting it; give their daemon one dial's grace
        std::thread::sleep(DIAL_TIMEOUT);
        return connect(session);
    };

    if let Err(e) = spawn_detached(&session.paths) {
        tracing::warn!(error = %e, "failed to spawn daemon");
        record_failure(&backoff_path);
        return None;
    }

    // Wait up to START_WAIT for the socket to become dialable.
    let deadline = Instant::now() + START_WAIT;
    let client = RpcClient::new(session.paths.socket_path());
    while Instant::now() < deadline {
        if client.probe() {
            clear_backoff(&backoff_path);
            return Some(client);
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    record_failure(&backoff_path);
    None
}

/// Spawn `bd daemon run` detached: own process group, stdio to /dev/null,
/// marked as the foreground child via the environment.
pub fn spawn_detached(paths: &ConfigPaths) -> Result<()> {
    use std::os::unix::process::CommandExt;

    let exe = std::env::current_exe()?;
    let mut command = std::process::Command::new(exe);
    command
        .args(["daemon", "run"])
        .env(ENV_DAEMON_FOREGROUND, "1")
        .env(crate::config::ENV_DB, &paths.db_path)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .process_group(0);
    command.spawn()?;
    Ok(())
}
