//! Configuration management for beads.
//!
//! Configuration sources and precedence (highest wins):
//! 1. CLI overrides
//! 2. Environment variables
//! 3. DB config table
//! 4. Defaults
//!
//! The `.beads` directory next to the repository root holds everything the
//! engine owns on disk; [`ConfigPaths`] resolves the individual file paths
//! and [`Session`] carries them (plus the CLI overrides) through command
//! handlers.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BeadsError, Result};
use crate::storage::SqliteStorage;
use crate::util::{env_falsy, env_truthy, is_truthy};

/// Directory name holding all engine-owned files.
pub const BEADS_DIR_NAME: &str = ".beads";

pub const DB_FILE: &str = "beads.db";
pub const JSONL_FILE: &str = "beads.jsonl";
/// Secondary JSONL name probed by the bootstrap.
pub const LEGACY_JSONL_FILE: &str = "issues.jsonl";
pub const SOCKET_FILE: &str = "bd.sock";
pub const PID_FILE: &str = "daemon.pid";
pub const DAEMON_LOG_FILE: &str = "daemon.log";
pub const BASE_SNAPSHOT_FILE: &str = "beads.base.jsonl";
pub const LEFT_SNAPSHOT_FILE: &str = "beads.left.jsonl";

// Environment variables.
pub const ENV_DB: &str = "BEADS_DB";
pub const ENV_NO_DAEMON: &str = "BEADS_NO_DAEMON";
pub const ENV_AUTO_START_DAEMON: &str = "BEADS_AUTO_START_DAEMON";
pub const ENV_DEBUG: &str = "BD_DEBUG";
pub const ENV_DAEMON_FOREGROUND: &str = "BD_DAEMON_FOREGROUND";

// Config table keys (user-visible).
pub const KEY_ISSUE_PREFIX: &str = "issue_prefix";
pub const KEY_AUTO_START_DAEMON: &str = "auto-start-daemon";
pub const KEY_FLUSH_DEBOUNCE: &str = "flush-debounce";
pub const KEY_AUTO_COMMIT: &str = "auto-commit";
pub const KEY_AUTO_PUSH: &str = "auto-push";
pub const KEY_SYNC_BRANCH: &str = "sync.branch";
pub const KEY_SYNC_INTERVAL: &str = "sync-interval";

// Metadata table keys (engine-owned).
pub const META_BD_VERSION: &str = "bd_version";
pub const META_JSONL_HASH: &str = "jsonl_hash";
pub const META_LAST_IMPORT: &str = "last_import_at";

/// Default debounce for the flush pipeline.
pub const DEFAULT_FLUSH_DEBOUNCE: Duration = Duration::from_millis(500);
/// Default daemon sync tick.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(300);

/// `.gitignore` seeded into a fresh `.beads` directory: the database, the
/// daemon's runtime files and the socket stay out of version control, the
/// JSONL files ride along.
pub const GITIGNORE_CONTENTS: &str = "*.db*\ndaemon.log\ndaemon.pid\nbd.sock\n.startlock\nbd.sock.backoff\n";

/// Resolved on-disk layout for a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPaths {
    pub beads_dir: PathBuf,
    pub db_path: PathBuf,
    pub jsonl_path: PathBuf,
}

impl ConfigPaths {
    /// Resolve paths from the beads directory plus overrides.
    ///
    /// Priority for the database path: CLI `--db`, `BEADS_DB`, then
    /// `<beads_dir>/beads.db`. The JSONL always sits next to the database.
    #[must_use]
    pub fn resolve(beads_dir: &Path, db_override: Option<&PathBuf>) -> Self {
        let db_path = db_override.cloned().or_else(db_path_from_env).map_or_else(
            || beads_dir.join(DB_FILE),
            |p| {
                if p.is_absolute() {
                    p
                } else {
                    beads_dir.join(p)
                }
            },
        );
        let jsonl_path = db_path
            .parent()
            .map_or_else(|| beads_dir.join(JSONL_FILE), |dir| dir.join(JSONL_FILE));
        Self {
            beads_dir: beads_dir.to_path_buf(),
            db_path,
            jsonl_path,
        }
    }

    #[must_use]
    pub fn socket_path(&self) -> PathBuf {
        self.sibling(SOCKET_FILE)
    }

    #[must_use]
    pub fn pid_path(&self) -> PathBuf {
        self.sibling(PID_FILE)
    }

    #[must_use]
    pub fn daemon_log_path(&self) -> PathBuf {
        self.sibling(DAEMON_LOG_FILE)
    }

    #[must_use]
    pub fn base_snapshot_path(&self) -> PathBuf {
        self.sibling(BASE_SNAPSHOT_FILE)
    }

    #[must_use]
    pub fn left_snapshot_path(&self) -> PathBuf {
        self.sibling(LEFT_SNAPSHOT_FILE)
    }

    /// Lock taken by a client that is auto-starting the daemon.
    #[must_use]
    pub fn startlock_path(&self) -> PathBuf {
        self.sibling(".startlock")
    }

    /// Dial-failure back-off state shared by short-lived clients.
    #[must_use]
    pub fn backoff_path(&self) -> PathBuf {
        self.sibling(format!("{SOCKET_FILE}.backoff"))
    }

    fn sibling(&self, name: impl AsRef<Path>) -> PathBuf {
        self.db_path
            .parent()
            .unwrap_or(&self.beads_dir)
            .join(name)
    }
}

fn db_path_from_env() -> Option<PathBuf> {
    env::var(ENV_DB)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

/// Discover the active `.beads` directory by walking up from `start`
/// (or the CWD). A `BEADS_DB` override skips discovery entirely and uses
/// the database's parent directory.
pub fn discover_beads_dir(start: Option<&Path>) -> Result<PathBuf> {
    if let Some(db) = db_path_from_env() {
        if let Some(parent) = db.parent() {
            if parent.is_dir() {
                return Ok(parent.to_path_buf());
            }
        }
    }

    let mut current = match start {
        Some(path) => path.to_path_buf(),
        None => env::current_dir()?,
    };

    loop {
        let candidate = current.join(BEADS_DIR_NAME);
        if candidate.is_dir() {
            return Ok(candidate);
        }
        if !current.pop() {
            break;
        }
    }

    Err(BeadsError::NotInitialized)
}

/// Create a fresh `.beads` directory with its `.gitignore`.
pub fn init_workspace(parent: &Path) -> Result<PathBuf> {
    let beads_dir = parent.join(BEADS_DIR_NAME);
    if beads_dir.exists() {
        return Err(BeadsError::AlreadyInitialized { path: beads_dir });
    }
    std::fs::create_dir_all(&beads_dir)?;
    std::fs::write(beads_dir.join(".gitignore"), GITIGNORE_CONTENTS)?;
    Ok(beads_dir)
}

/// CLI-level overrides threaded through every command.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub db: Option<PathBuf>,
    pub actor: Option<String>,
    pub json: bool,
    pub no_daemon: bool,
    pub no_auto_flush: bool,
    pub no_auto_import: bool,
}

/// Per-invocation application context: resolved paths plus overrides.
///
/// Commands receive a `Session` instead of reaching for process globals;
/// it owns the decision of where storage lives and who the actor is.
#[derive(Debug, Clone)]
pub struct Session {
    pub paths: ConfigPaths,
    pub overrides: CliOverrides,
}

impl Session {
    /// Discover the workspace and build a session.
    pub fn discover(overrides: CliOverrides) -> Result<Self> {
        let beads_dir = match overrides.db.as_ref().and_then(|p| p.parent()) {
            Some(parent) if parent.as_os_str().is_empty() => discover_beads_dir(None)?,
            Some(parent) => parent.to_path_buf(),
            None => discover_beads_dir(None)?,
        };
        let paths = ConfigPaths::resolve(&beads_dir, overrides.db.as_ref());
        Ok(Self { paths, overrides })
    }

    /// Build a session rooted at an explicit beads directory.
    #[must_use]
    pub fn at(beads_dir: &Path, overrides: CliOverrides) -> Self {
        let paths = ConfigPaths::resolve(beads_dir, overrides.db.as_ref());
        Self { paths, overrides }
    }

    /// Open the storage in-process (direct mode).
    pub fn open_storage(&self) -> Result<SqliteStorage> {
        SqliteStorage::open(&self.paths.db_path)
    }

    /// The actor recorded in audit events.
    #[must_use]
    pub fn actor(&self) -> String {
        self.overrides
            .actor
            .clone()
            .or_else(|| env::var("USER").ok())
            .or_else(|| env::var("USERNAME").ok())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Whether talking to (or starting) a daemon is allowed at all.
    #[must_use]
    pub fn daemon_enabled(&self) -> bool {
        !self.overrides.no_daemon && !env_truthy(ENV_NO_DAEMON)
    }

    /// Whether a missing daemon may be auto-started.
    pub fn auto_start_enabled(&self, storage: &SqliteStorage) -> bool {
        if !self.daemon_enabled() || env_falsy(ENV_AUTO_START_DAEMON) {
            return false;
        }
        match storage.get_config(KEY_AUTO_START_DAEMON) {
            Ok(Some(value)) => is_truthy(&value),
            // auto-start defaults on; only an explicit config or env opts out
            _ => true,
        }
    }
}

/// Read the flush debounce from config, falling back to the default.
pub fn flush_debounce(storage: &SqliteStorage) -> Duration {
    storage
        .get_config(KEY_FLUSH_DEBOUNCE)
        .ok()
        .flatten()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(DEFAULT_FLUSH_DEBOUNCE, Duration::from_millis)
}

/// Read the daemon sync interval from config, falling back to the default.
pub fn sync_interval(storage: &SqliteStorage) -> Duration {
    storage
        .get_config(KEY_SYNC_INTERVAL)
        .ok()
        .flatten()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(DEFAULT_SYNC_INTERVAL, Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn resolve_paths_default_layout() {
        let beads_dir = PathBuf::from("/repo/.beads");
        let paths = ConfigPaths::resolve(&beads_dir, None);
        assert_eq!(paths.db_path, beads_dir.join("beads.db"));
        assert_eq!(paths.jsonl_path, beads_dir.join("beads.jsonl"));
        assert_eq!(paths.socket_path(), beads_dir.join("bd.sock"));
        assert_eq!(paths.pid_path(), beads_dir.join("daemon.pid"));
        assert_eq!(paths.backoff_path(), beads_dir.join("bd.sock.backoff"));
    }

    #[test]
    fn resolve_paths_with_db_override() {
        let beads_dir = PathBuf::from("/repo/.beads");
        let db = PathBuf::from("/elsewhere/custom.db");
        let paths = ConfigPaths::resolve(&beads_dir, Some(&db));
        assert_eq!(paths.db_path, db);
        assert_eq!(paths.jsonl_path, PathBuf::from("/elsewhere/beads.jsonl"));
        assert_eq!(paths.socket_path(), PathBuf::from("/elsewhere/bd.sock"));
    }

    #[test]
    fn discover_walks_up() {
        let temp = TempDir::new().unwrap();
        let beads = temp.path().join(".beads");
        std::fs::create_dir(&beads).unwrap();
        let nested = temp.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();

        let found = discover_beads_dir(Some(&nested)).unwrap();
        assert_eq!(found.canonicalize().unwrap(), beads.canonicalize().unwrap());
    }

    #[test]
    fn discover_fails_outside_workspace() {
        let temp = TempDir::new().unwrap();
        let err = discover_beads_dir(Some(temp.path())).unwrap_err();
        assert!(matches!(err, BeadsError::NotInitialized));
    }

    #[test]
    fn init_creates_gitignore_once() {
        let temp = TempDir::new().unwrap();
        let beads_dir = init_workspace(temp.path()).unwrap();
        let gitignore = std::fs::read_to_string(beads_dir.join(".gitignore")).unwrap();
        assert!(gitignore.contains("daemon.pid"));
        assert!(gitignore.contains("bd.sock"));
        assert!(!gitignore.contains("jsonl"));

        assert!(matches!(
            init_workspace(temp.path()).unwrap_err(),
            BeadsError::AlreadyInitialized { .. }
        ));
    }

    #[test]
    fn debounce_and_interval_fall_back_to_defaults() {
        let storage = SqliteStorage::open_memory().unwrap();
        assert_eq!(flush_debounce(&storage), DEFAULT_FLUSH_DEBOUNCE);
        assert_eq!(sync_interval(&storage), DEFAULT_SYNC_INTERVAL);
    }

    #[test]
    fn debounce_reads_config() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        storage.set_config(KEY_FLUSH_DEBOUNCE, "200").unwrap();
        storage.set_config(KEY_SYNC_INTERVAL, "60").unwrap();
        assert_eq!(flush_debounce(&storage), Duration::from_millis(200));
        assert_eq!(sync_interval(&storage), Duration::from_secs(60));
    }
}
