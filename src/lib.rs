//! beads — a git-native issue tracker.
//!
//! Issues live in two places at once: a SQLite database (`beads.db`) that
//! serves fast local queries, and a line-oriented JSONL file (`beads.jsonl`)
//! that rides along in version control. The sync engine in this crate keeps
//! the two mutually consistent: mutations mark the database dirty and a
//! debounced exporter rewrites the JSONL atomically; a file watcher notices
//! external JSONL changes (e.g. after `git pull`) and re-imports them with
//! collision resolution; snapshots of the JSONL let the importer tell a
//! remote deletion apart from an issue that never existed locally.
//!
//! A long-running daemon (`bd daemon run`) owns the exclusive database
//! connection and serves RPC over a Unix socket next to the database.
//! Short-lived CLI invocations talk to it when it is up and fall back to
//! direct storage access when it is not.

pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod logging;
pub mod model;
pub mod storage;
pub mod sync;
pub mod util;
pub mod validation;

pub use error::{BeadsError, ErrorKind, Result};
pub use model::{Dependency, DependencyType, Event, Issue, IssueType, Priority, Status};
pub use storage::SqliteStorage;
