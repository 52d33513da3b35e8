//! Error types for beads.
//!
//! # Design
//!
//! - `thiserror`-derived variants for every failure the engine can report
//! - Each variant maps onto a stable [`ErrorKind`] so errors survive the
//!   RPC boundary (the wire carries `{kind, message}`, not the Rust type)
//! - Recovery hints for user-facing errors
//! - Exit code 1 for operational errors, matching the CLI contract

use std::path::PathBuf;
use thiserror::Error;

/// Stable error taxonomy shared between in-process errors and RPC envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    AlreadyClosed,
    InvalidArgument,
    PrefixMismatch,
    Collision,
    CycleDetected,
    IoError,
    SerializationError,
    ConcurrencyConflict,
    Unsupported,
    Timeout,
    Fatal,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::AlreadyClosed => "already_closed",
            Self::InvalidArgument => "invalid_argument",
            Self::PrefixMismatch => "prefix_mismatch",
            Self::Collision => "collision",
            Self::CycleDetected => "cycle_detected",
            Self::IoError => "io_error",
            Self::SerializationError => "serialization_error",
            Self::ConcurrencyConflict => "concurrency_conflict",
            Self::Unsupported => "unsupported",
            Self::Timeout => "timeout",
            Self::Fatal => "fatal",
        }
    }
}

/// Primary error type for beads operations.
#[derive(Error, Debug)]
pub enum BeadsError {
    // === Storage ===
    /// Issue with the specified ID was not found.
    #[error("Issue not found: {id}")]
    IssueNotFound { id: String },

    /// Attempted to create an issue with an ID that already exists.
    #[error("Issue already exists: {id}")]
    IssueExists { id: String },

    /// Close on an issue that is already closed.
    #[error("Issue already closed: {id}")]
    AlreadyClosed { id: String },

    /// `SQLite` error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Another process holds the write lock (daemon running, lock held).
    #[error("Database is busy: {path}")]
    DatabaseBusy { path: PathBuf },

    // === Validation ===
    /// Field validation failed.
    #[error("Invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    /// Invalid status value.
    #[error("Invalid status: {status}")]
    InvalidStatus { status: String },

    /// Invalid issue type value.
    #[error("Invalid issue type: {issue_type}")]
    InvalidType { issue_type: String },

    /// Priority out of valid range (0-4).
    #[error("Priority must be 0-4, got: {priority}")]
    InvalidPriority { priority: i64 },

    /// Invalid dependency type value.
    #[error("Invalid dependency type: {dep_type}")]
    InvalidDependencyType { dep_type: String },

    /// Issue ID format is invalid.
    #[error("Invalid issue ID format: {id}")]
    InvalidId { id: String },

    // === Dependencies ===
    /// Adding the dependency would create a cycle.
    #[error("Cycle detected in dependencies: {path}")]
    DependencyCycle { path: String },

    /// Self-referential dependency.
    #[error("Issue cannot depend on itself: {id}")]
    SelfDependency { id: String },

    /// Dependency target not found.
    #[error("Dependency target not found: {id}")]
    DependencyTargetMissing { id: String },

    // === Import / sync ===
    /// JSONL line failed to parse.
    #[error("JSONL parse error at line {line}: {reason}")]
    JsonlParse { line: usize, reason: String },

    /// Issue prefix doesn't match the configured prefix.
    #[error("Prefix mismatch: expected '{expected}', found {found:?}")]
    PrefixMismatch {
        expected: String,
        found: Vec<String>,
    },

    /// Import found colliding issues and resolution was not requested.
    #[error("Import collision: {count} issues have the same ID with different content")]
    ImportCollision { count: usize },

    /// Conflict markers present in the JSONL file.
    #[error("Conflict markers found in {path} (line {line})")]
    ConflictMarkers { path: PathBuf, line: usize },

    /// ID counter sync failed after import; further ID allocation is unsafe.
    #[error("Fatal: failed to sync ID counters: {reason}")]
    CounterSync { reason: String },

    // === Daemon / RPC ===
    /// Another daemon already owns this database.
    #[error("Daemon already running (pid {pid})")]
    DaemonRunning { pid: u32 },

    /// The daemon does not implement the requested method.
    #[error("Daemon does not support method '{method}'")]
    UnsupportedMethod { method: String },

    /// RPC transport failure.
    #[error("RPC error: {reason}")]
    Rpc { reason: String },

    /// The daemon returned an error envelope.
    #[error("{message}")]
    Remote { kind: ErrorKind, message: String },

    /// Operation exceeded its deadline.
    #[error("Timed out: {operation}")]
    Timeout { operation: String },

    // === Configuration ===
    /// Beads workspace not initialized.
    #[error("Beads not initialized: run 'bd init' first")]
    NotInitialized,

    /// Already initialized.
    #[error("Already initialized at '{path}'")]
    AlreadyInitialized { path: PathBuf },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    // === I/O / serialization ===
    /// File system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Wrapped error from a subsystem without a dedicated variant.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BeadsError {
    /// The stable taxonomy bucket for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::IssueNotFound { .. } | Self::DependencyTargetMissing { .. } => {
                ErrorKind::NotFound
            }
            Self::IssueExists { .. } | Self::AlreadyInitialized { .. } => ErrorKind::AlreadyExists,
            Self::AlreadyClosed { .. } => ErrorKind::AlreadyClosed,
            Self::Validation { .. }
            | Self::InvalidStatus { .. }
            | Self::InvalidType { .. }
            | Self::InvalidPriority { .. }
            | Self::InvalidDependencyType { .. }
            | Self::InvalidId { .. }
            | Self::NotInitialized
            | Self::Config(_) => ErrorKind::InvalidArgument,
            Self::PrefixMismatch { .. } => ErrorKind::PrefixMismatch,
            Self::ImportCollision { .. } | Self::ConflictMarkers { .. } => ErrorKind::Collision,
            Self::DependencyCycle { .. } | Self::SelfDependency { .. } => ErrorKind::CycleDetected,
            Self::Io(_) => ErrorKind::IoError,
            Self::Json(_) | Self::JsonlParse { .. } => ErrorKind::SerializationError,
            Self::DatabaseBusy { .. } | Self::DaemonRunning { .. } => {
                ErrorKind::ConcurrencyConflict
            }
            Self::UnsupportedMethod { .. } => ErrorKind::Unsupported,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::CounterSync { .. } => ErrorKind::Fatal,
            Self::Remote { kind, .. } => *kind,
            Self::Database(_) | Self::Rpc { .. } | Self::Other(_) => ErrorKind::IoError,
        }
    }

    /// Rebuild an error from an RPC error envelope.
    #[must_use]
    pub fn from_wire(kind: ErrorKind, message: String) -> Self {
        Self::Remote { kind, message }
    }

    /// Human-friendly suggestion for fixing this error.
    #[must_use]
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::NotInitialized => Some("Run: bd init"),
            Self::PrefixMismatch { .. } => {
                Some("Re-run with --rename-on-import to rewrite IDs to the configured prefix")
            }
            Self::ImportCollision { .. } => {
                Some("Re-run with --resolve-collisions to remap colliding issues")
            }
            Self::ConflictMarkers { .. } => {
                Some("Resolve the merge conflict in the JSONL file, then import again")
            }
            Self::DependencyCycle { .. } => Some("Remove one dependency to break the cycle"),
            Self::SelfDependency { .. } => Some("An issue cannot depend on itself"),
            Self::InvalidPriority { .. } => {
                Some("Use a priority between 0 (critical) and 4 (backlog)")
            }
            Self::InvalidStatus { .. } => {
                Some("Valid statuses: open, in_progress, blocked, closed")
            }
            Self::InvalidType { .. } => Some("Valid types: bug, feature, task, epic, chore"),
            Self::DaemonRunning { .. } => Some("Stop it with: bd daemon stop"),
            _ => None,
        }
    }

    /// Exit code for this error. Operational errors exit 1.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        1
    }

    /// Create a validation error for a specific field.
    #[must_use]
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Render as a structured JSON object for `--json` output.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "kind": self.kind().as_str(),
                "message": self.to_string(),
                "hint": self.suggestion(),
            }
        })
    }
}

/// Result type using [`BeadsError`].
pub type Result<T> = std::result::Result<T, BeadsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_id() {
        let err = BeadsError::IssueNotFound {
            id: "bd-42".to_string(),
        };
        assert_eq!(err.to_string(), "Issue not found: bd-42");
    }

    #[test]
    fn kinds_are_stable() {
        assert_eq!(
            BeadsError::AlreadyClosed { id: "bd-1".into() }.kind(),
            ErrorKind::AlreadyClosed
        );
        assert_eq!(
            BeadsError::DaemonRunning { pid: 1 }.kind(),
            ErrorKind::ConcurrencyConflict
        );
        assert_eq!(
            BeadsError::CounterSync { reason: "x".into() }.kind(),
            ErrorKind::Fatal
        );
    }

    #[test]
    fn kind_roundtrips_through_serde() {
        let json = serde_json::to_string(&ErrorKind::Unsupported).unwrap();
        assert_eq!(json, "\"unsupported\"");
        let back: ErrorKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ErrorKind::Unsupported);
    }

    #[test]
    fn wire_envelope_roundtrip() {
        let err = BeadsError::from_wire(ErrorKind::NotFound, "Issue not found: bd-9".into());
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "Issue not found: bd-9");
    }

    #[test]
    fn suggestion_present_for_user_errors() {
        assert!(BeadsError::NotInitialized.suggestion().is_some());
        let err = BeadsError::ImportCollision { count: 3 };
        assert!(err.suggestion().unwrap().contains("--resolve-collisions"));
    }
}
