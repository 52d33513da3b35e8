//! Base/left JSONL snapshots.
//!
//! After a `git pull`, an ID missing from the merged JSONL is ambiguous: it
//! was either deleted remotely or never existed on the remote at all. The
//! snapshot pair disambiguates:
//!
//! - `beads.base.jsonl` — the last successfully imported state
//! - `beads.left.jsonl` — the local state captured just before the pull
//!
//! An ID present in base but absent from the merged file is an *accepted
//! deletion* only when the left entry exists and equals the base entry
//! (byte-identical, or structurally equal JSON since exporters may reorder
//! fields) — i.e. the local side did not touch it, so the remote deletion
//! can be honored without losing local work.
//!
//! Each snapshot carries a `.meta.json` sidecar `{version, timestamp,
//! commit}` used to detect stale or foreign snapshots; an invalid snapshot
//! is treated as absent and rebuilt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::config::ConfigPaths;
use crate::error::Result;

/// Snapshots older than this are considered stale.
const MAX_SNAPSHOT_AGE_SECS: i64 = 3600;

/// Which of the two snapshots to operate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    Base,
    Left,
}

/// Sidecar metadata written next to each snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub version: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

/// Why a snapshot failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotInvalid {
    MissingFile,
    MissingMeta,
    Stale,
    VersionMismatch,
    CommitMismatch,
}

/// Manages the base/left snapshot pair next to `beads.jsonl`.
#[derive(Debug, Clone)]
pub struct SnapshotManager {
    jsonl_path: PathBuf,
    base_path: PathBuf,
    left_path: PathBuf,
}

impl SnapshotManager {
    #[must_use]
    pub fn new(paths: &ConfigPaths) -> Self {
        Self {
            jsonl_path: paths.jsonl_path.clone(),
            base_path: paths.base_snapshot_path(),
            left_path: paths.left_snapshot_path(),
        }
    }

    #[must_use]
    pub fn snapshot_path(&self, kind: SnapshotKind) -> &Path {
        match kind {
            SnapshotKind::Base => &self.base_path,
            SnapshotKind::Left => &self.left_path,
        }
    }

    fn meta_path(&self, kind: SnapshotKind) -> PathBuf {
        let path = self.snapshot_path(kind);
        path.with_extension("meta.json")
    }

    /// Capture the current JSONL as the pre-pull (`left`) snapshot.
    pub fn capture_left(&self, commit: Option<&str>) -> Result<()> {
        self.capture(SnapshotKind::Left, commit)
    }

    /// Record the current JSONL as the post-import (`base`) snapshot.
    pub fn update_base(&self, commit: Option<&str>) -> Result<()> {
        self.capture(SnapshotKind::Base, commit)
    }

    /// Seed `base` from the JSONL when the JSONL exists but base does not.
    pub fn initialize(&self, commit: Option<&str>) -> Result<()> {
        if self.jsonl_path.exists() && !self.base_path.exists() {
            self.update_base(commit)?;
        }
        Ok(())
    }

    fn capture(&self, kind: SnapshotKind, commit: Option<&str>) -> Result<()> {
        let target = self.snapshot_path(kind).to_path_buf();
        let contents = if self.jsonl_path.exists() {
            fs::read(&self.jsonl_path)?
        } else {
            Vec::new()
        };

        // PID-scoped temp name, then rename: concurrent writers cannot
        // interleave partial snapshots.
        let tmp = target.with_extension(format!("jsonl.{}.tmp", std::process::id()));
        fs::write(&tmp, &contents)?;
        fs::rename(&tmp, &target)?;

        let meta = SnapshotMeta {
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
            commit: commit.map(ToString::to_string),
        };
        let meta_tmp = self
            .meta_path(kind)
            .with_extension(format!("json.{}.tmp", std::process::id()));
        fs::write(&meta_tmp, serde_json::to_vec_pretty(&meta)?)?;
        fs::rename(&meta_tmp, self.meta_path(kind))?;
        Ok(())
    }

    /// Validate a snapshot. `current_commit` is the repository HEAD when
    /// known; the commit check only applies when both sides are known.
    pub fn validate(
        &self,
        kind: SnapshotKind,
        current_commit: Option<&str>,
    ) -> std::result::Result<(), SnapshotInvalid> {
        if !self.snapshot_path(kind).exists() {
            return Err(SnapshotInvalid::MissingFile);
        }
        let meta_raw =
            fs::read_to_string(self.meta_path(kind)).map_err(|_| SnapshotInvalid::MissingMeta)?;
        let meta: SnapshotMeta =
            serde_json::from_str(&meta_raw).map_err(|_| SnapshotInvalid::MissingMeta)?;

        let age = Utc::now().signed_duration_since(meta.timestamp);
        if age.num_seconds() > MAX_SNAPSHOT_AGE_SECS {
            return Err(SnapshotInvalid::Stale);
        }

        if !same_major_minor(&meta.version, env!("CARGO_PKG_VERSION")) {
            return Err(SnapshotInvalid::VersionMismatch);
        }

        if let (Some(recorded), Some(current)) = (meta.commit.as_deref(), current_commit) {
            if recorded != current {
                return Err(SnapshotInvalid::CommitMismatch);
            }
        }

        Ok(())
    }

    /// IDs deleted remotely that are safe to delete locally.
    ///
    /// `accepted = { id ∈ base | id ∉ merged ∧ left[id] ≡ base[id] }` where
    /// `≡` is byte equality or structural JSON equality.
    pub fn compute_accepted_deletions(&self, merged_path: &Path) -> Result<Vec<String>> {
        let base = load_lines_by_id(&self.base_path)?;
        let left = load_lines_by_id(&self.left_path)?;
        let merged = load_lines_by_id(merged_path)?;

        let mut accepted = Vec::new();
        for (id, base_line) in &base {
            if merged.contains_key(id) {
                continue;
            }
            let Some(left_line) = left.get(id) else {
                continue;
            };
            if left_line == base_line || json_equal(left_line, base_line) {
                accepted.push(id.clone());
            }
        }
        accepted.sort();
        Ok(accepted)
    }
}

fn same_major_minor(a: &str, b: &str) -> bool {
    match (semver::Version::parse(a), semver::Version::parse(b)) {
        (Ok(a), Ok(b)) => a.major == b.major && a.minor == b.minor,
        _ => false,
    }
}

fn json_equal(a: &str, b: &str) -> bool {
    match (
        serde_json::from_str::<serde_json::Value>(a),
        serde_json::from_str::<serde_json::Value>(b),
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Map of issue ID to its raw JSONL line. Missing files read as empty.
fn load_lines_by_id(path: &Path) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    if !path.exists() {
        return Ok(map);
    }
    let reader = BufReader::new(fs::File::open(path)?);
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) {
            if let Some(id) = value.get("id").and_then(|v| v.as_str()) {
                map.insert(id.to_string(), line);
            }
        }
    }
    Ok(map)
}
