//! The sync engine: everything that keeps `beads.db` and `beads.jsonl`
//! mutually consistent.
//!
//! - [`export`] writes the database out as JSONL (atomically)
//! - [`import`] folds a JSONL file back into the database with collision
//!   resolution
//! - [`snapshot`] maintains the base/left JSONL snapshots that let the
//!   importer recognize remote deletions
//! - [`bootstrap`] seeds an empty database from version control
//! - [`debounce`] coalesces mutation bursts into single flushes
//! - [`watcher`] notices external JSONL changes
//! - [`git`] shells out to the version control system

pub mod bootstrap;
pub mod debounce;
pub mod export;
pub mod git;
pub mod import;
pub mod snapshot;
pub mod watcher;

pub use bootstrap::auto_import_if_empty;
pub use debounce::{Debouncer, FlushController};
pub use export::{export_to_jsonl, ExportConfig, ExportResult};
pub use import::{import_from_jsonl, import_records, ImportOptions, ImportRecord, ImportResult};
pub use snapshot::SnapshotManager;
pub use watcher::FileWatcher;

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::{BeadsError, Result};
use crate::model::Issue;

/// Parse issues from JSONL text, one object per line. Blank lines are
/// skipped; anything else must parse.
pub fn parse_issues(content: &str) -> Result<Vec<Issue>> {
    let mut issues = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let issue: Issue = serde_json::from_str(line).map_err(|e| BeadsError::JsonlParse {
            line: idx + 1,
            reason: e.to_string(),
        })?;
        issues.push(issue);
    }
    Ok(issues)
}

/// Read and parse a JSONL file.
pub fn read_issues_from_jsonl(path: &Path) -> Result<Vec<Issue>> {
    let file = File::open(path)?;
    let reader = BufReader::with_capacity(2 * 1024 * 1024, file);
    let mut issues = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let issue: Issue = serde_json::from_str(&line).map_err(|e| BeadsError::JsonlParse {
            line: idx + 1,
            reason: e.to_string(),
        })?;
        issues.push(issue);
    }
    Ok(issues)
}

/// SHA256 over the file's lines, LF-normalized. Stored in metadata so the
/// watcher and bootstrap can tell whether the JSONL changed under them.
pub fn compute_jsonl_hash(path: &Path) -> Result<String> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    for line in reader.lines() {
        let line = line?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// A VCS conflict marker found in a JSONL file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictMarker {
    pub line: usize,
    pub marker: &'static str,
}

/// Scan for `<<<<<<<` / `=======` / `>>>>>>>` lines.
///
/// Matches only line starts so base64-ish content inside JSON strings
/// cannot false-positive.
pub fn scan_conflict_markers(path: &Path) -> Result<Vec<ConflictMarker>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut markers = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let marker = if line.starts_with("<<<<<<<") {
            Some("<<<<<<<")
        } else if line.starts_with("=======") {
            Some("=======")
        } else if line.starts_with(">>>>>>>") {
            Some(">>>>>>>")
        } else {
            None
        };
        if let Some(marker) = marker {
            markers.push(ConflictMarker {
                line: idx + 1,
                marker,
            });
        }
    }
    Ok(markers)
}

/// Error out when the file carries conflict markers.
pub fn ensure_no_conflict_markers(path: &Path) -> Result<()> {
    let markers = scan_conflict_markers(path)?;
    if let Some(first) = markers.first() {
        return Err(BeadsError::ConflictMarkers {
            path: path.to_path_buf(),
            line: first.line,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn parse_skips_blank_lines() {
        let content = r#"{"id":"bd-1","title":"a","status":"open","priority":2,"issue_type":"task","created_at":"2026-01-01T00:00:00Z","updated_at":"2026-01-01T00:00:00Z"}

{"id":"bd-2","title":"b","status":"open","priority":2,"issue_type":"task","created_at":"2026-01-01T00:00:00Z","updated_at":"2026-01-01T00:00:00Z"}
"#;
        let issues = parse_issues(content).unwrap();
        assert_eq!(issues.len(), 2);
    }

    #[test]
    fn parse_reports_line_numbers() {
        let content = "{\"id\":\"bd-1\"\n";
        let err = parse_issues(content).unwrap_err();
        assert!(matches!(err, BeadsError::JsonlParse { line: 1, .. }));
    }

    #[test]
    fn conflict_marker_scan() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("beads.jsonl");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "{{\"id\":\"bd-1\"}}").unwrap();
        writeln!(file, "<<<<<<< HEAD").unwrap();
        writeln!(file, "=======").unwrap();
        writeln!(file, ">>>>>>> theirs").unwrap();

        let markers = scan_conflict_markers(&path).unwrap();
        assert_eq!(markers.len(), 3);
        assert_eq!(markers[0].line, 2);

        let err = ensure_no_conflict_markers(&path).unwrap_err();
        assert!(matches!(err, BeadsError::ConflictMarkers { line: 2, .. }));
    }

    #[test]
    fn jsonl_hash_is_stable_per_content() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a.jsonl");
        let b = temp.path().join("b.jsonl");
        std::fs::write(&a, "{\"id\":\"bd-1\"}\n").unwrap();
        std::fs::write(&b, "{\"id\":\"bd-1\"}\n").unwrap();
        assert_eq!(
            compute_jsonl_hash(&a).unwrap(),
            compute_jsonl_hash(&b).unwrap()
        );

        std::fs::write(&b, "{\"id\":\"bd-2\"}\n").unwrap();
        assert_ne!(
            compute_jsonl_hash(&a).unwrap(),
            compute_jsonl_hash(&b).unwrap()
        );
    }
}
