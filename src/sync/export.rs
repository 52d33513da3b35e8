//! JSONL export: serialize the whole database to `beads.jsonl`.
//!
//! The write is atomic: issues stream into a PID-scoped tempfile which is
//! fsynced and renamed over the target, so the JSONL on disk always parses
//! even if an export is interrupted. Two safety guards protect against the
//! classic footguns of a bidirectional sync: exporting an empty database
//! over a populated file, and exporting a stale database that would drop
//! IDs the file still has.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::config::META_JSONL_HASH;
use crate::error::{BeadsError, Result};
use crate::storage::SqliteStorage;
use crate::util::create_progress_bar;

use super::read_issues_from_jsonl;

/// Options for [`export_to_jsonl`].
#[derive(Debug, Clone, Default)]
pub struct ExportConfig {
    /// Skip the data-loss safety guards.
    pub force: bool,
    /// Show a progress bar on a TTY.
    pub show_progress: bool,
}

/// Outcome of an export.
#[derive(Debug, Clone)]
pub struct ExportResult {
    pub exported: usize,
    /// SHA256 over the written lines.
    pub content_hash: String,
}

/// Export every issue (with labels and dependency edges) to JSONL.
///
/// On success the dirty set is cleared and the file hash is recorded in
/// metadata so the watcher can recognize self-inflicted changes.
pub fn export_to_jsonl(
    storage: &mut SqliteStorage,
    output_path: &Path,
    config: &ExportConfig,
) -> Result<ExportResult> {
    let issues = storage.get_all_issues_for_export()?;

    if !config.force && output_path.exists() {
        guard_against_data_loss(&issues, output_path)?;
    }

    let parent = output_path.parent().ok_or_else(|| {
        BeadsError::Config(format!("Invalid output path: {}", output_path.display()))
    })?;
    fs::create_dir_all(parent)?;

    // PID-scoped temp name so two writers cannot clobber each other's
    // half-written file.
    let temp_path = parent.join(format!(
        "{}.{}.tmp",
        output_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "beads.jsonl".to_string()),
        std::process::id()
    ));

    let progress = create_progress_bar(issues.len() as u64, "Exporting issues", config.show_progress);
    let mut writer = BufWriter::new(File::create(&temp_path)?);
    let mut hasher = Sha256::new();
    let mut exported = 0usize;

    for issue in &issues {
        let canonical = issue.canonicalized();
        let json = serde_json::to_string(&canonical)?;
        writeln!(writer, "{json}")?;
        hasher.update(json.as_bytes());
        hasher.update(b"\n");
        exported += 1;
        progress.inc(1);
    }
    progress.finish_and_clear();

    writer.flush()?;
    writer
        .into_inner()
        .map_err(|e| BeadsError::Io(e.into_error()))?
        .sync_all()?;

    fs::rename(&temp_path, output_path)?;

    let content_hash = format!("{:x}", hasher.finalize());
    storage.set_metadata(META_JSONL_HASH, &content_hash)?;
    storage.clear_all_dirty_issues()?;

    tracing::debug!(exported, hash = %content_hash, path = %output_path.display(), "exported JSONL");

    Ok(ExportResult {
        exported,
        content_hash,
    })
}

/// Refuse exports that would silently destroy data, unless forced.
fn guard_against_data_loss(issues: &[crate::model::Issue], output_path: &Path) -> Result<()> {
    let existing = match read_issues_from_jsonl(output_path) {
        Ok(existing) => existing,
        // an unparseable file is not a data-loss guard's problem
        Err(_) => return Ok(()),
    };
    if existing.is_empty() {
        return Ok(());
    }

    if issues.is_empty() {
        return Err(BeadsError::Config(format!(
            "Refusing to export empty database over non-empty JSONL ({} issues).\n\
             Hint: import first, or use --force to override.",
            existing.len()
        )));
    }

    let db_ids: HashSet<&str> = issues.iter().map(|i| i.id.as_str()).collect();
    let mut missing: Vec<&str> = existing
        .iter()
        .map(|i| i.id.as_str())
        .filter(|id| !db_ids.contains(id))
        .collect();
    if !missing.is_empty() {
        missing.sort_unstable();
        let preview: Vec<&str> = missing.iter().take(10).copied().collect();
        return Err(BeadsError::Config(format!(
            "Refusing to export stale database: {} issue(s) in JSONL are missing from the database: {}{}\n\
             Hint: run import first, or use --force to override.",
            missing.len(),
            preview.join(", "),
            if missing.len() > 10 { ", …" } else { "" },
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Dependency, DependencyType, Issue};
    use tempfile::TempDir;

    fn seeded_storage() -> SqliteStorage {
        let mut store = SqliteStorage::open_memory().unwrap();
        let mut a = Issue::new("bd-1", "First");
        a.labels = vec!["core".into()];
        store.create_issue(&a, "t").unwrap();
        store.create_issue(&Issue::new("bd-2", "Second"), "t").unwrap();
        store
            .add_dependency(
                &Dependency {
                    issue_id: "bd-1".into(),
                    depends_on_id: "bd-2".into(),
                    dep_type: DependencyType::Blocks,
                    created_at: None,
                    created_by: None,
                },
                "t",
            )
            .unwrap();
        store
    }

    #[test]
    fn export_writes_parseable_lines_with_trailing_lf() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("beads.jsonl");
        let mut store = seeded_storage();

        let result = export_to_jsonl(&mut store, &path, &ExportConfig::default()).unwrap();
        assert_eq!(result.exported, 2);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.ends_with('\n'));
        let issues = super::super::parse_issues(&contents).unwrap();
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].id, "bd-1");
        assert_eq!(issues[0].dependencies.len(), 1);

        // export clears the dirty set and records the hash
        assert!(store.get_dirty_issue_ids().unwrap().is_empty());
        assert_eq!(
            store.get_metadata(META_JSONL_HASH).unwrap().unwrap(),
            result.content_hash
        );
    }

    #[test]
    fn export_refuses_empty_over_nonempty() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("beads.jsonl");

        let mut full = seeded_storage();
        export_to_jsonl(&mut full, &path, &ExportConfig::default()).unwrap();

        let mut empty = SqliteStorage::open_memory().unwrap();
        let err = export_to_jsonl(&mut empty, &path, &ExportConfig::default()).unwrap_err();
        assert!(err.to_string().contains("Refusing to export empty database"));

        // --force overrides
        export_to_jsonl(
            &mut empty,
            &path,
            &ExportConfig {
                force: true,
                ..ExportConfig::default()
            },
        )
        .unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn export_refuses_dropping_ids() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("beads.jsonl");

        let mut full = seeded_storage();
        export_to_jsonl(&mut full, &path, &ExportConfig::default()).unwrap();

        let mut partial = SqliteStorage::open_memory().unwrap();
        partial.create_issue(&Issue::new("bd-1", "First"), "t").unwrap();
        let err = export_to_jsonl(&mut partial, &path, &ExportConfig::default()).unwrap_err();
        assert!(err.to_string().contains("bd-2"));
    }

    #[test]
    fn no_temp_file_left_behind() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("beads.jsonl");
        let mut store = seeded_storage();
        export_to_jsonl(&mut store, &path, &ExportConfig::default()).unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
