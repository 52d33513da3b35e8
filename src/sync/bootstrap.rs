//! Auto-import bootstrap.
//!
//! A freshly cloned repository has the JSONL under version control but an
//! empty (or absent) database. On the first command that opens storage,
//! the bootstrap looks for a JSONL source in priority order — the blob at
//! `HEAD`, then the legacy name at `HEAD`, then the working-tree file —
//! and imports it with collision resolution. The configured prefix is
//! derived from the first imported ID when unset, the JSONL is flushed
//! back out immediately (so a racing daemon sees a consistent pair), and
//! the snapshot base is established.
//!
//! Without git the VCS sources silently vanish and only the working-tree
//! file is considered.

use std::path::Path;

use crate::config::{ConfigPaths, KEY_ISSUE_PREFIX, LEGACY_JSONL_FILE};
use crate::error::Result;
use crate::storage::SqliteStorage;
use crate::util::id::parse_id;

use super::export::{export_to_jsonl, ExportConfig};
use super::git;
use super::import::{import_records, parse_records, ImportOptions, ImportRecord, ImportResult};
use super::snapshot::SnapshotManager;

/// Where the bootstrap found its records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapSource {
    /// `HEAD:<rel>/beads.jsonl`
    HeadJsonl,
    /// `HEAD:<rel>/issues.jsonl`
    HeadLegacyJsonl,
    /// The working-tree JSONL file.
    WorkingTree,
}

/// Outcome of a bootstrap run.
#[derive(Debug)]
pub struct BootstrapOutcome {
    pub source: BootstrapSource,
    pub result: ImportResult,
    /// Prefix derived and stored because none was configured.
    pub derived_prefix: Option<String>,
}

/// Import from version control (or the working tree) when the database has
/// zero issues. Returns `Ok(None)` when the database is already populated
/// or no source exists.
pub fn auto_import_if_empty(
    storage: &mut SqliteStorage,
    paths: &ConfigPaths,
    actor: &str,
) -> Result<Option<BootstrapOutcome>> {
    if storage.count_issues()? > 0 {
        return Ok(None);
    }

    let Some((source, records)) = find_source(paths)? else {
        return Ok(None);
    };
    if records.is_empty() {
        return Ok(None);
    }

    // Derive the prefix from the first imported ID when unset.
    let mut derived_prefix = None;
    if storage.get_config(KEY_ISSUE_PREFIX)?.is_none() {
        if let Ok(parsed) = parse_id(&records[0].issue.id) {
            storage.set_config(KEY_ISSUE_PREFIX, &parsed.prefix)?;
            derived_prefix = Some(parsed.prefix);
        }
    }

    let options = ImportOptions {
        resolve_collisions: true,
        skip_prefix_validation: true,
        actor: actor.to_string(),
        ..ImportOptions::default()
    };
    let result = import_records(storage, records, &options)?;
    tracing::info!(
        created = result.created,
        source = ?source,
        "auto-imported issues into empty database"
    );

    // Flush immediately so a daemon starting concurrently sees matching
    // database and JSONL, then establish the snapshot baseline.
    export_to_jsonl(
        storage,
        &paths.jsonl_path,
        &ExportConfig {
            force: true,
            ..ExportConfig::default()
        },
    )?;
    let commit = repo_dir(paths).and_then(|dir| git::head_commit(&dir));
    SnapshotManager::new(paths).update_base(commit.as_deref())?;

    Ok(Some(BootstrapOutcome {
        source,
        result,
        derived_prefix,
    }))
}

/// Locate records in priority order: HEAD blob, legacy HEAD blob, working
/// tree.
fn find_source(paths: &ConfigPaths) -> Result<Option<(BootstrapSource, Vec<ImportRecord>)>> {
    if let Some(repo) = repo_dir(paths) {
        if let Some(root) = git::repo_root(&repo) {
            for (source, file_name) in [
                (BootstrapSource::HeadJsonl, crate::config::JSONL_FILE),
                (BootstrapSource::HeadLegacyJsonl, LEGACY_JSONL_FILE),
            ] {
                let relpath = head_relpath(&root, &paths.beads_dir, file_name);
                if let Ok(Some(contents)) = git::show_head_file(&root, &relpath) {
                    if !contents.trim().is_empty() {
                        return Ok(Some((source, parse_records(&contents)?)));
                    }
                }
            }
        }
    }

    for candidate in [
        paths.jsonl_path.clone(),
        paths.beads_dir.join(LEGACY_JSONL_FILE),
    ] {
        if candidate.is_file() {
            let contents = std::fs::read_to_string(&candidate)?;
            if !contents.trim().is_empty() {
                return Ok(Some((BootstrapSource::WorkingTree, parse_records(&contents)?)));
            }
        }
    }

    Ok(None)
}

fn repo_dir(paths: &ConfigPaths) -> Option<std::path::PathBuf> {
    paths.beads_dir.parent().map(Path::to_path_buf)
}

fn head_relpath(repo_root: &Path, beads_dir: &Path, file_name: &str) -> String {
    let rel = beads_dir
        .canonicalize()
        .ok()
        .and_then(|canon| {
            repo_root
                .canonicalize()
                .ok()
                .and_then(|root| canon.strip_prefix(&root).ok().map(Path::to_path_buf))
        })
        .unwrap_or_else(|| std::path::PathBuf::from(crate::config::BEADS_DIR_NAME));
    format!("{}/{}", rel.display(), file_name)
}
