//! Read-only health scans over the store and the JSONL file.
//!
//! Consumed by `bd validate`: each scan reports what it found and, where a
//! safe automatic fix exists (only orphaned dependencies qualify), how many
//! it fixed. Everything else is surfaced as a recommendation.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::error::Result;
use crate::model::Status;
use crate::storage::SqliteStorage;
use crate::sync::scan_conflict_markers;

/// Title prefixes that smell like test data left behind by tooling.
const POLLUTION_PREFIXES: &[&str] = &[
    "test ", "test-", "testing ", "dummy ", "sample ", "asdf", "qwerty", "xxx", "zzz",
];

/// Result of one scan.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ScanReport {
    /// Findings (not necessarily fixable).
    pub issue_count: usize,
    /// Findings repaired in place.
    pub fixed_count: usize,
    /// Human-readable recommendations, one per finding.
    pub suggestions: Vec<String>,
}

impl ScanReport {
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.issue_count == 0
    }

    /// Findings that remain after fixes.
    #[must_use]
    pub const fn unfixed(&self) -> usize {
        self.issue_count - self.fixed_count
    }
}

/// Edges whose target issue does not exist. The only auto-fixable scan:
/// with `fix`, dangling edges are removed.
pub fn scan_orphaned_dependencies(storage: &mut SqliteStorage, fix: bool) -> Result<ScanReport> {
    let ids: HashSet<String> = storage.get_all_ids()?.into_iter().collect();
    let all_deps = storage.get_all_dependency_records()?;

    let mut report = ScanReport::default();
    for dep in all_deps.values().flatten() {
        if ids.contains(&dep.depends_on_id) {
            continue;
        }
        report.issue_count += 1;
        if fix {
            storage.remove_dependency(&dep.issue_id, &dep.depends_on_id, dep.dep_type, "validate")?;
            report.fixed_count += 1;
            report.suggestions.push(format!(
                "removed orphaned dependency {} -> {} ({})",
                dep.issue_id, dep.depends_on_id, dep.dep_type
            ));
        } else {
            report.suggestions.push(format!(
                "{} depends on missing {} ({}); run with --fix to remove",
                dep.issue_id, dep.depends_on_id, dep.dep_type
            ));
        }
    }
    Ok(report)
}

/// Issues sharing identical `(title, description, design,
/// acceptance_criteria, status)`. Merging is a human decision, so this scan
/// only recommends.
pub fn scan_duplicate_content(storage: &SqliteStorage) -> Result<ScanReport> {
    let issues = storage.get_all_issues_for_export()?;
    let mut groups: HashMap<(String, String, String, String, Status), Vec<String>> =
        HashMap::new();
    for issue in issues {
        let key = (
            issue.title.clone(),
            issue.description.clone().unwrap_or_default(),
            issue.design.clone().unwrap_or_default(),
            issue.acceptance_criteria.clone().unwrap_or_default(),
            issue.status,
        );
        groups.entry(key).or_default().push(issue.id);
    }

    let mut report = ScanReport::default();
    let mut duplicate_groups: Vec<Vec<String>> = groups
        .into_values()
        .filter(|ids| ids.len() > 1)
        .collect();
    duplicate_groups.sort();
    for ids in duplicate_groups {
        report.issue_count += ids.len() - 1;
        report
            .suggestions
            .push(format!("duplicate content: {}", ids.join(", ")));
    }
    Ok(report)
}

/// Issues whose titles look like tooling test residue.
pub fn scan_test_pollution(storage: &SqliteStorage) -> Result<ScanReport> {
    let issues = storage.get_all_issues_for_export()?;
    let mut report = ScanReport::default();
    for issue in issues {
        let lowered = issue.title.to_lowercase();
        if POLLUTION_PREFIXES.iter().any(|p| lowered.starts_with(p)) {
            report.issue_count += 1;
            report.suggestions.push(format!(
                "{} looks like test data: {:?}",
                issue.id, issue.title
            ));
        }
    }
    Ok(report)
}

/// Unresolved VCS conflict markers inside the JSONL file.
pub fn scan_jsonl_conflict_markers(jsonl_path: &Path) -> Result<ScanReport> {
    let mut report = ScanReport::default();
    if !jsonl_path.exists() {
        return Ok(report);
    }
    for marker in scan_conflict_markers(jsonl_path)? {
        report.issue_count += 1;
        report.suggestions.push(format!(
            "{}:{} contains conflict marker {}",
            jsonl_path.display(),
            marker.line,
            marker.marker
        ));
    }
    if !report.suggestions.is_empty() {
        report
            .suggestions
            .push("resolve the merge conflict, then run: bd import".to_string());
    }
    Ok(report)
}

/// Run every scan. Only orphaned dependencies honor `fix`.
pub fn run_all(
    storage: &mut SqliteStorage,
    jsonl_path: &Path,
    fix: bool,
) -> Result<Vec<(&'static str, ScanReport)>> {
    Ok(vec![
        ("orphaned-dependencies", scan_orphaned_dependencies(storage, fix)?),
        ("duplicate-content", scan_duplicate_content(storage)?),
        ("test-pollution", scan_test_pollution(storage)?),
        ("conflict-markers", scan_jsonl_conflict_markers(jsonl_path)?),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Dependency, DependencyType, Issue};

    fn storage_with(issues: &[(&str, &str)]) -> SqliteStorage {
        let mut store = SqliteStorage::open_memory().unwrap();
        for (id, title) in issues {
            store.create_issue(&Issue::new(*id, *title), "t").unwrap();
        }
        store
    }

    #[test]
    fn orphan_scan_finds_and_fixes() {
        let mut store = storage_with(&[("bd-1", "a"), ("bd-2", "b")]);
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
        // dangling edge planted directly (add_dependency would refuse it)
        store
            .mutate("t", |tx, _ctx| {
                tx.execute(
                    "INSERT INTO dependencies (issue_id, depends_on_id, type, created_at)
                     VALUES ('bd-1', 'bd-404', 'blocks', '2026-01-01T00:00:00Z')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        let report = scan_orphaned_dependencies(&mut store, false).unwrap();
        assert_eq!(report.issue_count, 1);
        assert_eq!(report.fixed_count, 0);
        assert_eq!(report.unfixed(), 1);

        let report = scan_orphaned_dependencies(&mut store, true).unwrap();
        assert_eq!(report.fixed_count, 1);

        let report = scan_orphaned_dependencies(&mut store, false).unwrap();
        assert!(report.is_clean());
        // the healthy edge survived
        assert_eq!(store.get_dependency_records("bd-1").unwrap().len(), 1);
    }

    #[test]
    fn duplicate_scan_groups_by_content() {
        let mut store = storage_with(&[("bd-1", "same"), ("bd-2", "same"), ("bd-3", "other")]);
        let report = scan_duplicate_content(&store).unwrap();
        assert_eq!(report.issue_count, 1);
        assert!(report.suggestions[0].contains("bd-1"));
        assert!(report.suggestions[0].contains("bd-2"));

        // differing status breaks the group
        store.close_issue("bd-2", None, "t").unwrap();
        let report = scan_duplicate_content(&store).unwrap();
        assert!(report.is_clean());
    }

    #[test]
    fn pollution_scan_matches_prefixes() {
        let store = storage_with(&[("bd-1", "test adding things"), ("bd-2", "Fix parser")]);
        let report = scan_test_pollution(&store).unwrap();
        assert_eq!(report.issue_count, 1);
        assert!(report.suggestions[0].contains("bd-1"));
    }

    #[test]
    fn conflict_scan_reads_jsonl() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("beads.jsonl");
        std::fs::write(&path, "{}\n<<<<<<< HEAD\n").unwrap();

        let report = scan_jsonl_conflict_markers(&path).unwrap();
        assert_eq!(report.issue_count, 1);

        // missing file is clean, not an error
        let report = scan_jsonl_conflict_markers(&temp.path().join("missing")).unwrap();
        assert!(report.is_clean());
    }
}
