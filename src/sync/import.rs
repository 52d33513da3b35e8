//! JSONL import: fold external records into the database.
//!
//! The import runs in phases, each idempotent, so a mid-phase failure
//! leaves the store valid and the next run reconverges:
//!
//! 1. Normalize and deduplicate the batch (last occurrence of an ID wins)
//! 2. Prefix check — report a mismatch, or rewrite IDs under
//!    `rename_on_import`
//! 3. Collision detection against the store (content-level equality)
//! 4. Collision scoring and remapping — the record with the
//!    lexicographically lower content hash keeps the contested ID, the
//!    loser is minted a fresh hash-suffixed ID; only rows being remapped
//!    have their references rewritten
//! 5. Apply — atomic batch create for new issues, full-record updates for
//!    changed existing ones
//! 6. Counter sync (failure is fatal: future minted IDs would collide)
//! 7. Dependency reconciliation
//! 8. Label reconciliation (symmetric difference, only when the record
//!    carried a `labels` key)

use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::config::{KEY_ISSUE_PREFIX, META_JSONL_HASH, META_LAST_IMPORT};
use crate::error::{BeadsError, Result};
use crate::model::Issue;
use crate::storage::{CollisionOutcome, SqliteStorage};
use crate::util::id::parse_id;

use super::{compute_jsonl_hash, ensure_no_conflict_markers};

/// Options for an import run.
#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// Accept records under any prefix without reporting a mismatch.
    pub skip_prefix_validation: bool,
    /// Rewrite mismatched-prefix IDs (and intra-batch references) to the
    /// configured prefix instead of reporting.
    pub rename_on_import: bool,
    /// Resolve ID collisions by content-hash scoring instead of failing.
    pub resolve_collisions: bool,
    /// Leave existing issues untouched (new issues are still created).
    pub skip_update: bool,
    /// Dependency rejections (missing target, cycle) abort the import
    /// instead of becoming warnings.
    pub strict_deps: bool,
    pub actor: String,
}

/// One parsed input record plus what the raw JSON actually carried.
#[derive(Debug, Clone)]
pub struct ImportRecord {
    pub issue: Issue,
    /// Whether the raw record had a non-null `labels` key. Absent labels
    /// mean "do not touch"; present (even empty) means "reconcile to this".
    pub labels_present: bool,
}

impl From<Issue> for ImportRecord {
    fn from(issue: Issue) -> Self {
        Self {
            issue,
            labels_present: true,
        }
    }
}

/// Aggregated result of an import.
#[derive(Debug, Clone, Default)]
pub struct ImportResult {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    /// Contested IDs that went through collision scoring.
    pub collision_ids: Vec<String>,
    /// Old ID → freshly minted ID, covering both renamed input records and
    /// remapped existing rows.
    pub id_mapping: HashMap<String, String>,
    pub prefix_mismatch: bool,
    pub expected_prefix: Option<String>,
    pub mismatch_prefixes: Vec<String>,
    pub warnings: Vec<String>,
}

/// Import a JSONL file. Refuses files with VCS conflict markers.
pub fn import_from_jsonl(
    storage: &mut SqliteStorage,
    path: &Path,
    options: &ImportOptions,
) -> Result<ImportResult> {
    ensure_no_conflict_markers(path)?;

    let content = std::fs::read_to_string(path)?;
    let records = parse_records(&content)?;
    let result = import_records(storage, records, options)?;

    if !result.prefix_mismatch {
        let hash = compute_jsonl_hash(path)?;
        storage.set_metadata(META_JSONL_HASH, &hash)?;
        storage.set_metadata(META_LAST_IMPORT, &chrono::Utc::now().to_rfc3339())?;
    }
    Ok(result)
}

/// Parse JSONL content into import records, keeping key-presence facts the
/// typed model cannot represent.
pub fn parse_records(content: &str) -> Result<Vec<ImportRecord>> {
    let mut records = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let value: serde_json::Value =
            serde_json::from_str(line).map_err(|e| BeadsError::JsonlParse {
                line: idx + 1,
                reason: e.to_string(),
            })?;
        let labels_present = value.get("labels").is_some_and(|v| !v.is_null());
        let issue: Issue = serde_json::from_value(value).map_err(|e| BeadsError::JsonlParse {
            line: idx + 1,
            reason: e.to_string(),
        })?;
        records.push(ImportRecord {
            issue,
            labels_present,
        });
    }
    Ok(records)
}

/// The phase-structured import core. See the module docs for the phases.
#[allow(clippy::too_many_lines)]
pub fn import_records(
    storage: &mut SqliteStorage,
    mut records: Vec<ImportRecord>,
    options: &ImportOptions,
) -> Result<ImportResult> {
    let mut result = ImportResult::default();
    let actor = if options.actor.is_empty() {
        "import"
    } else {
        options.actor.as_str()
    };

    // Phase 1: normalize + dedup (last occurrence of an ID wins).
    for record in &mut records {
        record.issue.normalize_closed_at();
        parse_id(&record.issue.id)?;
    }
    let before = records.len();
    dedup_last_wins(&mut records);
    result.skipped += before - records.len();

    // Phase 2: prefix check.
    let expected_prefix = storage.get_config(KEY_ISSUE_PREFIX)?;
    if !options.skip_prefix_validation {
        if let Some(ref prefix) = expected_prefix {
            let mismatched: Vec<String> = records
                .iter()
                .filter(|r| parse_id(&r.issue.id).is_ok_and(|p| p.prefix != *prefix))
                .map(|r| r.issue.id.clone())
                .collect();

            if !mismatched.is_empty() {
                if options.rename_on_import {
                    for old_id in &mismatched {
                        let new_id = storage.next_id(prefix)?;
                        rename_in_batch(&mut records, old_id, &new_id);
                        result.id_mapping.insert(old_id.clone(), new_id);
                    }
                } else {
                    result.prefix_mismatch = true;
                    result.expected_prefix = Some(prefix.clone());
                    let mut prefixes: Vec<String> = mismatched
                        .iter()
                        .filter_map(|id| parse_id(id).ok().map(|p| p.prefix))
                        .collect();
                    prefixes.sort();
                    prefixes.dedup();
                    result.mismatch_prefixes = prefixes;
                    return Ok(result);
                }
            }
        }
    }

    // Phase 3: collision detection.
    let issues: Vec<Issue> = records.iter().map(|r| r.issue.clone()).collect();
    let outcomes = storage.detect_collisions(&issues)?;
    let colliding: Vec<usize> = outcomes
        .iter()
        .enumerate()
        .filter(|(_, o)| **o == CollisionOutcome::Collision)
        .map(|(i, _)| i)
        .collect();

    if !colliding.is_empty() && !options.resolve_collisions {
        return Err(BeadsError::ImportCollision {
            count: colliding.len(),
        });
    }

    // Phase 4: score and remap. Lower content hash keeps the ID; ties keep
    // the existing record.
    let batch_ids: HashSet<String> = records.iter().map(|r| r.issue.id.clone()).collect();
    for idx in colliding {
        let contested = records[idx].issue.id.clone();
        let score = storage.score_collision(&records[idx].issue)?;
        result.collision_ids.push(contested.clone());
        let prefix = parse_id(&contested)?.prefix;

        if score.existing_wins {
            // The incoming record loses the ID: mint it a fresh one and
            // follow every reference inside the batch.
            let mut taken = batch_ids.clone();
            taken.extend(result.id_mapping.values().cloned());
            let new_id = storage.mint_collision_id(&prefix, &score.incoming_hash, &taken);
            rename_in_batch(&mut records, &contested, &new_id);
            result.id_mapping.insert(contested, new_id);
        } else {
            // The stored row loses: remap it (and only it) to a fresh ID.
            // Edges owned by other stored issues keep pointing at the
            // contested ID, which now refers to the incoming winner.
            let mut taken = batch_ids.clone();
            taken.extend(result.id_mapping.values().cloned());
            let new_id = storage.mint_collision_id(&prefix, &score.existing_hash, &taken);
            storage.remap_collision(&contested, &new_id, actor)?;
            result.id_mapping.insert(contested, new_id);
        }
    }

    // Phase 5: apply. Re-detect after remapping: every former collision is
    // now a create (the contested ID either left the store or never was
    // ours), so only creates, exact matches, and updates remain.
    records.sort_by(|a, b| a.issue.id.cmp(&b.issue.id));
    let issues: Vec<Issue> = records.iter().map(|r| r.issue.clone()).collect();
    let outcomes = storage.detect_collisions(&issues)?;

    let mut to_create: Vec<Issue> = Vec::new();
    for (record, outcome) in records.iter().zip(&outcomes) {
        match outcome {
            CollisionOutcome::NewIssue => to_create.push(record.issue.clone()),
            CollisionOutcome::ExactMatch => {
                if storage.record_equals_stored(&record.issue)? {
                    result.unchanged += 1;
                } else if options.skip_update {
                    result.skipped += 1;
                } else {
                    storage.upsert_issue_for_import(&record.issue, actor)?;
                    result.updated += 1;
                }
            }
            CollisionOutcome::Collision => {
                // Same content hash cannot collide twice; a fresh collision
                // here means scoring was skipped, which phase 3 rules out.
                if options.skip_update {
                    result.skipped += 1;
                } else {
                    storage.upsert_issue_for_import(&record.issue, actor)?;
                    result.updated += 1;
                }
            }
        }
    }
    if !to_create.is_empty() {
        storage.create_issues(&to_create, actor)?;
        result.created += to_create.len();
    }

    // Phase 6: counter sync. A failure here is fatal; the store could not
    // safely mint IDs anymore.
    storage
        .sync_all_counters()
        .map_err(|e| BeadsError::CounterSync {
            reason: e.to_string(),
        })?;

    // Phase 7: dependency reconciliation.
    for record in &records {
        for dep in &record.issue.dependencies {
            let mut dep = dep.clone();
            dep.issue_id = record.issue.id.clone();
            match storage.add_dependency(&dep, actor) {
                Ok(()) => {}
                Err(e) if options.strict_deps => return Err(e),
                Err(e) => result.warnings.push(format!(
                    "dependency {} -> {} skipped: {e}",
                    dep.issue_id, dep.depends_on_id
                )),
            }
        }
    }

    // Phase 8: label reconciliation for records that carried a labels key.
    for record in &records {
        if !record.labels_present {
            continue;
        }
        let stored: HashSet<String> = storage
            .get_labels(&record.issue.id)?
            .into_iter()
            .collect();
        let wanted: HashSet<String> = record
            .issue
            .labels
            .iter()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        for label in wanted.difference(&stored) {
            storage.add_label(&record.issue.id, label, actor)?;
        }
        for label in stored.difference(&wanted) {
            storage.remove_label(&record.issue.id, label, actor)?;
        }
    }

    Ok(result)
}

/// Keep only the last occurrence of each ID, preserving input order of the
/// survivors.
fn dedup_last_wins(records: &mut Vec<ImportRecord>) {
    let mut last: HashMap<String, usize> = HashMap::new();
    for (idx, record) in records.iter().enumerate() {
        last.insert(record.issue.id.clone(), idx);
    }
    let mut idx = 0;
    records.retain(|record| {
        let keep = last[&record.issue.id] == idx;
        idx += 1;
        keep
    });
}

/// Rewrite every reference to `old_id` inside the batch: record IDs,
/// dependency endpoints, and word-bounded mentions in the text fields.
/// Stored rows are never touched here.
fn rename_in_batch(records: &mut [ImportRecord], old_id: &str, new_id: &str) {
    let pattern = format!(r"\b{}\b", regex::escape(old_id));
    let Ok(re) = Regex::new(&pattern) else { return };

    for record in records.iter_mut() {
        let issue = &mut record.issue;
        if issue.id == old_id {
            issue.id = new_id.to_string();
        }
        for dep in &mut issue.dependencies {
            if dep.issue_id == old_id {
                dep.issue_id = new_id.to_string();
            }
            if dep.depends_on_id == old_id {
                dep.depends_on_id = new_id.to_string();
            }
        }
        for field in [
            &mut issue.description,
            &mut issue.design,
            &mut issue.acceptance_criteria,
            &mut issue.notes,
        ] {
            if let Some(text) = field.as_mut() {
                if re.is_match(text) {
                    *text = re.replace_all(text, new_id).into_owned();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Dependency, DependencyType};
    use crate::util::hash::content_hash;

    fn options() -> ImportOptions {
        ImportOptions {
            resolve_collisions: true,
            actor: "test".into(),
            ..ImportOptions::default()
        }
    }

    fn make_issue(id: &str, title: &str) -> Issue {
        let mut issue = Issue::new(id, title);
        issue.created_at = chrono::DateTime::UNIX_EPOCH + chrono::Duration::days(1);
        issue.updated_at = issue.created_at;
        issue
    }

    fn dep(from: &str, to: &str) -> Dependency {
        Dependency {
            issue_id: from.into(),
            depends_on_id: to.into(),
            dep_type: DependencyType::Blocks,
            created_at: None,
            created_by: None,
        }
    }

    #[test]
    fn import_into_empty_store_creates_everything() {
        let mut store = SqliteStorage::open_memory().unwrap();
        let mut a = make_issue("bd-1", "First");
        a.labels = vec!["core".into()];
        let mut b = make_issue("bd-2", "Second");
        b.dependencies = vec![dep("bd-2", "bd-1")];

        let result = import_records(
            &mut store,
            vec![a.into(), b.into()],
            &options(),
        )
        .unwrap();

        assert_eq!(result.created, 2);
        assert_eq!(result.updated + result.unchanged + result.skipped, 0);
        assert_eq!(store.get_labels("bd-1").unwrap(), vec!["core"]);
        assert_eq!(store.get_dependency_records("bd-2").unwrap().len(), 1);
    }

    #[test]
    fn reimport_is_unchanged() {
        let mut store = SqliteStorage::open_memory().unwrap();
        let a = make_issue("bd-1", "First");
        import_records(&mut store, vec![a.clone().into()], &options()).unwrap();

        // export and re-import the exact stored record
        let stored = store.get_all_issues_for_export().unwrap();
        let result = import_records(
            &mut store,
            stored.into_iter().map(Into::into).collect(),
            &options(),
        )
        .unwrap();
        assert_eq!(result.unchanged, 1);
        assert_eq!(result.created + result.updated, 0);
    }

    #[test]
    fn same_content_newer_timestamp_is_updated() {
        let mut store = SqliteStorage::open_memory().unwrap();
        let a = make_issue("bd-1", "First");
        import_records(&mut store, vec![a.clone().into()], &options()).unwrap();

        let mut newer = store.get_issue("bd-1").unwrap().unwrap();
        newer.updated_at += chrono::Duration::hours(1);
        let result = import_records(&mut store, vec![newer.into()], &options()).unwrap();
        assert_eq!(result.updated, 1);
        assert_eq!(result.unchanged, 0);
    }

    #[test]
    fn collision_without_resolution_fails() {
        let mut store = SqliteStorage::open_memory().unwrap();
        store.create_issue(&make_issue("bd-1", "Mine"), "t").unwrap();

        let theirs = make_issue("bd-1", "Theirs");
        let err = import_records(
            &mut store,
            vec![theirs.into()],
            &ImportOptions {
                actor: "test".into(),
                ..ImportOptions::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, BeadsError::ImportCollision { count: 1 }));
    }

    #[test]
    fn collision_winner_is_lower_hash_and_existing_deps_survive() {
        let mut store = SqliteStorage::open_memory().unwrap();
        // DB: bd-1, bd-2, bd-3 with edges bd-1 -> bd-2, bd-3 -> bd-1
        for (id, title) in [("bd-1", "Local one"), ("bd-2", "Local two"), ("bd-3", "Local three")] {
            store.create_issue(&make_issue(id, title), "t").unwrap();
        }
        store.add_dependency(&dep("bd-1", "bd-2"), "t").unwrap();
        store.add_dependency(&dep("bd-3", "bd-1"), "t").unwrap();

        // Import records with the same IDs but different titles.
        let incoming: Vec<ImportRecord> = [
            ("bd-1", "Remote one"),
            ("bd-2", "Remote two"),
            ("bd-3", "Remote three"),
        ]
        .into_iter()
        .map(|(id, title)| make_issue(id, title).into())
        .collect();

        let result = import_records(&mut store, incoming.clone(), &options()).unwrap();
        assert_eq!(result.collision_ids.len(), 3);
        assert_eq!(result.id_mapping.len(), 3);

        // Each contested ID holds the content with the lower hash.
        for (record, (id, title)) in incoming.iter().zip([
            ("bd-1", "Remote one"),
            ("bd-2", "Remote two"),
            ("bd-3", "Remote three"),
        ]) {
            let local_title = title.replace("Remote", "Local");
            let local = {
                let mut i = make_issue(id, &local_title);
                i.title = local_title.clone();
                i
            };
            let winner = store.get_issue(id).unwrap().unwrap();
            if content_hash(&local) <= content_hash(&record.issue) {
                assert_eq!(winner.title, local_title, "{id}");
            } else {
                assert_eq!(winner.title, *title, "{id}");
            }
            // Loser is alive under its fresh ID.
            let fresh = &result.id_mapping[id];
            assert!(store.get_issue(fresh).unwrap().is_some());
        }

        // The two pre-existing edges still exist and still point at the
        // contested IDs — whatever rows retained them.
        let all = store.get_all_dependency_records().unwrap();
        let flat: Vec<(String, String)> = all
            .values()
            .flatten()
            .map(|d| (d.issue_id.clone(), d.depends_on_id.clone()))
            .collect();

        let bd1_owner = if store.get_issue("bd-1").unwrap().unwrap().title == "Local one" {
            "bd-1".to_string()
        } else {
            result.id_mapping["bd-1"].clone()
        };
        let bd3_owner = if store.get_issue("bd-3").unwrap().unwrap().title == "Local three" {
            "bd-3".to_string()
        } else {
            result.id_mapping["bd-3"].clone()
        };
        assert!(flat.contains(&(bd1_owner, "bd-2".to_string())));
        assert!(flat.contains(&(bd3_owner, "bd-1".to_string())));
    }

    #[test]
    fn collision_determinism_ties_prefer_existing() {
        let mut store = SqliteStorage::open_memory().unwrap();
        let local = make_issue("bd-1", "Same title");
        store.create_issue(&local, "t").unwrap();

        // identical content, different timestamps: ExactMatch, not collision
        let mut incoming = make_issue("bd-1", "Same title");
        incoming.updated_at += chrono::Duration::hours(2);
        let result = import_records(&mut store, vec![incoming.into()], &options()).unwrap();
        assert!(result.collision_ids.is_empty());
        assert_eq!(result.updated, 1);
    }

    #[test]
    fn prefix_mismatch_reported() {
        let mut store = SqliteStorage::open_memory().unwrap();
        store.set_config(KEY_ISSUE_PREFIX, "proj").unwrap();

        let result = import_records(
            &mut store,
            vec![make_issue("old-1", "a").into()],
            &options(),
        )
        .unwrap();
        assert!(result.prefix_mismatch);
        assert_eq!(result.expected_prefix.as_deref(), Some("proj"));
        assert_eq!(result.mismatch_prefixes, vec!["old"]);
        assert_eq!(store.count_issues().unwrap(), 0);
    }

    #[test]
    fn prefix_rename_rewrites_ids_deps_and_text() {
        let mut store = SqliteStorage::open_memory().unwrap();
        store.set_config(KEY_ISSUE_PREFIX, "proj").unwrap();

        let mut one = make_issue("old-1", "One");
        one.notes = Some("tracked in old-1; blocks old-2".into());
        let mut two = make_issue("old-2", "Two");
        two.dependencies = vec![dep("old-2", "old-1")];
        let three = make_issue("old-3", "Three");

        let opts = ImportOptions {
            rename_on_import: true,
            ..options()
        };
        let result =
            import_records(&mut store, vec![one.into(), two.into(), three.into()], &opts)
                .unwrap();

        assert_eq!(result.created, 3);
        assert_eq!(result.id_mapping["old-1"], "proj-1");
        assert_eq!(result.id_mapping["old-2"], "proj-2");
        assert_eq!(result.id_mapping["old-3"], "proj-3");

        let deps = store.get_dependency_records("proj-2").unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].depends_on_id, "proj-1");

        let renamed = store.get_issue("proj-1").unwrap().unwrap();
        assert_eq!(
            renamed.notes.as_deref(),
            Some("tracked in proj-1; blocks proj-2")
        );
    }

    #[test]
    fn duplicate_ids_in_batch_last_wins() {
        let mut store = SqliteStorage::open_memory().unwrap();
        let first = make_issue("bd-1", "First version");
        let second = make_issue("bd-1", "Second version");

        let result =
            import_records(&mut store, vec![first.into(), second.into()], &options()).unwrap();
        assert_eq!(result.created, 1);
        assert_eq!(result.skipped, 1);
        assert_eq!(
            store.get_issue("bd-1").unwrap().unwrap().title,
            "Second version"
        );
    }

    #[test]
    fn counters_are_synced_after_import() {
        let mut store = SqliteStorage::open_memory().unwrap();
        import_records(
            &mut store,
            vec![make_issue("bd-41", "a").into()],
            &options(),
        )
        .unwrap();
        assert_eq!(store.next_id("bd").unwrap(), "bd-42");
    }

    #[test]
    fn missing_dep_target_warns_or_fails() {
        let mut store = SqliteStorage::open_memory().unwrap();
        let mut a = make_issue("bd-1", "a");
        a.dependencies = vec![dep("bd-1", "bd-404")];

        let result = import_records(&mut store, vec![a.clone().into()], &options()).unwrap();
        assert_eq!(result.warnings.len(), 1);

        let mut store = SqliteStorage::open_memory().unwrap();
        let strict = ImportOptions {
            strict_deps: true,
            ..options()
        };
        assert!(import_records(&mut store, vec![a.into()], &strict).is_err());
    }

    #[test]
    fn labels_reconcile_by_symmetric_difference() {
        let mut store = SqliteStorage::open_memory().unwrap();
        let mut a = make_issue("bd-1", "a");
        a.labels = vec!["keep".into(), "drop".into()];
        import_records(&mut store, vec![a.into()], &options()).unwrap();

        let mut updated = store.get_issue("bd-1").unwrap().unwrap();
        updated.labels = vec!["keep".into(), "new".into()];
        import_records(&mut store, vec![updated.into()], &options()).unwrap();
        assert_eq!(store.get_labels("bd-1").unwrap(), vec!["keep", "new"]);

        // absent labels key leaves labels alone
        let bare = store.get_issue("bd-1").unwrap().unwrap();
        let record = ImportRecord {
            issue: {
                let mut i = bare;
                i.labels = Vec::new();
                i
            },
            labels_present: false,
        };
        import_records(&mut store, vec![record], &options()).unwrap();
        assert_eq!(store.get_labels("bd-1").unwrap(), vec!["keep", "new"]);
    }

    #[test]
    fn parse_records_tracks_labels_presence() {
        let content = concat!(
            r#"{"id":"bd-1","title":"a","status":"open","priority":2,"issue_type":"task","created_at":"2026-01-01T00:00:00Z","updated_at":"2026-01-01T00:00:00Z","labels":[]}"#,
            "\n",
            r#"{"id":"bd-2","title":"b","status":"open","priority":2,"issue_type":"task","created_at":"2026-01-01T00:00:00Z","updated_at":"2026-01-01T00:00:00Z"}"#,
            "\n",
        );
        let records = parse_records(content).unwrap();
        assert!(records[0].labels_present);
        assert!(!records[1].labels_present);
    }

    #[test]
    fn import_normalizes_closure_invariant() {
        let mut store = SqliteStorage::open_memory().unwrap();
        let mut a = make_issue("bd-1", "a");
        a.status = crate::model::Status::Closed;
        a.closed_at = None;
        import_records(&mut store, vec![a.into()], &options()).unwrap();

        let stored = store.get_issue("bd-1").unwrap().unwrap();
        assert!(stored.closed_at.is_some());
    }
}
