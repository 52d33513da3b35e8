//! Content hashing and structural record equality.
//!
//! The collision tie-breaker hashes the canonical JSON of the
//! content-defining fields with SHA256. Field order is fixed by
//! `serde_json`'s sorted object keys, so the hash is stable across
//! exporters that order fields differently.

use serde_json::json;
use sha2::{Digest, Sha256};

use crate::model::Issue;

/// Compute the SHA256 content hash for an issue.
///
/// Fields included: title, description, design, `acceptance_criteria`,
/// notes, status, priority, `issue_type`, assignee, labels (sorted).
///
/// Fields excluded: id, timestamps, dependencies (edges are owned
/// separately), `estimated_minutes`, `external_ref`.
#[must_use]
pub fn content_hash(issue: &Issue) -> String {
    let mut labels = issue.labels.clone();
    labels.sort();
    labels.dedup();

    let canonical = json!({
        "title": issue.title,
        "description": issue.description.as_deref().unwrap_or(""),
        "design": issue.design.as_deref().unwrap_or(""),
        "acceptance_criteria": issue.acceptance_criteria.as_deref().unwrap_or(""),
        "notes": issue.notes.as_deref().unwrap_or(""),
        "status": issue.status.as_str(),
        "priority": issue.priority.0,
        "issue_type": issue.issue_type.as_str(),
        "assignee": issue.assignee.as_deref().unwrap_or(""),
        "labels": labels,
    });

    let mut hasher = Sha256::new();
    // serde_json maps are ordered by key, so this serialization is canonical
    hasher.update(canonical.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Structural equality of two issue records.
///
/// Compares the canonical export forms (labels sorted, dependency edges
/// ordered), so records that differ only in field order or label order
/// compare equal. Timestamps participate: a record whose `updated_at`
/// changed is not equal to its predecessor.
#[must_use]
pub fn semantically_equal(a: &Issue, b: &Issue) -> bool {
    let left = serde_json::to_value(a.canonicalized()).unwrap_or_default();
    let right = serde_json::to_value(b.canonicalized()).unwrap_or_default();
    left == right
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Dependency, DependencyType, Status};

    fn make_issue(id: &str, title: &str) -> Issue {
        Issue::new(id, title)
    }

    #[test]
    fn hash_is_deterministic_hex() {
        let issue = make_issue("bd-1", "Test Issue");
        let h1 = content_hash(&issue);
        let h2 = content_hash(&issue);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hash_ignores_id_and_timestamps() {
        let a = make_issue("bd-1", "Same");
        let mut b = make_issue("bd-2", "Same");
        b.updated_at = b.updated_at + chrono::Duration::hours(5);
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn hash_changes_with_content() {
        let a = make_issue("bd-1", "One");
        let mut b = make_issue("bd-1", "One");
        b.status = Status::Blocked;
        assert_ne!(content_hash(&a), content_hash(&b));

        let mut c = make_issue("bd-1", "One");
        c.labels.push("urgent".into());
        assert_ne!(content_hash(&a), content_hash(&c));
    }

    #[test]
    fn hash_ignores_label_order() {
        let mut a = make_issue("bd-1", "One");
        a.labels = vec!["x".into(), "y".into()];
        let mut b = make_issue("bd-1", "One");
        b.labels = vec!["y".into(), "x".into()];
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn semantic_equality_ignores_ordering() {
        let mut a = make_issue("bd-1", "One");
        a.created_at = chrono::DateTime::UNIX_EPOCH;
        a.updated_at = chrono::DateTime::UNIX_EPOCH;
        let mut b = a.clone();

        a.labels = vec!["x".into(), "y".into()];
        b.labels = vec!["y".into(), "x".into()];
        a.dependencies = vec![
            Dependency {
                issue_id: "bd-1".into(),
                depends_on_id: "bd-2".into(),
                dep_type: DependencyType::Blocks,
                created_at: None,
                created_by: None,
            },
            Dependency {
                issue_id: "bd-1".into(),
                depends_on_id: "bd-3".into(),
                dep_type: DependencyType::Related,
                created_at: None,
                created_by: None,
            },
        ];
        b.dependencies = a.dependencies.iter().rev().cloned().collect();

        assert!(semantically_equal(&a, &b));

        b.notes = Some("changed".into());
        assert!(!semantically_equal(&a, &b));
    }
}
