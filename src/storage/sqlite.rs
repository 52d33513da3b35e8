//! `SQLite` storage façade.
//!
//! Sole owner of the durable store. All mutations go through [`SqliteStorage::mutate`],
//! which wraps the work in an immediate transaction, appends audit events, and
//! marks touched issues dirty for the flush pipeline. Reads are plain queries.
//!
//! The collision primitives at the bottom of this file reach behind the CRUD
//! surface on purpose: remapping a collision loser rewrites its primary key
//! and every row the loser owns, which no public CRUD operation is allowed
//! to do.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::error::{BeadsError, Result};
use crate::model::{Dependency, DependencyType, Event, EventType, Issue, IssueType, Priority, Status};
use crate::storage::schema::apply_schema;
use crate::util::hash::{content_hash, semantically_equal};
use crate::util::id::{mint_hash_id, numeric_suffix, parse_id};

/// Metadata key prefix for per-prefix ID counters.
const COUNTER_KEY_PREFIX: &str = "counter.";

/// Durable storage over `SQLite`.
pub struct SqliteStorage {
    conn: Connection,
}

/// Mutation bookkeeping collected while a transaction closure runs.
///
/// Events and dirty marks are written after the closure succeeds, inside the
/// same transaction, so a failed mutation leaves no audit residue.
pub struct MutationContext {
    actor: String,
    events: Vec<(String, EventType, Option<String>)>,
    dirty_ids: Vec<String>,
}

impl MutationContext {
    fn new(actor: &str) -> Self {
        Self {
            actor: actor.to_string(),
            events: Vec::new(),
            dirty_ids: Vec::new(),
        }
    }

    /// Queue an audit event for `issue_id`.
    pub fn record_event(&mut self, event_type: EventType, issue_id: &str, comment: Option<String>) {
        self.events.push((issue_id.to_string(), event_type, comment));
    }

    /// Mark an issue as needing export.
    pub fn mark_dirty(&mut self, issue_id: &str) {
        self.dirty_ids.push(issue_id.to_string());
    }
}

/// Filters for [`SqliteStorage::search_issues`].
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub statuses: Option<Vec<Status>>,
    pub types: Option<Vec<IssueType>>,
    pub priority_min: Option<Priority>,
    pub priority_max: Option<Priority>,
    pub assignee: Option<String>,
    pub unassigned: bool,
    pub no_labels: bool,
    pub no_description: bool,
    /// All of these labels must be present.
    pub labels_all: Vec<String>,
    /// At least one of these labels must be present.
    pub labels_any: Vec<String>,
    pub ids: Option<Vec<String>>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub updated_after: Option<DateTime<Utc>>,
    pub updated_before: Option<DateTime<Utc>>,
    pub closed_after: Option<DateTime<Utc>>,
    pub closed_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Sparse field deltas for [`SqliteStorage::update_issue`].
///
/// `None` means "do not touch"; `Some(None)` on the doubly-optional fields
/// tombstones the value.
#[derive(Debug, Clone, Default)]
pub struct IssueUpdate {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub design: Option<Option<String>>,
    pub acceptance_criteria: Option<Option<String>>,
    pub notes: Option<Option<String>>,
    pub status: Option<Status>,
    pub priority: Option<Priority>,
    pub issue_type: Option<IssueType>,
    pub assignee: Option<Option<String>>,
    pub estimated_minutes: Option<Option<i32>>,
    pub external_ref: Option<Option<String>>,
    pub closed_at: Option<Option<DateTime<Utc>>>,
}

impl IssueUpdate {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.design.is_none()
            && self.acceptance_criteria.is_none()
            && self.notes.is_none()
            && self.status.is_none()
            && self.priority.is_none()
            && self.issue_type.is_none()
            && self.assignee.is_none()
            && self.estimated_minutes.is_none()
            && self.external_ref.is_none()
            && self.closed_at.is_none()
    }
}

/// Outcome of comparing one incoming record against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollisionOutcome {
    /// ID absent from the store.
    NewIssue,
    /// ID present with structurally equal content. No write needed.
    ExactMatch,
    /// ID present with different content.
    Collision,
}

/// A scored collision: who keeps the contested ID.
#[derive(Debug, Clone)]
pub struct CollisionScore {
    pub id: String,
    pub existing_hash: String,
    pub incoming_hash: String,
    /// True when the record already in the store keeps the ID.
    pub existing_wins: bool,
}

const ISSUE_COLUMNS: &str = "id, title, description, design, acceptance_criteria, notes, \
     status, priority, issue_type, assignee, estimated_minutes, external_ref, \
     created_at, updated_at, closed_at";

fn conv_err(msg: impl Into<String>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        msg.into().into(),
    )
}

fn parse_ts(value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conv_err(format!("bad timestamp '{value}': {e}")))
}

fn issue_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Issue> {
    let status: String = row.get("status")?;
    let issue_type: String = row.get("issue_type")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let closed_at: Option<String> = row.get("closed_at")?;

    Ok(Issue {
        id: row.get("id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        design: row.get("design")?,
        acceptance_criteria: row.get("acceptance_criteria")?,
        notes: row.get("notes")?,
        status: status.parse().map_err(|_| conv_err(format!("bad status '{status}'")))?,
        priority: Priority(row.get("priority")?),
        issue_type: issue_type
            .parse()
            .map_err(|_| conv_err(format!("bad issue_type '{issue_type}'")))?,
        assignee: row.get("assignee")?,
        estimated_minutes: row.get("estimated_minutes")?,
        external_ref: row.get("external_ref")?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
        closed_at: closed_at.as_deref().map(parse_ts).transpose()?,
        labels: Vec::new(),
        dependencies: Vec::new(),
    })
}

fn dependency_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Dependency> {
    let dep_type: String = row.get("type")?;
    let created_at: Option<String> = row.get("created_at")?;
    Ok(Dependency {
        issue_id: row.get("issue_id")?,
        depends_on_id: row.get("depends_on_id")?,
        dep_type: dep_type
            .parse()
            .map_err(|_| conv_err(format!("bad dependency type '{dep_type}'")))?,
        created_at: created_at.as_deref().map(parse_ts).transpose()?,
        created_by: row.get("created_by")?,
    })
}

impl SqliteStorage {
    /// Open a connection to the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_timeout(path, Some(30_000))
    }

    /// Open with an explicit busy timeout (ms).
    pub fn open_with_timeout(path: &Path, lock_timeout_ms: Option<u64>) -> Result<Self> {
        let conn = Connection::open(path)?;
        if let Some(timeout) = lock_timeout_ms {
            conn.busy_timeout(Duration::from_millis(timeout))?;
        }
        apply_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Open an in-memory database for testing.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Run a mutation inside an immediate transaction.
    ///
    /// After the closure succeeds, queued events are appended and touched
    /// issues are marked dirty, all inside the same transaction. Durable on
    /// return.
    pub fn mutate<F, R>(&mut self, actor: &str, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction, &mut MutationContext) -> Result<R>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let mut ctx = MutationContext::new(actor);

        let result = f(&tx, &mut ctx)?;

        for (issue_id, event_type, comment) in ctx.events {
            tx.execute(
                "INSERT INTO events (issue_id, event_type, actor, comment, created_at)
                 VALUES (?, ?, ?, ?, ?)",
                rusqlite::params![
                    issue_id,
                    event_type.as_str(),
                    ctx.actor,
                    comment,
                    Utc::now().to_rfc3339()
                ],
            )?;
        }

        for id in ctx.dirty_ids {
            tx.execute(
                "INSERT OR REPLACE INTO dirty_issues (issue_id, marked_at) VALUES (?, ?)",
                rusqlite::params![id, Utc::now().to_rfc3339()],
            )?;
        }

        tx.commit()?;
        Ok(result)
    }

    // === Issues ===

    /// Fetch an issue by exact ID. `Ok(None)` on absence.
    pub fn get_issue(&self, id: &str) -> Result<Option<Issue>> {
        let issue = self
            .conn
            .query_row(
                &format!("SELECT {ISSUE_COLUMNS} FROM issues WHERE id = ?"),
                [id],
                issue_from_row,
            )
            .optional()?;

        let Some(mut issue) = issue else {
            return Ok(None);
        };
        issue.labels = self.get_labels(id)?;
        Ok(Some(issue))
    }

    /// True if an issue row with this ID exists.
    pub fn id_exists(&self, id: &str) -> Result<bool> {
        let exists: Option<i64> = self
            .conn
            .query_row("SELECT 1 FROM issues WHERE id = ?", [id], |row| row.get(0))
            .optional()?;
        Ok(exists.is_some())
    }

    /// Create a new issue. Fails with `IssueExists` if the ID is taken.
    pub fn create_issue(&mut self, issue: &Issue, actor: &str) -> Result<()> {
        let issue = prepared_for_insert(issue)?;
        self.mutate(actor, |tx, ctx| {
            insert_issue_row(tx, &issue)?;
            insert_labels(tx, &issue.id, &issue.labels)?;
            ctx.record_event(
                EventType::Created,
                &issue.id,
                Some(format!("Created issue: {}", issue.title)),
            );
            ctx.mark_dirty(&issue.id);
            Ok(())
        })
    }

    /// Create a batch of issues atomically: either every row lands or none.
    pub fn create_issues(&mut self, issues: &[Issue], actor: &str) -> Result<()> {
        let prepared: Vec<Issue> = issues
            .iter()
            .map(prepared_for_insert)
            .collect::<Result<_>>()?;
        self.mutate(actor, |tx, ctx| {
            for issue in &prepared {
                insert_issue_row(tx, issue)?;
                insert_labels(tx, &issue.id, &issue.labels)?;
                ctx.record_event(
                    EventType::Created,
                    &issue.id,
                    Some(format!("Created issue: {}", issue.title)),
                );
                ctx.mark_dirty(&issue.id);
            }
            Ok(())
        })
    }

    /// Apply sparse field deltas to an issue.
    ///
    /// Only fields present in `updates` are written; `updated_at` is bumped
    /// and the closure invariant re-normalized. Returns the updated issue.
    pub fn update_issue(&mut self, id: &str, updates: &IssueUpdate, actor: &str) -> Result<Issue> {
        let mut issue = self
            .get_issue(id)?
            .ok_or_else(|| BeadsError::IssueNotFound { id: id.to_string() })?;

        if updates.is_empty() {
            return Ok(issue);
        }

        let mut changed: Vec<&'static str> = Vec::new();

        if let Some(ref title) = updates.title {
            issue.title.clone_from(title);
            changed.push("title");
        }
        if let Some(ref description) = updates.description {
            issue.description.clone_from(description);
            changed.push("description");
        }
        if let Some(ref design) = updates.design {
            issue.design.clone_from(design);
            changed.push("design");
        }
        if let Some(ref ac) = updates.acceptance_criteria {
            issue.acceptance_criteria.clone_from(ac);
            changed.push("acceptance_criteria");
        }
        if let Some(ref notes) = updates.notes {
            issue.notes.clone_from(notes);
            changed.push("notes");
        }
        if let Some(status) = updates.status {
            issue.status = status;
            changed.push("status");
        }
        if let Some(priority) = updates.priority {
            issue.priority = priority;
            changed.push("priority");
        }
        if let Some(issue_type) = updates.issue_type {
            issue.issue_type = issue_type;
            changed.push("issue_type");
        }
        if let Some(ref assignee) = updates.assignee {
            issue.assignee.clone_from(assignee);
            changed.push("assignee");
        }
        if let Some(estimated) = updates.estimated_minutes {
            issue.estimated_minutes = estimated;
            changed.push("estimated_minutes");
        }
        if let Some(ref external_ref) = updates.external_ref {
            issue.external_ref.clone_from(external_ref);
            changed.push("external_ref");
        }
        if let Some(closed_at) = updates.closed_at {
            issue.closed_at = closed_at;
            changed.push("closed_at");
        }

        issue.updated_at = Utc::now();
        issue.normalize_closed_at();
        validate_issue(&issue)?;

        let updated = issue.clone();
        self.mutate(actor, |tx, ctx| {
            update_issue_row(tx, &updated)?;
            ctx.record_event(
                EventType::Updated,
                &updated.id,
                Some(format!("Updated: {}", changed.join(", "))),
            );
            ctx.mark_dirty(&updated.id);
            Ok(())
        })?;

        Ok(issue)
    }

    /// Close an issue. Signals `AlreadyClosed` when it already is; callers on
    /// retry paths treat that kind as success.
    pub fn close_issue(&mut self, id: &str, reason: Option<&str>, actor: &str) -> Result<Issue> {
        let mut issue = self
            .get_issue(id)?
            .ok_or_else(|| BeadsError::IssueNotFound { id: id.to_string() })?;

        if issue.status == Status::Closed {
            return Err(BeadsError::AlreadyClosed { id: id.to_string() });
        }

        issue.status = Status::Closed;
        issue.updated_at = Utc::now();
        issue.closed_at = Some(issue.updated_at);

        let closed = issue.clone();
        self.mutate(actor, |tx, ctx| {
            update_issue_row(tx, &closed)?;
            ctx.record_event(
                EventType::Closed,
                &closed.id,
                reason.map(ToString::to_string),
            );
            ctx.mark_dirty(&closed.id);
            Ok(())
        })?;

        Ok(issue)
    }

    /// Total number of issues (the statistics the bootstrap trigger reads).
    pub fn count_issues(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM issues", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// All issue IDs, sorted.
    pub fn get_all_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT id FROM issues ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// Search with structured filters plus an optional substring query over
    /// title, description and notes.
    #[allow(clippy::too_many_lines)]
    pub fn search_issues(&self, query: Option<&str>, filters: &SearchFilters) -> Result<Vec<Issue>> {
        let mut sql = format!("SELECT {ISSUE_COLUMNS} FROM issues WHERE 1=1");
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(q) = query {
            sql.push_str(
                " AND (title LIKE '%'||?||'%' \
                 OR COALESCE(description,'') LIKE '%'||?||'%' \
                 OR COALESCE(notes,'') LIKE '%'||?||'%')",
            );
            for _ in 0..3 {
                params.push(Box::new(q.to_string()));
            }
        }

        if let Some(ref statuses) = filters.statuses {
            let placeholders = vec!["?"; statuses.len()].join(",");
            sql.push_str(&format!(" AND status IN ({placeholders})"));
            for status in statuses {
                params.push(Box::new(status.as_str().to_string()));
            }
        }

        if let Some(ref types) = filters.types {
            let placeholders = vec!["?"; types.len()].join(",");
            sql.push_str(&format!(" AND issue_type IN ({placeholders})"));
            for ty in types {
                params.push(Box::new(ty.as_str().to_string()));
            }
        }

        if let Some(min) = filters.priority_min {
            sql.push_str(" AND priority >= ?");
            params.push(Box::new(min.0));
        }
        if let Some(max) = filters.priority_max {
            sql.push_str(" AND priority <= ?");
            params.push(Box::new(max.0));
        }

        if filters.unassigned {
            sql.push_str(" AND (assignee IS NULL OR assignee = '')");
        } else if let Some(ref assignee) = filters.assignee {
            sql.push_str(" AND assignee = ?");
            params.push(Box::new(assignee.clone()));
        }

        if filters.no_description {
            sql.push_str(" AND (description IS NULL OR description = '')");
        }
        if filters.no_labels {
            sql.push_str(" AND id NOT IN (SELECT issue_id FROM labels)");
        }

        for label in &filters.labels_all {
            sql.push_str(" AND id IN (SELECT issue_id FROM labels WHERE label = ?)");
            params.push(Box::new(label.clone()));
        }
        if !filters.labels_any.is_empty() {
            let placeholders = vec!["?"; filters.labels_any.len()].join(",");
            sql.push_str(&format!(
                " AND id IN (SELECT issue_id FROM labels WHERE label IN ({placeholders}))"
            ));
            for label in &filters.labels_any {
                params.push(Box::new(label.clone()));
            }
        }

        if let Some(ref ids) = filters.ids {
            let placeholders = vec!["?"; ids.len()].join(",");
            sql.push_str(&format!(" AND id IN ({placeholders})"));
            for id in ids {
                params.push(Box::new(id.clone()));
            }
        }

        let ranges: [(&str, &Option<DateTime<Utc>>, &str); 6] = [
            ("created_at", &filters.created_after, ">="),
            ("created_at", &filters.created_before, "<="),
            ("updated_at", &filters.updated_after, ">="),
            ("updated_at", &filters.updated_before, "<="),
            ("closed_at", &filters.closed_after, ">="),
            ("closed_at", &filters.closed_before, "<="),
        ];
        for (column, bound, op) in ranges {
            if let Some(ts) = bound {
                sql.push_str(&format!(" AND {column} {op} ?"));
                params.push(Box::new(ts.to_rfc3339()));
            }
        }

        sql.push_str(" ORDER BY priority ASC, created_at ASC");
        if let Some(limit) = filters.limit {
            sql.push_str(" LIMIT ?");
            params.push(Box::new(i64::try_from(limit).unwrap_or(i64::MAX)));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(AsRef::as_ref).collect();
        let mut issues = stmt
            .query_map(param_refs.as_slice(), issue_from_row)?
            .collect::<rusqlite::Result<Vec<Issue>>>()?;

        let labels = self.get_labels_for_issues(issues.iter().map(|i| i.id.clone()).collect())?;
        for issue in &mut issues {
            if let Some(l) = labels.get(&issue.id) {
                issue.labels.clone_from(l);
            }
        }
        Ok(issues)
    }

    // === Dependencies ===

    /// Add a dependency edge.
    ///
    /// Enforces edge uniqueness, the self-loop ban, and (for `blocks` /
    /// `parent-child`) the cycle ban via a recursive reachability query.
    pub fn add_dependency(&mut self, dep: &Dependency, actor: &str) -> Result<()> {
        if dep.issue_id == dep.depends_on_id {
            return Err(BeadsError::SelfDependency {
                id: dep.issue_id.clone(),
            });
        }
        if !self.id_exists(&dep.issue_id)? {
            return Err(BeadsError::IssueNotFound {
                id: dep.issue_id.clone(),
            });
        }
        if !self.id_exists(&dep.depends_on_id)? {
            return Err(BeadsError::DependencyTargetMissing {
                id: dep.depends_on_id.clone(),
            });
        }
        if dep.dep_type.is_acyclic()
            && self.would_create_cycle(&dep.issue_id, &dep.depends_on_id)?
        {
            return Err(BeadsError::DependencyCycle {
                path: format!("{} -> {}", dep.issue_id, dep.depends_on_id),
            });
        }

        let dep = dep.clone();
        self.mutate(actor, |tx, ctx| {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO dependencies (issue_id, depends_on_id, type, created_at, created_by)
                 VALUES (?, ?, ?, ?, ?)",
                rusqlite::params![
                    dep.issue_id,
                    dep.depends_on_id,
                    dep.dep_type.as_str(),
                    dep.created_at.unwrap_or_else(Utc::now).to_rfc3339(),
                    dep.created_by,
                ],
            )?;
            if inserted > 0 {
                ctx.record_event(
                    EventType::DependencyAdded,
                    &dep.issue_id,
                    Some(format!("{} {} {}", dep.issue_id, dep.dep_type, dep.depends_on_id)),
                );
                ctx.mark_dirty(&dep.issue_id);
            }
            Ok(())
        })
    }

    /// Remove a dependency edge. No-op (Ok) when the edge is absent.
    pub fn remove_dependency(
        &mut self,
        issue_id: &str,
        depends_on_id: &str,
        dep_type: DependencyType,
        actor: &str,
    ) -> Result<bool> {
        let issue_id = issue_id.to_string();
        let depends_on_id = depends_on_id.to_string();
        self.mutate(actor, |tx, ctx| {
            let removed = tx.execute(
                "DELETE FROM dependencies WHERE issue_id = ? AND depends_on_id = ? AND type = ?",
                rusqlite::params![issue_id, depends_on_id, dep_type.as_str()],
            )?;
            if removed > 0 {
                ctx.record_event(
                    EventType::DependencyRemoved,
                    &issue_id,
                    Some(format!("{issue_id} {dep_type} {depends_on_id}")),
                );
                ctx.mark_dirty(&issue_id);
            }
            Ok(removed > 0)
        })
    }

    /// Reachability check: is `issue_id` reachable from `depends_on_id` over
    /// acyclic-typed edges? If so, adding `issue_id -> depends_on_id` closes
    /// a cycle.
    pub fn would_create_cycle(&self, issue_id: &str, depends_on_id: &str) -> Result<bool> {
        let exists: Option<i64> = self
            .conn
            .query_row(
                r"
                WITH RECURSIVE reachable(id) AS (
                    SELECT depends_on_id FROM dependencies
                    WHERE issue_id = ?1 AND type IN ('blocks', 'parent-child')
                    UNION
                    SELECT d.depends_on_id
                    FROM dependencies d
                    JOIN reachable r ON d.issue_id = r.id
                    WHERE d.type IN ('blocks', 'parent-child')
                )
                SELECT 1 FROM reachable WHERE id = ?2 LIMIT 1
                ",
                rusqlite::params![depends_on_id, issue_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    /// Outgoing dependency edges of one issue.
    pub fn get_dependency_records(&self, issue_id: &str) -> Result<Vec<Dependency>> {
        let mut stmt = self.conn.prepare(
            "SELECT issue_id, depends_on_id, type, created_at, created_by
             FROM dependencies WHERE issue_id = ? ORDER BY depends_on_id, type",
        )?;
        let deps = stmt
            .query_map([issue_id], dependency_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(deps)
    }

    /// Every dependency edge, grouped by owning issue.
    pub fn get_all_dependency_records(&self) -> Result<HashMap<String, Vec<Dependency>>> {
        let mut stmt = self.conn.prepare(
            "SELECT issue_id, depends_on_id, type, created_at, created_by
             FROM dependencies ORDER BY issue_id, depends_on_id, type",
        )?;
        let mut map: HashMap<String, Vec<Dependency>> = HashMap::new();
        for dep in stmt.query_map([], dependency_from_row)? {
            let dep = dep?;
            map.entry(dep.issue_id.clone()).or_default().push(dep);
        }
        Ok(map)
    }

    /// Outgoing edge counts for a set of issues.
    pub fn get_dependency_counts(&self, ids: &[String]) -> Result<HashMap<String, usize>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!(
            "SELECT issue_id, COUNT(*) FROM dependencies
             WHERE issue_id IN ({placeholders}) GROUP BY issue_id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> =
            ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
        let mut map = HashMap::new();
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (id, count) = row?;
            map.insert(id, usize::try_from(count).unwrap_or(0));
        }
        Ok(map)
    }

    // === Labels ===

    /// Add a label. Idempotent; returns whether the label was new.
    pub fn add_label(&mut self, issue_id: &str, label: &str, actor: &str) -> Result<bool> {
        let label = label.trim().to_string();
        if label.is_empty() {
            return Err(BeadsError::validation("label", "cannot be empty"));
        }
        if !self.id_exists(issue_id)? {
            return Err(BeadsError::IssueNotFound {
                id: issue_id.to_string(),
            });
        }
        let issue_id = issue_id.to_string();
        self.mutate(actor, |tx, ctx| {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO labels (issue_id, label) VALUES (?, ?)",
                rusqlite::params![issue_id, label],
            )?;
            if inserted > 0 {
                ctx.record_event(EventType::LabelAdded, &issue_id, Some(label.clone()));
                ctx.mark_dirty(&issue_id);
            }
            Ok(inserted > 0)
        })
    }

    /// Remove a label. No-op (Ok(false)) when absent.
    pub fn remove_label(&mut self, issue_id: &str, label: &str, actor: &str) -> Result<bool> {
        let issue_id = issue_id.to_string();
        let label = label.trim().to_string();
        self.mutate(actor, |tx, ctx| {
            let removed = tx.execute(
                "DELETE FROM labels WHERE issue_id = ? AND label = ?",
                rusqlite::params![issue_id, label],
            )?;
            if removed > 0 {
                ctx.record_event(EventType::LabelRemoved, &issue_id, Some(label.clone()));
                ctx.mark_dirty(&issue_id);
            }
            Ok(removed > 0)
        })
    }

    /// Labels of one issue, sorted.
    pub fn get_labels(&self, issue_id: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT label FROM labels WHERE issue_id = ? ORDER BY label")?;
        let labels = stmt
            .query_map([issue_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(labels)
    }

    /// Labels for a set of issues, grouped by issue.
    pub fn get_labels_for_issues(
        &self,
        ids: Vec<String>,
    ) -> Result<HashMap<String, Vec<String>>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!(
            "SELECT issue_id, label FROM labels
             WHERE issue_id IN ({placeholders}) ORDER BY issue_id, label"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> =
            ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (id, label) = row?;
            map.entry(id).or_default().push(label);
        }
        Ok(map)
    }

    // === Events ===

    /// Audit events for one issue, oldest first.
    pub fn get_events(&self, issue_id: &str) -> Result<Vec<Event>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, issue_id, event_type, actor, comment, created_at
             FROM events WHERE issue_id = ? ORDER BY id",
        )?;
        let events = stmt
            .query_map([issue_id], |row| {
                let event_type: String = row.get("event_type")?;
                let created_at: String = row.get("created_at")?;
                Ok(Event {
                    id: row.get("id")?,
                    issue_id: row.get("issue_id")?,
                    event_type: serde_json::from_value(serde_json::Value::String(event_type.clone()))
                        .map_err(|_| conv_err(format!("bad event_type '{event_type}'")))?,
                    actor: row.get("actor")?,
                    comment: row.get("comment")?,
                    created_at: parse_ts(&created_at)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    // === Config / metadata ===

    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM config WHERE key = ?", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    pub fn set_config(&mut self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO config (key, value) VALUES (?, ?)",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }

    pub fn get_all_config(&self) -> Result<HashMap<String, String>> {
        let mut stmt = self.conn.prepare("SELECT key, value FROM config")?;
        let mut map = HashMap::new();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (key, value) = row?;
            map.insert(key, value);
        }
        Ok(map)
    }

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM metadata WHERE key = ?", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    pub fn set_metadata(&mut self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?, ?)",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }

    // === Dirty tracking (flush pipeline) ===

    pub fn get_dirty_issue_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT issue_id FROM dirty_issues ORDER BY marked_at")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    pub fn clear_dirty_issues(&mut self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!("DELETE FROM dirty_issues WHERE issue_id IN ({placeholders})");
        let param_refs: Vec<&dyn rusqlite::ToSql> =
            ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
        let removed = self.conn.execute(&sql, param_refs.as_slice())?;
        Ok(removed)
    }

    pub fn clear_all_dirty_issues(&mut self) -> Result<usize> {
        let removed = self.conn.execute("DELETE FROM dirty_issues", [])?;
        Ok(removed)
    }

    // === Export support ===

    /// Every issue with labels and dependency edges populated, sorted by ID.
    pub fn get_all_issues_for_export(&self) -> Result<Vec<Issue>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {ISSUE_COLUMNS} FROM issues ORDER BY id"))?;
        let mut issues = stmt
            .query_map([], issue_from_row)?
            .collect::<rusqlite::Result<Vec<Issue>>>()?;

        let mut labels = self.get_labels_for_issues(issues.iter().map(|i| i.id.clone()).collect())?;
        let mut deps = self.get_all_dependency_records()?;
        for issue in &mut issues {
            if let Some(l) = labels.remove(&issue.id) {
                issue.labels = l;
            }
            if let Some(d) = deps.remove(&issue.id) {
                issue.dependencies = d;
            }
        }
        Ok(issues)
    }

    /// Insert or fully replace an issue row during import.
    ///
    /// Unlike [`Self::update_issue`], the incoming record is authoritative:
    /// every column is written, including timestamps. Returns whether a new
    /// row was created.
    pub fn upsert_issue_for_import(&mut self, issue: &Issue, actor: &str) -> Result<bool> {
        let issue = prepared_for_insert(issue)?;
        let existed = self.id_exists(&issue.id)?;
        self.mutate(actor, |tx, ctx| {
            if existed {
                update_issue_row(tx, &issue)?;
            } else {
                insert_issue_row(tx, &issue)?;
                insert_labels(tx, &issue.id, &issue.labels)?;
            }
            ctx.record_event(
                EventType::Imported,
                &issue.id,
                Some(format!("Imported: {}", issue.title)),
            );
            ctx.mark_dirty(&issue.id);
            Ok(!existed)
        })
    }

    // === Collision primitives ===

    /// Compare incoming records against the store.
    ///
    /// An incoming record whose ID is present with the same content-defining
    /// fields is an [`CollisionOutcome::ExactMatch`] (the records may still
    /// differ in timestamps or edges; the importer decides unchanged vs
    /// updated). Present with different content, a
    /// [`CollisionOutcome::Collision`].
    pub fn detect_collisions(&self, incoming: &[Issue]) -> Result<Vec<CollisionOutcome>> {
        let mut outcomes = Vec::with_capacity(incoming.len());
        for record in incoming {
            let outcome = match self.get_issue(&record.id)? {
                None => CollisionOutcome::NewIssue,
                Some(existing) => {
                    if content_hash(&existing) == content_hash(record) {
                        CollisionOutcome::ExactMatch
                    } else {
                        CollisionOutcome::Collision
                    }
                }
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Full structural comparison of a stored issue (labels and edges
    /// loaded) against an incoming record.
    pub fn record_equals_stored(&self, record: &Issue) -> Result<bool> {
        let Some(mut existing) = self.get_issue(&record.id)? else {
            return Ok(false);
        };
        existing.dependencies = self.get_dependency_records(&existing.id)?;
        Ok(semantically_equal(&existing, record))
    }

    /// Score a collision: the record with the lexicographically lower
    /// content hash keeps the contested ID; a tie keeps the existing record.
    pub fn score_collision(&self, incoming: &Issue) -> Result<CollisionScore> {
        let existing = self
            .get_issue(&incoming.id)?
            .ok_or_else(|| BeadsError::IssueNotFound {
                id: incoming.id.clone(),
            })?;
        let existing_hash = content_hash(&existing);
        let incoming_hash = content_hash(incoming);
        Ok(CollisionScore {
            id: incoming.id.clone(),
            existing_wins: existing_hash <= incoming_hash,
            existing_hash,
            incoming_hash,
        })
    }

    /// Remap an existing issue (a collision loser) to a fresh ID.
    ///
    /// Rewrites the issue row, the rows the loser owns (labels, events,
    /// dirty marks, outgoing dependency edges), and ID mentions inside the
    /// loser's own text fields. Dependency rows owned by other issues are
    /// left untouched even when they point at the contested ID: after the
    /// swap that ID belongs to the collision winner, which is exactly what
    /// those edges should now reference.
    pub fn remap_collision(&mut self, old_id: &str, new_id: &str, actor: &str) -> Result<()> {
        if self.id_exists(new_id)? {
            return Err(BeadsError::IssueExists {
                id: new_id.to_string(),
            });
        }
        let old = old_id.to_string();
        let new = new_id.to_string();
        self.mutate(actor, |tx, ctx| {
            // Labels and events hold FK references into issues; swapping the
            // primary key row-by-row is only consistent at commit time.
            tx.execute_batch("PRAGMA defer_foreign_keys = ON")?;
            tx.execute(
                "UPDATE dependencies SET issue_id = ? WHERE issue_id = ?",
                rusqlite::params![new, old],
            )?;
            tx.execute(
                "UPDATE issues SET id = ? WHERE id = ?",
                rusqlite::params![new, old],
            )?;
            tx.execute(
                "UPDATE labels SET issue_id = ? WHERE issue_id = ?",
                rusqlite::params![new, old],
            )?;
            tx.execute(
                "UPDATE events SET issue_id = ? WHERE issue_id = ?",
                rusqlite::params![new, old],
            )?;
            tx.execute(
                "UPDATE dirty_issues SET issue_id = ? WHERE issue_id = ?",
                rusqlite::params![new, old],
            )?;

            let pattern = format!(r"\b{}\b", regex::escape(&old));
            let re = regex::Regex::new(&pattern)
                .map_err(|e| BeadsError::Config(format!("bad remap pattern: {e}")))?;
            let fields: Option<(Option<String>, Option<String>, Option<String>, Option<String>)> =
                tx.query_row(
                    "SELECT description, design, acceptance_criteria, notes FROM issues WHERE id = ?",
                    [&new],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;
            if let Some((description, design, acceptance, notes)) = fields {
                let rewrite = |text: Option<String>| {
                    text.map(|t| re.replace_all(&t, new.as_str()).into_owned())
                };
                tx.execute(
                    "UPDATE issues SET description = ?, design = ?, acceptance_criteria = ?, notes = ?
                     WHERE id = ?",
                    rusqlite::params![
                        rewrite(description),
                        rewrite(design),
                        rewrite(acceptance),
                        rewrite(notes),
                        new,
                    ],
                )?;
            }

            ctx.record_event(
                EventType::Remapped,
                &new,
                Some(format!("Remapped from {old} (collision)")),
            );
            ctx.mark_dirty(&new);
            Ok(())
        })
    }

    /// Remove issues whose deletion was accepted by the three-way snapshot
    /// diff. Engine-internal: user-facing deletion does not exist, closure
    /// does. Labels and events cascade; dependency edges in either
    /// direction are swept explicitly.
    pub fn remove_accepted_deletions(&mut self, ids: &[String], actor: &str) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids = ids.to_vec();
        self.mutate(actor, |tx, _ctx| {
            let mut removed = 0;
            for id in &ids {
                tx.execute(
                    "DELETE FROM dependencies WHERE issue_id = ? OR depends_on_id = ?",
                    rusqlite::params![id, id],
                )?;
                tx.execute("DELETE FROM dirty_issues WHERE issue_id = ?", [id])?;
                removed += tx.execute("DELETE FROM issues WHERE id = ?", [id])?;
            }
            Ok(removed)
        })
    }

    /// Mint the next counter-based ID for a prefix.
    pub fn next_id(&mut self, prefix: &str) -> Result<String> {
        let key = format!("{COUNTER_KEY_PREFIX}{prefix}");
        let mut counter: u64 = self
            .get_metadata(&key)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        loop {
            counter += 1;
            let candidate = format!("{prefix}-{counter}");
            if !self.id_exists(&candidate)? {
                self.set_metadata(&key, &counter.to_string())?;
                return Ok(candidate);
            }
        }
    }

    /// Mint a hash-suffixed ID for a collision loser.
    pub fn mint_collision_id(&self, prefix: &str, record_hash: &str, also_taken: &HashSet<String>) -> String {
        mint_hash_id(prefix, record_hash, |candidate| {
            also_taken.contains(candidate) || self.id_exists(candidate).unwrap_or(true)
        })
    }

    /// Recompute every per-prefix counter from the stored IDs.
    ///
    /// Called after imports so subsequent minted IDs cannot land on an
    /// imported one. Failure here is fatal to the import.
    pub fn sync_all_counters(&mut self) -> Result<()> {
        let mut counters: HashMap<String, u64> = HashMap::new();
        for id in self.get_all_ids()? {
            let Ok(parsed) = parse_id(&id) else { continue };
            let Some(n) = numeric_suffix(&id) else {
                continue;
            };
            let entry = counters.entry(parsed.prefix).or_insert(0);
            if n > *entry {
                *entry = n;
            }
        }
        for (prefix, max) in counters {
            let key = format!("{COUNTER_KEY_PREFIX}{prefix}");
            let stored: u64 = self
                .get_metadata(&key)?
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            if max > stored {
                self.set_metadata(&key, &max.to_string())?;
            }
        }
        Ok(())
    }
}

/// Validate and normalize an issue before insert.
fn prepared_for_insert(issue: &Issue) -> Result<Issue> {
    let mut issue = issue.clone();
    if issue.created_at.timestamp() == 0 {
        issue.created_at = Utc::now();
    }
    if issue.updated_at.timestamp() == 0 {
        issue.updated_at = issue.created_at;
    }
    issue.normalize_closed_at();
    issue.labels = issue
        .labels
        .iter()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();
    issue.labels.sort();
    issue.labels.dedup();
    validate_issue(&issue)?;
    Ok(issue)
}

fn validate_issue(issue: &Issue) -> Result<()> {
    parse_id(&issue.id)?;
    if issue.title.trim().is_empty() {
        return Err(BeadsError::validation("title", "cannot be empty"));
    }
    if issue.title.len() > 500 {
        return Err(BeadsError::validation("title", "longer than 500 characters"));
    }
    if !(0..=4).contains(&issue.priority.0) {
        return Err(BeadsError::InvalidPriority {
            priority: i64::from(issue.priority.0),
        });
    }
    Ok(())
}

fn insert_issue_row(tx: &Transaction, issue: &Issue) -> Result<()> {
    let result = tx.execute(
        "INSERT INTO issues (
            id, title, description, design, acceptance_criteria, notes,
            status, priority, issue_type, assignee, estimated_minutes,
            external_ref, created_at, updated_at, closed_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            issue.id,
            issue.title,
            issue.description,
            issue.design,
            issue.acceptance_criteria,
            issue.notes,
            issue.status.as_str(),
            issue.priority.0,
            issue.issue_type.as_str(),
            issue.assignee,
            issue.estimated_minutes,
            issue.external_ref,
            issue.created_at.to_rfc3339(),
            issue.updated_at.to_rfc3339(),
            issue.closed_at.map(|dt| dt.to_rfc3339()),
        ],
    );
    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation
                && e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
        {
            Err(BeadsError::IssueExists {
                id: issue.id.clone(),
            })
        }
        Err(e) => Err(e.into()),
    }
}

fn update_issue_row(tx: &Transaction, issue: &Issue) -> Result<()> {
    tx.execute(
        "UPDATE issues SET
            title = ?, description = ?, design = ?, acceptance_criteria = ?, notes = ?,
            status = ?, priority = ?, issue_type = ?, assignee = ?, estimated_minutes = ?,
            external_ref = ?, updated_at = ?, closed_at = ?
         WHERE id = ?",
        rusqlite::params![
            issue.title,
            issue.description,
            issue.design,
            issue.acceptance_criteria,
            issue.notes,
            issue.status.as_str(),
            issue.priority.0,
            issue.issue_type.as_str(),
            issue.assignee,
            issue.estimated_minutes,
            issue.external_ref,
            issue.updated_at.to_rfc3339(),
            issue.closed_at.map(|dt| dt.to_rfc3339()),
            issue.id,
        ],
    )?;
    Ok(())
}

fn insert_labels(tx: &Transaction, issue_id: &str, labels: &[String]) -> Result<()> {
    for label in labels {
        tx.execute(
            "INSERT OR IGNORE INTO labels (issue_id, label) VALUES (?, ?)",
            rusqlite::params![issue_id, label],
        )?;
    }
    Ok(())
}
