//! Command execution backend: RPC when a daemon is reachable, direct
//! storage access otherwise.
//!
//! The fallback is per-process and sticky: the first RPC transport error
//! or unsupported-method response demotes the backend to direct mode with
//! a single user-visible warning, and the command finishes locally. In
//! direct mode the flush pipeline degenerates to one export at the end of
//! the command (the process is about to exit; there is nothing to
//! debounce).

use serde_json::{json, Value};
use std::str::FromStr;

use crate::config::Session;
use crate::daemon::client::{self, RpcClient};
use crate::daemon::protocol::{issue_update_from_value, methods, StatusData};
use crate::error::{BeadsError, Result};
use crate::model::{Dependency, DependencyType, Issue, Status};
use crate::storage::{SearchFilters, SqliteStorage};
use crate::sync::export::{export_to_jsonl, ExportConfig};
use crate::sync::{auto_import_if_empty, import_from_jsonl, ImportOptions, ImportResult};

/// Where operations execute.
enum Mode {
    Rpc(RpcClient),
    Direct {
        storage: Box<SqliteStorage>,
        mutated: bool,
    },
}

pub struct Backend {
    session: Session,
    mode: Mode,
}

impl Backend {
    /// Establish a backend for this invocation.
    ///
    /// Order per the client contract: an answering socket wins; otherwise
    /// storage opens in-process (running the auto-import bootstrap), a
    /// daemon may be auto-started and used, and failing all that the
    /// command runs directly.
    pub fn establish(session: Session) -> Result<Self> {
        if let Some(rpc) = client::connect(&session) {
            return Ok(Self {
                session,
                mode: Mode::Rpc(rpc),
            });
        }

        let mut storage = session.open_storage()?;
        if !session.overrides.no_auto_import {
            auto_import_if_empty(&mut storage, &session.paths, &session.actor())?;
        }

        if let Some(rpc) = client::connect_or_start(&session, Some(&storage)) {
            drop(storage);
            return Ok(Self {
                session,
                mode: Mode::Rpc(rpc),
            });
        }
        if session.daemon_enabled() {
            client::warn_direct_fallback("no daemon and auto-start unavailable");
        }

        Ok(Self {
            session,
            mode: Mode::Direct {
                storage: Box::new(storage),
                mutated: false,
            },
        })
    }

    /// Direct-mode backend, never touching RPC. Used by commands that own
    /// the whole workspace anyway (import, export, sync).
    pub fn direct(session: Session) -> Result<Self> {
        let mut storage = session.open_storage()?;
        if !session.overrides.no_auto_import {
            auto_import_if_empty(&mut storage, &session.paths, &session.actor())?;
        }
        Ok(Self {
            session,
            mode: Mode::Direct {
                storage: Box::new(storage),
                mutated: false,
            },
        })
    }

    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    #[must_use]
    pub const fn is_rpc(&self) -> bool {
        matches!(self.mode, Mode::Rpc(_))
    }

    /// Attempt an RPC call; `None` means "run it directly instead".
    ///
    /// Transport errors and capability misses demote this backend to
    /// direct mode (with the one-line warning); a demotion failure is a
    /// real error.
    fn try_rpc(&mut self, method: &str, args: Value) -> Option<Result<Value>> {
        let Mode::Rpc(ref rpc) = self.mode else {
            return None;
        };
        match rpc.call(method, args) {
            Err(
                e @ (BeadsError::UnsupportedMethod { .. }
                | BeadsError::Rpc { .. }
                | BeadsError::Io(_)),
            ) => {
                client::warn_direct_fallback(&e.to_string());
                match self.session.open_storage() {
                    Ok(storage) => {
                        self.mode = Mode::Direct {
                            storage: Box::new(storage),
                            mutated: false,
                        };
                        None
                    }
                    Err(open_err) => Some(Err(open_err)),
                }
            }
            other => Some(other),
        }
    }

    fn direct_storage(&mut self) -> (&mut SqliteStorage, &mut bool) {
        match self.mode {
            Mode::Direct {
                ref mut storage,
                ref mut mutated,
            } => (storage.as_mut(), mutated),
            // try_rpc either returned Some or demoted us
            Mode::Rpc(_) => unreachable!("direct_storage called while in RPC mode"),
        }
    }

    // === Operations ===

    pub fn create_issue(&mut self, issue: Issue) -> Result<Issue> {
        let actor = self.session.actor();
        if let Some(result) = self.try_rpc(
            methods::CREATE,
            json!({"issue": &issue, "actor": actor}),
        ) {
            return result.and_then(|v| Ok(serde_json::from_value(v)?));
        }

        let (storage, mutated) = self.direct_storage();
        let mut issue = issue;
        if issue.id.is_empty() {
            let prefix = storage
                .get_config(crate::config::KEY_ISSUE_PREFIX)?
                .unwrap_or_else(|| "bd".to_string());
            issue.id = storage.next_id(&prefix)?;
        }
        storage.create_issue(&issue, &actor)?;
        *mutated = true;
        storage
            .get_issue(&issue.id)?
            .ok_or(BeadsError::IssueNotFound { id: issue.id })
    }

    pub fn update_issue(&mut self, id: &str, fields: Value) -> Result<Issue> {
        let actor = self.session.actor();
        if let Some(result) = self.try_rpc(
            methods::UPDATE,
            json!({"id": id, "fields": &fields, "actor": actor}),
        ) {
            return result.and_then(|v| Ok(serde_json::from_value(v)?));
        }

        let update = issue_update_from_value(&fields)?;
        let (storage, mutated) = self.direct_storage();
        let issue = storage.update_issue(id, &update, &actor)?;
        *mutated = true;
        Ok(issue)
    }

    pub fn close_issue(&mut self, id: &str, reason: Option<&str>) -> Result<Issue> {
        let actor = self.session.actor();
        if let Some(result) = self.try_rpc(
            methods::CLOSE,
            json!({"id": id, "reason": reason, "actor": actor}),
        ) {
            return result.and_then(|v| Ok(serde_json::from_value(v)?));
        }

        let (storage, mutated) = self.direct_storage();
        let issue = storage.close_issue(id, reason, &actor)?;
        *mutated = true;
        Ok(issue)
    }

    pub fn get_issue(&mut self, id: &str) -> Result<Issue> {
        if let Some(result) = self.try_rpc(methods::GET, json!({"id": id})) {
            return result.and_then(|v| Ok(serde_json::from_value(v)?));
        }

        let (storage, _) = self.direct_storage();
        let mut issue = storage
            .get_issue(id)?
            .ok_or_else(|| BeadsError::IssueNotFound { id: id.to_string() })?;
        issue.dependencies = storage.get_dependency_records(id)?;
        Ok(issue)
    }

    pub fn list_issues(
        &mut self,
        query: Option<&str>,
        status: Option<&str>,
        assignee: Option<&str>,
        labels: &[String],
        limit: Option<usize>,
    ) -> Result<Vec<Issue>> {
        if let Some(result) = self.try_rpc(
            methods::LIST,
            json!({
                "query": query,
                "status": status,
                "assignee": assignee,
                "labels": labels,
                "limit": limit,
            }),
        ) {
            return result.and_then(|v| Ok(serde_json::from_value(v)?));
        }

        let mut filters = SearchFilters {
            labels_all: labels.to_vec(),
            limit,
            ..SearchFilters::default()
        };
        if let Some(status) = status {
            filters.statuses = Some(vec![Status::from_str(status)?]);
        }
        if let Some(assignee) = assignee {
            filters.assignee = Some(assignee.to_string());
        }
        let (storage, _) = self.direct_storage();
        storage.search_issues(query, &filters)
    }

    pub fn add_dependency(
        &mut self,
        issue_id: &str,
        depends_on_id: &str,
        dep_type: DependencyType,
    ) -> Result<()> {
        let actor = self.session.actor();
        if let Some(result) = self.try_rpc(
            methods::DEP_ADD,
            json!({
                "issue_id": issue_id,
                "depends_on_id": depends_on_id,
                "dep_type": dep_type.as_str(),
                "actor": actor,
            }),
        ) {
            return result.map(|_| ());
        }

        let (storage, mutated) = self.direct_storage();
        storage.add_dependency(
            &Dependency {
                issue_id: issue_id.to_string(),
                depends_on_id: depends_on_id.to_string(),
                dep_type,
                created_at: None,
                created_by: Some(actor.clone()),
            },
            &actor,
        )?;
        *mutated = true;
        Ok(())
    }

    pub fn remove_dependency(
        &mut self,
        issue_id: &str,
        depends_on_id: &str,
        dep_type: DependencyType,
    ) -> Result<bool> {
        let actor = self.session.actor();
        if let Some(result) = self.try_rpc(
            methods::DEP_REMOVE,
            json!({
                "issue_id": issue_id,
                "depends_on_id": depends_on_id,
                "dep_type": dep_type.as_str(),
                "actor": actor,
            }),
        ) {
            return result.map(|v| v["changed"].as_bool().unwrap_or(false));
        }

        let (storage, mutated) = self.direct_storage();
        let removed = storage.remove_dependency(issue_id, depends_on_id, dep_type, &actor)?;
        *mutated = *mutated || removed;
        Ok(removed)
    }

    pub fn add_label(&mut self, id: &str, label: &str) -> Result<bool> {
        let actor = self.session.actor();
        if let Some(result) = self.try_rpc(
            methods::LABEL_ADD,
            json!({"id": id, "label": label, "actor": actor}),
        ) {
            return result.map(|v| v["changed"].as_bool().unwrap_or(false));
        }
        let (storage, mutated) = self.direct_storage();
        let added = storage.add_label(id, label, &actor)?;
        *mutated = *mutated || added;
        Ok(added)
    }

    pub fn remove_label(&mut self, id: &str, label: &str) -> Result<bool> {
        let actor = self.session.actor();
        if let Some(result) = self.try_rpc(
            methods::LABEL_REMOVE,
            json!({"id": id, "label": label, "actor": actor}),
        ) {
            return result.map(|v| v["changed"].as_bool().unwrap_or(false));
        }
        let (storage, mutated) = self.direct_storage();
        let removed = storage.remove_label(id, label, &actor)?;
        *mutated = *mutated || removed;
        Ok(removed)
    }

    pub fn export(&mut self, output: Option<&std::path::Path>, force: bool) -> Result<(usize, String)> {
        // an explicit output path is always a local operation
        if output.is_none() {
            if let Some(result) = self.try_rpc(methods::EXPORT, Value::Null) {
                return result.map(|v| {
                    (
                        usize::try_from(v["exported"].as_u64().unwrap_or(0)).unwrap_or(0),
                        v["hash"].as_str().unwrap_or_default().to_string(),
                    )
                });
            }
        } else if self.is_rpc() {
            // demote silently; exporting elsewhere does not involve the daemon
            self.mode = Mode::Direct {
                storage: Box::new(self.session.open_storage()?),
                mutated: false,
            };
        }

        let target = output
            .map(std::path::Path::to_path_buf)
            .unwrap_or_else(|| self.session.paths.jsonl_path.clone());
        let (storage, _) = self.direct_storage();
        let result = export_to_jsonl(storage, &target, &ExportConfig { force, show_progress: true })?;
        Ok((result.exported, result.content_hash))
    }

    pub fn import(
        &mut self,
        input: Option<&std::path::Path>,
        options: &ImportOptions,
    ) -> Result<ImportResult> {
        // imports run locally: the daemon re-imports through its own watcher
        if self.is_rpc() && input.is_none() {
            if let Some(result) = self.try_rpc(methods::IMPORT, Value::Null) {
                return result.map(|v| ImportResult {
                    created: usize::try_from(v["created"].as_u64().unwrap_or(0)).unwrap_or(0),
                    updated: usize::try_from(v["updated"].as_u64().unwrap_or(0)).unwrap_or(0),
                    unchanged: usize::try_from(v["unchanged"].as_u64().unwrap_or(0)).unwrap_or(0),
                    skipped: usize::try_from(v["skipped"].as_u64().unwrap_or(0)).unwrap_or(0),
                    ..ImportResult::default()
                });
            }
        } else if self.is_rpc() {
            self.mode = Mode::Direct {
                storage: Box::new(self.session.open_storage()?),
                mutated: false,
            };
        }

        let source = input
            .map(std::path::Path::to_path_buf)
            .unwrap_or_else(|| self.session.paths.jsonl_path.clone());
        let (storage, mutated) = self.direct_storage();
        let result = import_from_jsonl(storage, &source, options)?;
        *mutated = true;
        Ok(result)
    }

    pub fn daemon_status(&mut self) -> Result<Option<StatusData>> {
        if let Some(result) = self.try_rpc(methods::STATUS, Value::Null) {
            return result.and_then(|v| Ok(Some(serde_json::from_value(v)?)));
        }
        Ok(None)
    }

    /// Finish the invocation. Direct mode flushes mutations to JSONL (the
    /// degenerate one-shot version of the debounced pipeline); RPC mode
    /// leaves flushing to the daemon.
    pub fn finish(self) -> Result<()> {
        let Mode::Direct { storage, mutated } = self.mode else {
            return Ok(());
        };
        if !mutated || self.session.overrides.no_auto_flush {
            return Ok(());
        }
        let mut storage = storage;
        match export_to_jsonl(
            &mut storage,
            &self.session.paths.jsonl_path,
            &ExportConfig::default(),
        ) {
            Ok(_) => {}
            // auto-flush is best-effort; the next flush reconverges
            Err(e) => tracing::debug!(error = %e, "auto-flush skipped"),
        }
        Ok(())
    }
}
