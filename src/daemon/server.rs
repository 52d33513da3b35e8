//! RPC server: accept loop and method dispatch.
//!
//! One task per connection; the request/response protocol is strictly
//! one-shot (read a frame, write a frame, done), so a slow client can at
//! worst stall its own task. Storage sits behind a mutex — writes were
//! serialized by contract anyway — and every mutation nudges the flush
//! controller so the JSONL catches up.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;

use crate::config::ConfigPaths;
use crate::error::{BeadsError, Result};
use crate::model::{Dependency, DependencyType, Issue, Status};
use crate::storage::{SearchFilters, SqliteStorage};
use crate::sync::debounce::FlushController;
use crate::sync::export::{export_to_jsonl, ExportConfig};
use crate::sync::import::{import_from_jsonl, ImportOptions};

use super::lifecycle::DaemonPhase;
use super::protocol::{
    self, issue_update_from_value, methods, read_frame_async, write_frame_async, Request, Response,
    StatusData, PROTOCOL_VERSION,
};

/// Per-connection I/O deadline.
const CONNECTION_DEADLINE: Duration = Duration::from_secs(30);

/// Shared daemon context handed to every connection task.
pub struct ServerCtx {
    pub storage: Arc<Mutex<SqliteStorage>>,
    pub flush: Arc<FlushController>,
    pub paths: ConfigPaths,
    /// Cancelled by the `shutdown` method; the run loop listens.
    pub shutdown: CancellationToken,
    pub phase: Arc<Mutex<DaemonPhase>>,
    pub started: Instant,
}

/// Accept connections until cancelled. Returning early (bind torn down,
/// fatal accept error) makes the daemon exit so a supervisor can restart
/// it.
pub async fn serve(listener: UnixListener, ctx: Arc<ServerCtx>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let ctx = Arc::clone(&ctx);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, &ctx).await {
                                tracing::debug!(error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                        return;
                    }
                }
            }
        }
    }
}

async fn handle_connection(stream: tokio::net::UnixStream, ctx: &ServerCtx) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    let payload = tokio::time::timeout(CONNECTION_DEADLINE, read_frame_async(&mut reader))
        .await
        .map_err(|_| BeadsError::Timeout {
            operation: "rpc read".to_string(),
        })??;

    let response = match serde_json::from_slice::<Request>(&payload) {
        Ok(request) => dispatch(&request, ctx),
        Err(e) => Response::failure(
            crate::error::ErrorKind::SerializationError,
            format!("malformed request: {e}"),
        ),
    };

    let bytes = serde_json::to_vec(&response)?;
    tokio::time::timeout(CONNECTION_DEADLINE, write_frame_async(&mut writer, &bytes))
        .await
        .map_err(|_| BeadsError::Timeout {
            operation: "rpc write".to_string(),
        })??;
    Ok(())
}

/// Route one request. Version first, then method.
fn dispatch(request: &Request, ctx: &ServerCtx) -> Response {
    if request.protocol != PROTOCOL_VERSION {
        return Response::failure(
            crate::error::ErrorKind::Unsupported,
            format!(
                "protocol {} not supported (daemon speaks {})",
                request.protocol, PROTOCOL_VERSION
            ),
        );
    }

    let result = match request.method.as_str() {
        methods::HEALTH => Ok(json!({"ok": true, "pid": std::process::id()})),
        methods::STATUS => handle_status(ctx),
        methods::SHUTDOWN => {
            // let the response frame reach the client before the run loop
            // starts tearing the socket down
            let shutdown = ctx.shutdown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                shutdown.cancel();
            });
            Ok(json!({"stopping": true}))
        }
        methods::CREATE => handle_create(ctx, &request.args),
        methods::UPDATE => handle_update(ctx, &request.args),
        methods::CLOSE => handle_close(ctx, &request.args),
        methods::GET => handle_get(ctx, &request.args),
        methods::LIST => handle_list(ctx, &request.args),
        methods::DEP_ADD => handle_dep(ctx, &request.args, true),
        methods::DEP_REMOVE => handle_dep(ctx, &request.args, false),
        methods::LABEL_ADD => handle_label(ctx, &request.args, true),
        methods::LABEL_REMOVE => handle_label(ctx, &request.args, false),
        methods::EXPORT => handle_export(ctx),
        methods::IMPORT => handle_import(ctx),
        _ => return Response::unsupported(&request.method),
    };

    match result {
        Ok(data) => Response::success(data),
        Err(e) => Response::failure(e.kind(), e.to_string()),
    }
}

fn actor_from(args: &Value) -> String {
    args.get("actor")
        .and_then(Value::as_str)
        .unwrap_or("daemon-client")
        .to_string()
}

fn handle_status(ctx: &ServerCtx) -> Result<Value> {
    let store = ctx.storage.lock();
    let status = StatusData {
        pid: std::process::id(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol: PROTOCOL_VERSION,
        phase: format!("{:?}", *ctx.phase.lock()).to_lowercase(),
        db_path: ctx.paths.db_path.display().to_string(),
        issue_count: store.count_issues()?,
        dirty_count: store.get_dirty_issue_ids()?.len(),
        uptime_secs: ctx.started.elapsed().as_secs(),
    };
    Ok(serde_json::to_value(status)?)
}

fn handle_create(ctx: &ServerCtx, args: &Value) -> Result<Value> {
    let actor = actor_from(args);
    let issue: Issue = serde_json::from_value(
        args.get("issue")
            .cloned()
            .ok_or_else(|| BeadsError::validation("issue", "missing"))?,
    )?;
    let created = {
        let mut store = ctx.storage.lock();
        let mut issue = issue;
        if issue.id.is_empty() {
            let prefix = store
                .get_config(crate::config::KEY_ISSUE_PREFIX)?
                .unwrap_or_else(|| "bd".to_string());
            issue.id = store.next_id(&prefix)?;
        }
        store.create_issue(&issue, &actor)?;
        store.get_issue(&issue.id)?
    };
    ctx.flush.mark_dirty();
    Ok(serde_json::to_value(created)?)
}

fn handle_update(ctx: &ServerCtx, args: &Value) -> Result<Value> {
    let actor = actor_from(args);
    let parsed: protocol::UpdateArgs = serde_json::from_value(args.clone())?;
    let update = issue_update_from_value(&parsed.fields)?;
    let updated = {
        let mut store = ctx.storage.lock();
        store.update_issue(&parsed.id, &update, &actor)?
    };
    ctx.flush.mark_dirty();
    Ok(serde_json::to_value(updated)?)
}

fn handle_close(ctx: &ServerCtx, args: &Value) -> Result<Value> {
    let actor = actor_from(args);
    let parsed: protocol::CloseArgs = serde_json::from_value(args.clone())?;
    let closed = {
        let mut store = ctx.storage.lock();
        store.close_issue(&parsed.id, parsed.reason.as_deref(), &actor)?
    };
    ctx.flush.mark_dirty();
    Ok(serde_json::to_value(closed)?)
}

fn handle_get(ctx: &ServerCtx, args: &Value) -> Result<Value> {
    let parsed: protocol::GetArgs = serde_json::from_value(args.clone())?;
    let store = ctx.storage.lock();
    let issue = store
        .get_issue(&parsed.id)?
        .ok_or(BeadsError::IssueNotFound { id: parsed.id })?;
    let mut issue = issue;
    issue.dependencies = store.get_dependency_records(&issue.id)?;
    Ok(serde_json::to_value(issue)?)
}

fn handle_list(ctx: &ServerCtx, args: &Value) -> Result<Value> {
    let parsed: protocol::ListArgs = serde_json::from_value(args.clone())?;
    let mut filters = SearchFilters {
        limit: parsed.limit,
        labels_all: parsed.labels,
        ..SearchFilters::default()
    };
    if let Some(ref status) = parsed.status {
        filters.statuses = Some(vec![Status::from_str(status)?]);
    }
    if let Some(assignee) = parsed.assignee {
        filters.assignee = Some(assignee);
    }
    let store = ctx.storage.lock();
    let issues = store.search_issues(parsed.query.as_deref(), &filters)?;
    Ok(serde_json::to_value(issues)?)
}

fn handle_dep(ctx: &ServerCtx, args: &Value, add: bool) -> Result<Value> {
    let actor = actor_from(args);
    let parsed: protocol::DepArgs = serde_json::from_value(args.clone())?;
    let dep_type = DependencyType::from_str(&parsed.dep_type)?;
    let changed = {
        let mut store = ctx.storage.lock();
        if add {
            store.add_dependency(
                &Dependency {
                    issue_id: parsed.issue_id,
                    depends_on_id: parsed.depends_on_id,
                    dep_type,
                    created_at: None,
                    created_by: Some(actor.clone()),
                },
                &actor,
            )?;
            true
        } else {
            store.remove_dependency(&parsed.issue_id, &parsed.depends_on_id, dep_type, &actor)?
        }
    };
    ctx.flush.mark_dirty();
    Ok(json!({"changed": changed}))
}

fn handle_label(ctx: &ServerCtx, args: &Value, add: bool) -> Result<Value> {
    let actor = actor_from(args);
    let parsed: protocol::LabelArgs = serde_json::from_value(args.clone())?;
    let changed = {
        let mut store = ctx.storage.lock();
        if add {
            store.add_label(&parsed.id, &parsed.label, &actor)?
        } else {
            store.remove_label(&parsed.id, &parsed.label, &actor)?
        }
    };
    ctx.flush.mark_dirty();
    Ok(json!({"changed": changed}))
}

fn handle_export(ctx: &ServerCtx) -> Result<Value> {
    let mut store = ctx.storage.lock();
    let result = export_to_jsonl(&mut store, &ctx.paths.jsonl_path, &ExportConfig::default())?;
    Ok(json!({"exported": result.exported, "hash": result.content_hash}))
}

fn handle_import(ctx: &ServerCtx) -> Result<Value> {
    let result = {
        let mut store = ctx.storage.lock();
        import_from_jsonl(
            &mut store,
            &ctx.paths.jsonl_path,
            &ImportOptions {
                resolve_collisions: true,
                skip_prefix_validation: true,
                actor: "daemon-client".to_string(),
                ..ImportOptions::default()
            },
        )?
    };
    // imports can remap and rewrite in bulk; the follow-up export must not
    // trip the data-loss guards
    ctx.flush.mark_dirty_full();
    Ok(json!({
        "created": result.created,
        "updated": result.updated,
        "unchanged": result.unchanged,
        "skipped": result.skipped,
        "collisions": result.collision_ids,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_ctx(temp: &TempDir) -> Arc<ServerCtx> {
        let beads_dir = temp.path().join(".beads");
        std::fs::create_dir_all(&beads_dir).unwrap();
        let paths = ConfigPaths::resolve(&beads_dir, None);
        let storage = Arc::new(Mutex::new(SqliteStorage::open_memory().unwrap()));
        let flush = Arc::new(FlushController::new(
            Arc::clone(&storage),
            paths.jsonl_path.clone(),
            Duration::from_millis(50),
        ));
        Arc::new(ServerCtx {
            storage,
            flush,
            paths,
            shutdown: CancellationToken::new(),
            phase: Arc::new(Mutex::new(DaemonPhase::Running)),
            started: Instant::now(),
        })
    }

    fn call(ctx: &Arc<ServerCtx>, method: &str, args: Value) -> Response {
        dispatch(&Request::new(method, args), ctx)
    }

    #[tokio::test]
    async fn health_and_status() {
        let temp = TempDir::new().unwrap();
        let ctx = test_ctx(&temp);

        let response = call(&ctx, methods::HEALTH, Value::Null);
        assert!(response.ok);

        let data = call(&ctx, methods::STATUS, Value::Null).into_result().unwrap();
        let status: StatusData = serde_json::from_value(data).unwrap();
        assert_eq!(status.protocol, PROTOCOL_VERSION);
        assert_eq!(status.issue_count, 0);
    }

    #[tokio::test]
    async fn unknown_method_is_unsupported() {
        let temp = TempDir::new().unwrap();
        let ctx = test_ctx(&temp);

        let response = call(&ctx, "frobnicate", Value::Null);
        assert!(!response.ok);
        assert_eq!(
            response.error.unwrap().kind,
            crate::error::ErrorKind::Unsupported
        );
    }

    #[tokio::test]
    async fn wrong_protocol_version_rejected() {
        let temp = TempDir::new().unwrap();
        let ctx = test_ctx(&temp);

        let mut request = Request::new(methods::HEALTH, Value::Null);
        request.protocol = PROTOCOL_VERSION + 1;
        let response = dispatch(&request, &ctx);
        assert!(!response.ok);
        assert_eq!(
            response.error.unwrap().kind,
            crate::error::ErrorKind::Unsupported
        );
    }

    #[tokio::test]
    async fn create_get_update_close_over_dispatch() {
        let temp = TempDir::new().unwrap();
        let ctx = test_ctx(&temp);

        let issue = Issue::new("bd-1", "via rpc");
        let created = call(
            &ctx,
            methods::CREATE,
            json!({"issue": issue, "actor": "tester"}),
        )
        .into_result()
        .unwrap();
        assert_eq!(created["id"], "bd-1");

        let updated = call(
            &ctx,
            methods::UPDATE,
            json!({"id": "bd-1", "fields": {"status": "in_progress"}}),
        )
        .into_result()
        .unwrap();
        assert_eq!(updated["status"], "in_progress");

        let closed = call(
            &ctx,
            methods::CLOSE,
            json!({"id": "bd-1", "reason": "done"}),
        )
        .into_result()
        .unwrap();
        assert_eq!(closed["status"], "closed");
        assert!(closed.get("closed_at").is_some());

        // closing again surfaces the AlreadyClosed kind over the wire
        let again = call(&ctx, methods::CLOSE, json!({"id": "bd-1"}));
        assert!(!again.ok);
        assert_eq!(
            again.error.unwrap().kind,
            crate::error::ErrorKind::AlreadyClosed
        );
    }

    #[tokio::test]
    async fn create_mints_id_when_missing() {
        let temp = TempDir::new().unwrap();
        let ctx = test_ctx(&temp);
        ctx.storage
            .lock()
            .set_config(crate::config::KEY_ISSUE_PREFIX, "proj")
            .unwrap();

        let mut issue = Issue::new("x-x", "auto id");
        issue.id = String::new();
        let created = call(&ctx, methods::CREATE, json!({"issue": issue}))
            .into_result()
            .unwrap();
        assert_eq!(created["id"], "proj-1");
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let temp = TempDir::new().unwrap();
        let ctx = test_ctx(&temp);
        {
            let mut store = ctx.storage.lock();
            store.create_issue(&Issue::new("bd-1", "one"), "t").unwrap();
            store.create_issue(&Issue::new("bd-2", "two"), "t").unwrap();
            store.close_issue("bd-2", None, "t").unwrap();
        }

        let open = call(&ctx, methods::LIST, json!({"status": "open"}))
            .into_result()
            .unwrap();
        assert_eq!(open.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_cancels_token_after_grace() {
        let temp = TempDir::new().unwrap();
        let ctx = test_ctx(&temp);
        assert!(!ctx.shutdown.is_cancelled());
        let response = call(&ctx, methods::SHUTDOWN, Value::Null);
        assert!(response.ok);
        // cancellation is deferred so the response frame can flush first
        tokio::time::timeout(Duration::from_secs(2), ctx.shutdown.cancelled())
            .await
            .expect("shutdown token never cancelled");
    }

    #[tokio::test]
    async fn serve_handles_a_real_socket_roundtrip() {
        let temp = TempDir::new().unwrap();
        let ctx = test_ctx(&temp);
        let socket_path = ctx.paths.socket_path();
        let listener = UnixListener::bind(&socket_path).unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(listener, Arc::clone(&ctx), cancel.clone()));

        let mut stream = tokio::net::UnixStream::connect(&socket_path).await.unwrap();
        let request = serde_json::to_vec(&Request::new(methods::HEALTH, Value::Null)).unwrap();
        write_frame_async(&mut stream, &request).await.unwrap();
        let payload = read_frame_async(&mut stream).await.unwrap();
        let response: Response = serde_json::from_slice(&payload).unwrap();
        assert!(response.ok);

        cancel.cancel();
        let _ = server.await;
    }
}
