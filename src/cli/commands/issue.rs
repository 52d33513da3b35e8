//! `bd update`, `bd close`, `bd show` — single-issue operations.

use serde_json::{json, Map, Value};

use crate::cli::backend::Backend;
use crate::cli::{CloseArgs, UpdateArgs};
use crate::config::{CliOverrides, Session};
use crate::error::{ErrorKind, Result};

/// Build the sparse field map: absent flags stay absent, empty-string
/// values on clearable fields become explicit nulls (tombstones).
fn fields_from_args(args: &UpdateArgs) -> Value {
    let mut fields = Map::new();
    let mut set = |key: &str, value: Option<&String>, clearable: bool| {
        if let Some(value) = value {
            if clearable && value.is_empty() {
                fields.insert(key.to_string(), Value::Null);
            } else {
                fields.insert(key.to_string(), Value::String(value.clone()));
            }
        }
    };
    set("title", args.title.as_ref(), false);
    set("description", args.description.as_ref(), true);
    set("design", args.design.as_ref(), true);
    set("notes", args.notes.as_ref(), true);
    set("status", args.status.as_ref(), false);
    set("issue_type", args.issue_type.as_ref(), false);
    set("assignee", args.assignee.as_ref(), true);
    if let Some(ref priority) = args.priority {
        if let Ok(p) = priority.trim_start_matches(['p', 'P']).parse::<i64>() {
            fields.insert("priority".to_string(), json!(p));
        } else {
            fields.insert("priority".to_string(), json!(priority));
        }
    }
    Value::Object(fields)
}

pub fn update(args: &UpdateArgs, json: bool, overrides: &CliOverrides) -> Result<()> {
    let session = Session::discover(overrides.clone())?;
    let mut backend = Backend::establish(session)?;

    let fields = fields_from_args(args);
    let updated = backend.update_issue(&args.id, fields)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&updated)?);
    } else {
        println!("Updated {}", updated.id);
    }
    backend.finish()
}

pub fn close(args: &CloseArgs, json: bool, overrides: &CliOverrides) -> Result<()> {
    let session = Session::discover(overrides.clone())?;
    let mut backend = Backend::establish(session)?;

    let mut closed = Vec::new();
    for id in &args.ids {
        match backend.close_issue(id, args.reason.as_deref()) {
            Ok(issue) => closed.push(issue),
            // retry-safe: already closed is a note, not a failure
            Err(e) if e.kind() == ErrorKind::AlreadyClosed => {
                eprintln!("{id}: already closed");
            }
            Err(e) => return Err(e),
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&closed)?);
    } else {
        for issue in &closed {
            println!("Closed {}: {}", issue.id, issue.title);
        }
    }
    backend.finish()
}

pub fn show(id: &str, events: bool, json: bool, overrides: &CliOverrides) -> Result<()> {
    let session = Session::discover(overrides.clone())?;
    let mut backend = Backend::establish(session.clone())?;

    let issue = backend.get_issue(id)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&issue)?);
    } else {
        println!("{} [{}] [{}] {}", issue.id, issue.priority, issue.issue_type, issue.title);
        println!("  status:   {}", issue.status);
        if let Some(ref assignee) = issue.assignee {
            println!("  assignee: {assignee}");
        }
        if !issue.labels.is_empty() {
            println!("  labels:   {}", issue.labels.join(", "));
        }
        if let Some(ref description) = issue.description {
            println!("  description:\n    {}", description.replace('\n', "\n    "));
        }
        if let Some(ref notes) = issue.notes {
            println!("  notes:\n    {}", notes.replace('\n', "\n    "));
        }
        for dep in &issue.dependencies {
            println!("  dep: {} {} {}", dep.issue_id, dep.dep_type, dep.depends_on_id);
        }
        println!("  created:  {}", issue.created_at.to_rfc3339());
        println!("  updated:  {}", issue.updated_at.to_rfc3339());
        if let Some(closed_at) = issue.closed_at {
            println!("  closed:   {}", closed_at.to_rfc3339());
        }
    }

    if events {
        // event history comes straight from storage; it is not part of the
        // RPC surface
        let storage = session.open_storage()?;
        for event in storage.get_events(id)? {
            println!(
                "  [{}] {} by {}{}",
                event.created_at.to_rfc3339(),
                event.event_type,
                event.actor,
                event
                    .comment
                    .as_deref()
                    .map(|c| format!(": {c}"))
                    .unwrap_or_default()
            );
        }
    }
    backend.finish()
}
