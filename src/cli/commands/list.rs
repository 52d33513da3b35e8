//! `bd list` — list and search issues.

use crate::cli::backend::Backend;
use crate::cli::ListArgs;
use crate::config::{CliOverrides, Session};
use crate::error::Result;

pub fn execute(args: &ListArgs, json: bool, overrides: &CliOverrides) -> Result<()> {
    let session = Session::discover(overrides.clone())?;
    let mut backend = Backend::establish(session)?;

    let issues = backend.list_issues(
        args.query.as_deref(),
        args.status.as_deref(),
        args.assignee.as_deref(),
        &args.labels,
        args.limit,
    )?;

    if json {
        println!("{}", serde_json::to_string_pretty(&issues)?);
    } else if issues.is_empty() {
        println!("No issues found.");
    } else {
        for issue in &issues {
            let labels = if issue.labels.is_empty() {
                String::new()
            } else {
                format!(" [{}]", issue.labels.join(","))
            };
            println!(
                "{:<12} {} [{}] {}{}  ({})",
                issue.id, issue.priority, issue.issue_type, issue.title, labels, issue.status
            );
        }
        println!("{} issue(s)", issues.len());
    }
    backend.finish()
}
