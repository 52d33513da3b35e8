//! `bd create` — create an issue.

use std::str::FromStr;

use crate::cli::backend::Backend;
use crate::cli::CreateArgs;
use crate::config::{CliOverrides, Session};
use crate::error::Result;
use crate::model::{Issue, IssueType, Priority};

pub fn execute(args: CreateArgs, json: bool, overrides: &CliOverrides) -> Result<()> {
    let session = Session::discover(overrides.clone())?;
    let mut backend = Backend::establish(session)?;

    let mut issue = Issue::new(args.id.unwrap_or_default(), args.title);
    issue.description = args.description;
    issue.priority = Priority::from_str(&args.priority)?;
    issue.issue_type = IssueType::from_str(&args.issue_type)?;
    issue.assignee = args.assignee;
    issue.labels = args.labels;

    let created = backend.create_issue(issue)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&created)?);
    } else {
        println!(
            "Created {} [{}] {}",
            created.id, created.priority, created.title
        );
    }
    backend.finish()
}
