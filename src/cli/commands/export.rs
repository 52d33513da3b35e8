//! `bd export` — write the database out as JSONL.

use crate::cli::backend::Backend;
use crate::cli::ExportArgs;
use crate::config::{CliOverrides, Session};
use crate::error::Result;

pub fn execute(args: &ExportArgs, json: bool, overrides: &CliOverrides) -> Result<()> {
    let session = Session::discover(overrides.clone())?;
    let mut backend = Backend::direct(session)?;

    let (exported, hash) = backend.export(args.output.as_deref(), args.force)?;
    if json {
        println!(
            "{}",
            serde_json::json!({"exported": exported, "content_hash": hash})
        );
    } else {
        println!("Exported {exported} issue(s)");
    }
    backend.finish()
}
