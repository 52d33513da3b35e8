//! `bd validate` — health scans.

use crate::config::{CliOverrides, Session};
use crate::error::{BeadsError, Result};
use crate::validation;

pub fn execute(fix: bool, json: bool, overrides: &CliOverrides) -> Result<()> {
    let session = Session::discover(overrides.clone())?;
    let mut storage = session.open_storage()?;

    let reports = validation::run_all(&mut storage, &session.paths.jsonl_path, fix)?;
    let unfixed: usize = reports.iter().map(|(_, r)| r.unfixed()).sum();

    if json {
        let value: serde_json::Map<String, serde_json::Value> = reports
            .iter()
            .map(|(name, report)| {
                (
                    (*name).to_string(),
                    serde_json::to_value(report).unwrap_or_default(),
                )
            })
            .collect();
        println!("{}", serde_json::Value::Object(value));
    } else {
        for (name, report) in &reports {
            if report.is_clean() {
                println!("{name}: ok");
                continue;
            }
            println!(
                "{name}: {} finding(s), {} fixed",
                report.issue_count, report.fixed_count
            );
            for suggestion in &report.suggestions {
                println!("  - {suggestion}");
            }
        }
    }

    if unfixed > 0 {
        return Err(BeadsError::validation(
            "workspace",
            format!("{unfixed} unfixed finding(s)"),
        ));
    }
    Ok(())
}
