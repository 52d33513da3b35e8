//! `bd dep` — dependency edges.

use std::str::FromStr;

use crate::cli::backend::Backend;
use crate::cli::DepCommands;
use crate::config::{CliOverrides, Session};
use crate::error::Result;
use crate::model::DependencyType;

pub fn execute(command: &DepCommands, overrides: &CliOverrides) -> Result<()> {
    let session = Session::discover(overrides.clone())?;
    let mut backend = Backend::establish(session)?;

    match command {
        DepCommands::Add {
            issue_id,
            depends_on_id,
            dep_type,
        } => {
            let dep_type = DependencyType::from_str(dep_type)?;
            backend.add_dependency(issue_id, depends_on_id, dep_type)?;
            println!("{issue_id} {dep_type} {depends_on_id}");
        }
        DepCommands::Remove {
            issue_id,
            depends_on_id,
            dep_type,
        } => {
            let dep_type = DependencyType::from_str(dep_type)?;
            if backend.remove_dependency(issue_id, depends_on_id, dep_type)? {
                println!("Removed {issue_id} {dep_type} {depends_on_id}");
            } else {
                println!("No such dependency");
            }
        }
    }
    backend.finish()
}
