//! `bd label` — label set operations.

use crate::cli::backend::Backend;
use crate::cli::LabelCommands;
use crate::config::{CliOverrides, Session};
use crate::error::Result;

pub fn execute(command: &LabelCommands, overrides: &CliOverrides) -> Result<()> {
    let session = Session::discover(overrides.clone())?;
    let mut backend = Backend::establish(session)?;

    match command {
        LabelCommands::Add { id, label } => {
            if backend.add_label(id, label)? {
                println!("Added '{label}' to {id}");
            } else {
                println!("{id} already has '{label}'");
            }
        }
        LabelCommands::Remove { id, label } => {
            if backend.remove_label(id, label)? {
                println!("Removed '{label}' from {id}");
            } else {
                println!("{id} does not have '{label}'");
            }
        }
    }
    backend.finish()
}
