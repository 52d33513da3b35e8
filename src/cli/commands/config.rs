//! `bd config` — the user-visible config table.

use crate::cli::ConfigCommands;
use crate::config::{CliOverrides, Session};
use crate::error::Result;

pub fn execute(command: &ConfigCommands, json: bool, overrides: &CliOverrides) -> Result<()> {
    let session = Session::discover(overrides.clone())?;
    let mut storage = session.open_storage()?;

    match command {
        ConfigCommands::Get { key } => match storage.get_config(key)? {
            Some(value) => println!("{value}"),
            None => println!("(unset)"),
        },
        ConfigCommands::Set { key, value } => {
            storage.set_config(key, value)?;
            println!("{key} = {value}");
        }
        ConfigCommands::List => {
            let all = storage.get_all_config()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&all)?);
            } else {
                let mut keys: Vec<_> = all.keys().collect();
                keys.sort();
                for key in keys {
                    println!("{key} = {}", all[key]);
                }
            }
        }
    }
    Ok(())
}
