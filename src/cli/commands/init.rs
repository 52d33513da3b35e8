//! `bd init` — create the `.beads` workspace.

use crate::config::{self, CliOverrides, Session, KEY_ISSUE_PREFIX};
use crate::error::Result;

pub fn execute(prefix: Option<String>, overrides: &CliOverrides) -> Result<()> {
    let cwd = std::env::current_dir()?;
    let beads_dir = config::init_workspace(&cwd)?;

    let session = Session::at(&beads_dir, overrides.clone());
    let mut storage = session.open_storage()?;
    storage.set_metadata(config::META_BD_VERSION, env!("CARGO_PKG_VERSION"))?;

    // default the prefix to the directory name, lowercased
    let prefix = prefix.unwrap_or_else(|| {
        cwd.file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .filter(|n| !n.is_empty() && !n.contains('-'))
            .unwrap_or_else(|| "bd".to_string())
    });
    storage.set_config(KEY_ISSUE_PREFIX, &prefix)?;

    println!("Initialized beads workspace at {}", beads_dir.display());
    println!("Issue prefix: {prefix} (first issue will be {prefix}-1)");
    Ok(())
}
