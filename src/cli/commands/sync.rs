//! `bd sync` — one manual sync cycle: export, commit/pull when in a git
//! repository, re-import, push.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::config::{CliOverrides, Session};
use crate::daemon::lifecycle::sync_once;
use crate::error::Result;
use crate::sync::auto_import_if_empty;

pub fn execute(overrides: &CliOverrides) -> Result<()> {
    let session = Session::discover(overrides.clone())?;
    let mut storage = session.open_storage()?;
    if !session.overrides.no_auto_import {
        auto_import_if_empty(&mut storage, &session.paths, &session.actor())?;
    }
    let storage = Arc::new(Mutex::new(storage));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let summary = runtime.block_on(sync_once(storage, &session.paths))?;

    if summary.is_empty() {
        println!("Sync complete (nothing to do)");
    } else {
        println!("Sync complete: {summary}");
    }
    Ok(())
}
