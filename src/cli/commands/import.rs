//! `bd import` — fold a JSONL file into the database.

use crate::cli::backend::Backend;
use crate::cli::ImportArgs;
use crate::config::{CliOverrides, Session};
use crate::error::{BeadsError, Result};
use crate::sync::ImportOptions;

pub fn execute(args: &ImportArgs, json: bool, overrides: &CliOverrides) -> Result<()> {
    let session = Session::discover(overrides.clone())?;
    let mut backend = Backend::direct(session)?;

    let options = ImportOptions {
        resolve_collisions: args.resolve_collisions,
        rename_on_import: args.rename_on_import,
        skip_update: args.skip_update,
        strict_deps: args.strict,
        actor: backend.session().actor(),
        ..ImportOptions::default()
    };
    let result = backend.import(args.input.as_deref(), &options)?;

    if result.prefix_mismatch {
        let expected = result.expected_prefix.clone().unwrap_or_default();
        backend.finish()?;
        return Err(BeadsError::PrefixMismatch {
            expected,
            found: result.mismatch_prefixes,
        });
    }

    if json {
        println!(
            "{}",
            serde_json::json!({
                "created": result.created,
                "updated": result.updated,
                "unchanged": result.unchanged,
                "skipped": result.skipped,
                "collisions": result.collision_ids,
                "id_mapping": result.id_mapping,
                "warnings": result.warnings,
            })
        );
    } else {
        println!(
            "Imported: {} created, {} updated, {} unchanged, {} skipped",
            result.created, result.updated, result.unchanged, result.skipped
        );
        if !result.collision_ids.is_empty() {
            println!("Resolved {} collision(s):", result.collision_ids.len());
            let mut mappings: Vec<_> = result.id_mapping.iter().collect();
            mappings.sort();
            for (old, new) in mappings {
                println!("  {old} -> {new}");
            }
        }
        for warning in &result.warnings {
            eprintln!("Warning: {warning}");
        }
    }
    backend.finish()
}
