//! Shared utilities for beads.
//!
//! Common functionality used across modules:
//! - Content hashing (SHA256 over canonical JSON)
//! - ID parsing and minting (`<prefix>-<suffix>`)
//! - Environment flag parsing
//! - Progress indicators for long-running operations

pub mod hash;
pub mod id;

pub use hash::{content_hash, semantically_equal};
pub use id::{mint_hash_id, mint_numeric_id, numeric_suffix, parse_id, ParsedId};

use indicatif::{ProgressBar, ProgressStyle};
use std::io::IsTerminal;

/// Whether a string reads as truthy: `1`, `true`, `yes`, `on` (any case).
#[must_use]
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Whether a string reads as falsy: `0`, `false`, `no`, `off` (any case).
#[must_use]
pub fn is_falsy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}

/// Parse a truthy environment variable. Unset is not truthy.
#[must_use]
pub fn env_truthy(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| is_truthy(&v))
}

/// Parse a falsy environment variable. Unset or unrecognized is not falsy.
#[must_use]
pub fn env_falsy(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| is_falsy(&v))
}

/// Create a progress bar, hidden when stderr is not a terminal or when
/// progress is disabled.
#[must_use]
pub fn create_progress_bar(len: u64, message: &'static str, show: bool) -> ProgressBar {
    if !show || !std::io::stderr().is_terminal() {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(len);
    bar.set_style(
        ProgressStyle::with_template("{msg} [{bar:30}] {pos}/{len}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar.set_message(message);
    bar
}
