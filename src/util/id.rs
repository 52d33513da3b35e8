//! Issue ID parsing and minting.
//!
//! IDs have the shape `<prefix>-<suffix>` with exactly one `-` separating
//! the two. The suffix is either a monotonic decimal minted from the
//! per-prefix counter in the metadata table, or a short content-hash slug
//! minted for issues that lost a collision and had to give up their
//! original ID.

use crate::error::{BeadsError, Result};

/// Minimum hex digits for a hash-minted suffix.
const HASH_SUFFIX_LEN: usize = 6;

/// A parsed `<prefix>-<suffix>` identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedId {
    pub prefix: String,
    pub suffix: String,
}

impl ParsedId {
    #[must_use]
    pub fn to_id_string(&self) -> String {
        format!("{}-{}", self.prefix, self.suffix)
    }
}

/// Parse an issue ID into prefix and suffix.
///
/// # Errors
///
/// Returns `InvalidId` when the ID does not contain exactly one `-`, or
/// when either side is empty.
pub fn parse_id(id: &str) -> Result<ParsedId> {
    let Some((prefix, suffix)) = id.split_once('-') else {
        return Err(BeadsError::InvalidId { id: id.to_string() });
    };
    if prefix.is_empty() || suffix.is_empty() || suffix.contains('-') {
        return Err(BeadsError::InvalidId { id: id.to_string() });
    }
    Ok(ParsedId {
        prefix: prefix.to_string(),
        suffix: suffix.to_string(),
    })
}

/// The numeric value of a decimal suffix, if the ID has one.
///
/// Hash-minted suffixes return `None`; counter sync skips them.
#[must_use]
pub fn numeric_suffix(id: &str) -> Option<u64> {
    let (_, suffix) = id.split_once('-')?;
    suffix.parse::<u64>().ok()
}

/// Mint the next counter-based ID: `<prefix>-<n>`.
#[must_use]
pub fn mint_numeric_id(prefix: &str, counter: u64) -> String {
    format!("{prefix}-{counter}")
}

/// Mint a hash-suffixed ID for a collision loser.
///
/// Takes the leading hex digits of the record's content hash, extending
/// the slug until `is_taken` stops objecting. Falls back to appending a
/// numeric disambiguator once the whole hash is consumed.
pub fn mint_hash_id<F>(prefix: &str, content_hash: &str, mut is_taken: F) -> String
where
    F: FnMut(&str) -> bool,
{
    for len in HASH_SUFFIX_LEN..=content_hash.len() {
        let candidate = format!("{prefix}-{}", &content_hash[..len]);
        if !is_taken(&candidate) {
            return candidate;
        }
    }

    let mut n = 2u64;
    loop {
        let candidate = format!("{prefix}-{content_hash}{n}");
        if !is_taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}
