//! Optimistic-concurrency check for drafts.
//!
//! A draft records the fingerprint of the document it was computed against.
//! If the live document has changed since, the draft is stale and may only be
//! applied with an explicit force.

use crate::{Result, TetherError};
use sha2::{Digest, Sha256};
use tether_types::Draft;

/// Lowercase hex SHA-256 of the document's UTF-8 bytes.
pub fn fingerprint(document: &str) -> String {
    format!("{:x}", Sha256::digest(document.as_bytes()))
}

/// A draft without a base hash is never stale.
pub fn is_stale(draft: &Draft, current_hash: &str) -> bool {
    draft
        .base_hash
        .as_deref()
        .is_some_and(|base| !base.eq_ignore_ascii_case(current_hash))
}

/// Refresh `current_hash` and `is_stale` against the live document.
pub fn refresh(draft: &mut Draft, document: &str) {
    let current = fingerprint(document);
    draft.is_stale = is_stale(draft, &current);
    draft.current_hash = Some(current);
}

/// Gate an apply: stale drafts require `force`.
pub fn check_apply(draft: &Draft, document: &str, force: bool) -> Result<()> {
    let current = fingerprint(document);
    if force || !is_stale(draft, &current) {
        return Ok(());
    }
    Err(TetherError::StaleDraft {
        base_hash: draft.base_hash.clone().unwrap_or_default(),
        current_hash: current,
    })
}
