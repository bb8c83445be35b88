//! Typed access to durable client records.
//!
//! Records are JSON-serialized into a [`DurableStore`]. A record that fails to
//! parse is treated as absent and logged; it never propagates as an error.

use crate::store::DurableStore;
use crate::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tether_types::{PendingInput, PendingTurn};
use tracing::{debug, warn};

pub const PENDING_TURN_PREFIX: &str = "pending-turn:";
pub const PENDING_INPUT_KEY: &str = "pending-terminal-input";
pub const SESSION_ID_KEY: &str = "terminal-session-id";
pub const COMPOSER_DRAFT_KEY: &str = "composer-draft";

pub fn pending_turn_key(target: &str) -> String {
    format!("{}{}", PENDING_TURN_PREFIX, target)
}

/// Read a record, treating unreadable or corrupt values as absent.
pub fn load<T: DeserializeOwned>(store: &dyn DurableStore, key: &str) -> Option<T> {
    let raw = match store.get(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            warn!(target: "tether::store", "Failed to read {}: {}", key, e);
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(target: "tether::store", "Ignoring corrupt record {}: {}", key, e);
            None
        }
    }
}

pub fn save<T: Serialize>(store: &dyn DurableStore, key: &str, value: &T) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    store.put(key, &raw)?;
    debug!(target: "tether::store", "Saved {}", key);
    Ok(())
}

pub fn clear(store: &dyn DurableStore, key: &str) -> Result<()> {
    store.remove(key)?;
    debug!(target: "tether::store", "Cleared {}", key);
    Ok(())
}

// ============================================================================
// Pending turns
// ============================================================================

pub fn load_pending_turn(store: &dyn DurableStore, target: &str) -> Option<PendingTurn> {
    load(store, &pending_turn_key(target))
}

pub fn save_pending_turn(store: &dyn DurableStore, pending: &PendingTurn) -> Result<()> {
    save(store, &pending_turn_key(&pending.target), pending)
}

/// Remove the pending turn for `target` only if it still belongs to `turn_id`.
///
/// Returns whether a record was removed. A newer submit's record is left
/// alone, including one saved between the read and the delete.
pub fn clear_pending_turn_if(store: &dyn DurableStore, target: &str, turn_id: &str) -> Result<bool> {
    let key = pending_turn_key(target);
    let Some(raw) = store.get(&key)? else {
        return Ok(false);
    };
    let owned = serde_json::from_str::<PendingTurn>(&raw).is_ok_and(|pending| pending.turn_id == turn_id);
    if owned && store.remove_if(&key, &raw)? {
        debug!(target: "tether::store", "Cleared {}", key);
        return Ok(true);
    }
    debug!(target: "tether::store", "Pending turn for {} superseded; not clearing", target);
    Ok(false)
}

/// Targets that currently have a pending turn.
pub fn pending_turn_targets(store: &dyn DurableStore) -> Result<Vec<String>> {
    Ok(store
        .keys_with_prefix(PENDING_TURN_PREFIX)?
        .into_iter()
        .filter_map(|key| key.strip_prefix(PENDING_TURN_PREFIX).map(str::to_string))
        .collect())
}

// ============================================================================
// Terminal records
// ============================================================================

pub fn load_pending_input(store: &dyn DurableStore) -> Option<PendingInput> {
    load(store, PENDING_INPUT_KEY)
}

pub fn load_session_id(store: &dyn DurableStore) -> Option<String> {
    load::<String>(store, SESSION_ID_KEY).filter(|id| !id.is_empty())
}

pub fn load_composer(store: &dyn DurableStore) -> String {
    load(store, COMPOSER_DRAFT_KEY).unwrap_or_default()
}
