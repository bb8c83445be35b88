//! Draft types: proposed document changes produced by a turn.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A proposed patch awaiting explicit apply or discard.
///
/// `base_hash` is the fingerprint of the document the agent worked against.
/// `current_hash` and `is_stale` are refreshed against the live document each
/// time the draft is read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Draft {
    /// Full proposed document content (when the agent sends it)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Unified diff against the base document
    #[serde(default)]
    pub patch: String,
    /// Per-path proposed contents for multi-file drafts
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub drafts: BTreeMap<String, String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Fingerprint of the document snapshot the draft was computed against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_hash: Option<String>,
    /// Fingerprint of the live document at last read
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_hash: Option<String>,
    /// Assistant text that accompanied the draft
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_message: Option<String>,
    #[serde(default)]
    pub is_stale: bool,
}

impl Draft {
    pub fn new(patch: impl Into<String>) -> Self {
        Self {
            content: None,
            patch: patch.into(),
            drafts: BTreeMap::new(),
            created_at: Utc::now(),
            base_hash: None,
            current_hash: None,
            agent_message: None,
            is_stale: false,
        }
    }

    /// Whether the draft carries anything worth applying.
    pub fn has_changes(&self) -> bool {
        !self.patch.is_empty() || !self.drafts.is_empty()
    }

    /// Number of lines added and removed by the patch.
    pub fn line_stats(&self) -> (usize, usize) {
        let mut added = 0;
        let mut removed = 0;
        for line in self.patch.lines() {
            if line.starts_with("+++") || line.starts_with("---") {
                continue;
            }
            if line.starts_with('+') {
                added += 1;
            } else if line.starts_with('-') {
                removed += 1;
            }
        }
        (added, removed)
    }
}

/// Body of an apply-draft request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ApplyDraftRequest {
    pub force: bool,
}
