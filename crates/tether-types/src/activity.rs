//! Activity log entries shown alongside a turn's response.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category of an activity entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Incremental reasoning text
    Reasoning,
    /// Shell command execution
    Command,
    /// File created, modified or deleted
    FileChange,
    /// Tool invocation
    ToolCall,
    /// Status line change
    Status,
    /// Error reported by the agent or transport
    Error,
    /// Anything the client does not recognise
    Other,
}

/// One entry in a turn's bounded activity log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLogEntry {
    /// Monotonic id assigned by the log
    pub id: u64,
    pub title: String,
    pub summary: String,
    pub detail: String,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    /// Correlates repeated deltas for the same backend item
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
}
