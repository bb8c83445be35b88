//! Turn lifecycle types and the durable pending-turn record.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Phase of a turn as seen by the client state machine.
///
/// Transitions are monotonic: `Idle -> Queued -> Responding -> terminal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    /// Nothing submitted for this target yet.
    Idle,
    /// Submitted, waiting for the first token.
    Queued,
    /// Streaming a response (also used while recovering).
    Responding,
    /// Finished successfully.
    Done,
    /// Finished with a failure.
    Error,
    /// Stopped by the user; partial output kept.
    Interrupted,
}

impl TurnPhase {
    /// Whether no further transitions are allowed.
    pub fn is_terminal(self) -> bool {
        matches!(self, TurnPhase::Done | TurnPhase::Error | TurnPhase::Interrupted)
    }

    /// Position in the monotonic ordering. Terminal phases share the top rank.
    pub fn rank(self) -> u8 {
        match self {
            TurnPhase::Idle => 0,
            TurnPhase::Queued => 1,
            TurnPhase::Responding => 2,
            TurnPhase::Done | TurnPhase::Error | TurnPhase::Interrupted => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TurnPhase::Idle => "idle",
            TurnPhase::Queued => "queued",
            TurnPhase::Responding => "running",
            TurnPhase::Done => "done",
            TurnPhase::Error => "error",
            TurnPhase::Interrupted => "interrupted",
        }
    }
}

impl std::fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status reported by the backend for a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Queued,
    #[serde(alias = "in_progress", alias = "responding")]
    Running,
    #[serde(alias = "cancelled", alias = "canceled")]
    Interrupted,
    #[serde(alias = "failed")]
    Error,
    #[serde(alias = "completed", alias = "complete")]
    Done,
}

impl TurnStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TurnStatus::Done | TurnStatus::Error | TurnStatus::Interrupted)
    }
}

/// Durable record of a turn that has been submitted but whose terminal status
/// has not yet been observed.
///
/// At most one exists per target; a newer submit overwrites it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTurn {
    /// Client-generated correlation id for this attempt
    pub turn_id: String,
    /// The user message that was submitted
    pub message: String,
    /// Submission time (ms since Unix epoch)
    pub started_at_ms: u64,
    /// Logical target the turn belongs to (e.g. "doc:todo")
    pub target: String,
}

/// Coordinates of a live turn on the backend, enough to attach to its events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnCoordinates {
    pub thread_id: String,
    pub turn_id: String,
    pub agent: String,
}

/// Final outcome of a turn as reported by `queryActiveTurn`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnResult {
    pub status: TurnStatus,
    /// Human-readable message (assistant text for successful turns)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Failure or interruption detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Structured update payload, same shape as an `update` frame
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<Value>,
}

/// Response of `queryActiveTurn(turnId)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTurnStatus {
    /// Present while the turn is still running server-side
    #[serde(default)]
    pub current: Option<TurnCoordinates>,
    /// Present once the backend has a result for the turn
    #[serde(default)]
    pub last_result: Option<TurnResult>,
}

/// Extra submit options passed through to the backend untouched.
pub type SubmitOptions = BTreeMap<String, String>;

/// Body of a turn submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub target: String,
    pub message: String,
    pub turn_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: SubmitOptions,
}
