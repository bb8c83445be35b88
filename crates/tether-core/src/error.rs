//! Error types for Tether.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TetherError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Backend returned {status}: {message}")]
    Backend { status: u16, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Draft is stale: base {base_hash}, current {current_hash}")]
    StaleDraft {
        base_hash: String,
        current_hash: String,
    },

    #[error("No draft for target: {0}")]
    NoDraft(String),

    #[error("Terminal is not connected")]
    NotConnected,

    #[error("No pending input to retry")]
    NoPendingInput,

    #[error("Retry too soon: wait {0}ms")]
    RetryTooSoon(u64),

    #[error("Operation aborted")]
    Aborted,

    #[error("Store error: {0}")]
    Store(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Channel closed")]
    ChannelClosed,
}

impl TetherError {
    /// Whether the failure came from the network rather than the protocol.
    pub fn is_transport(&self) -> bool {
        matches!(self, TetherError::Transport(_) | TetherError::Io(_))
    }
}
