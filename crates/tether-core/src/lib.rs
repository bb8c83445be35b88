//! Client core for Tether: resumable streaming turns and a reliable terminal
//! session, plus the durable records both rely on.

mod backend;
mod error;
mod event_log;
mod events;
mod reconnect;
pub mod records;
mod recovery;
mod session;
mod staleness;
mod store;
mod stream;
mod terminal;
mod terminal_input;
mod transport;
mod turn;
mod update;

pub use backend::TurnBackend;
pub use error::TetherError;
pub use event_log::{EventLog, DEFAULT_EVENT_LOG_CAPACITY};
pub use events::{ActivityEvent, TurnEvent};
pub use reconnect::ReconnectPolicy;
pub use recovery::{RecoveryConfig, RecoveryOutcome};
pub use session::{SessionEvent, TurnSession, TurnSessionConfig};
pub use staleness::{check_apply, fingerprint, is_stale, refresh};
pub use store::{DurableStore, MemoryStore, SqliteStore};
pub use stream::{
    byte_stream_from_chunks, detect_newline_mode, read_frames, ByteStream, Frame, FrameDecoder,
    FrameStream, NewlineMode, DEFAULT_EVENT,
};
pub use terminal::{
    TerminalConfig, TerminalEvent, TerminalHandle, TerminalSession, TerminalSnapshot, DEFAULT_CONNECT_TIMEOUT,
};
pub use terminal_input::{AckOutcome, InputTracker, DEFAULT_RETRY_MIN_INTERVAL};
pub use transport::{ConnectRequest, TerminalLink, TerminalTransport};
pub use turn::{Transition, TurnState};
pub use update::{parse_update, DraftDirective, ParseStrategy, ParsedUpdate, UpdatePayload};

/// Result type for Tether operations.
pub type Result<T> = std::result::Result<T, TetherError>;
