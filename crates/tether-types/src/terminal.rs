//! Terminal session protocol between client and server.
//!
//! Raw bytes (keystrokes and process output) travel as binary frames; the
//! control messages below travel as JSON text frames tagged by `type`.

use serde::{Deserialize, Serialize};

/// How a connection should bind to a server-side process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Discard any prior session and start a fresh process.
    New,
    /// Reattach to a saved session id; no new process.
    Attach,
    /// Relaunch the higher-level workflow in a fresh process.
    Resume,
}

impl SessionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionMode::New => "new",
            SessionMode::Attach => "attach",
            SessionMode::Resume => "resume",
        }
    }
}

impl std::str::FromStr for SessionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "new" => Ok(SessionMode::New),
            "attach" => Ok(SessionMode::Attach),
            "resume" => Ok(SessionMode::Resume),
            _ => Err(format!("Invalid session mode: '{}'. Use 'new', 'attach' or 'resume'.", s)),
        }
    }
}

/// Connection lifecycle of a terminal session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// Composed input awaiting an acknowledgement.
///
/// Persisted durably before the send attempt so it survives a reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingInput {
    /// Correlation id echoed back in the ack
    pub id: String,
    /// Bytes written to the process (text plus line terminator)
    pub payload: String,
    /// Composer text as the user typed it
    pub original_text: String,
    /// First send attempt (ms since Unix epoch)
    pub sent_at: u64,
    /// Last manual retry (ms since Unix epoch)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retry_at: Option<u64>,
}

/// Control messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalClientMessage {
    /// Terminal geometry changed.
    Resize { cols: u16, rows: u16 },
    /// Ack-tracked composed input.
    Input { id: String, data: String },
}

/// Control messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalServerMessage {
    /// Session established; carries the server-assigned id.
    Hello { session_id: String },
    /// Acknowledgement of an `Input` message.
    Ack {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// The process exited.
    Exit {
        #[serde(default)]
        code: Option<i32>,
    },
    /// Server-side failure.
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl TerminalServerMessage {
    /// Whether this message reports that the requested session does not exist.
    pub fn is_session_not_found(&self) -> bool {
        match self {
            TerminalServerMessage::Error { message, code } => {
                code.as_deref() == Some("session_not_found")
                    || message.to_lowercase().contains("session not found")
            }
            _ => false,
        }
    }
}

/// Anything the client writes to the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Raw keystrokes, never acknowledged.
    Keys(Vec<u8>),
    Control(TerminalClientMessage),
}

/// Anything the server writes to the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    /// Raw process output.
    Output(Vec<u8>),
    Control(TerminalServerMessage),
}

impl ServerFrame {
    /// Decode a text frame: known control messages are parsed, anything else is
    /// treated as output.
    pub fn from_text(text: &str) -> Self {
        match serde_json::from_str::<TerminalServerMessage>(text) {
            Ok(msg) => ServerFrame::Control(msg),
            Err(_) => ServerFrame::Output(text.as_bytes().to_vec()),
        }
    }
}
