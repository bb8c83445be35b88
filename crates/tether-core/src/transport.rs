//! Contract for the terminal's duplex connection.

use crate::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use tether_types::{ClientFrame, ServerFrame, SessionMode};
use tokio::sync::mpsc;

/// Parameters of one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub mode: SessionMode,
    /// Saved session to reattach to (`attach`) or relaunch from (`resume`)
    pub session_id: Option<String>,
    pub cols: u16,
    pub rows: u16,
}

/// An open connection: an outbound frame sender and an inbound frame stream.
///
/// Dropping the link closes the connection. The inbound stream ends when the
/// server closes; an `Err` item means the connection was lost.
pub struct TerminalLink {
    pub outbound: mpsc::Sender<ClientFrame>,
    pub inbound: BoxStream<'static, Result<ServerFrame>>,
}

#[async_trait]
pub trait TerminalTransport: Send + Sync + 'static {
    /// Open a connection. A refusal because the session does not exist must
    /// be reported as [`crate::TetherError::SessionNotFound`].
    async fn connect(&self, request: &ConnectRequest) -> Result<TerminalLink>;
}
