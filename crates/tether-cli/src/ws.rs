//! Terminal transport over a WebSocket.
//!
//! Binary frames carry raw bytes both ways. Text frames carry JSON control
//! messages; an unrecognised text frame is treated as output.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::{StatusCode, Url};
use tether_core::{ConnectRequest, Result, TerminalLink, TerminalTransport, TetherError};
use tether_types::{ClientFrame, ServerFrame};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, trace, warn};

const OUTBOUND_BUFFER: usize = 64;

pub struct WsTerminalTransport {
    url: Url,
}

impl WsTerminalTransport {
    pub fn new(url: &str) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| TetherError::Protocol(format!("invalid terminal url '{}': {}", url, e)))?;
        Ok(Self { url })
    }

    pub fn connect_url(&self, request: &ConnectRequest) -> Url {
        let mut url = self.url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("mode", request.mode.as_str());
            if let Some(session_id) = &request.session_id {
                query.append_pair("session_id", session_id);
            }
            query.append_pair("cols", &request.cols.to_string());
            query.append_pair("rows", &request.rows.to_string());
        }
        url
    }
}

fn encode(frame: ClientFrame) -> Result<Message> {
    Ok(match frame {
        ClientFrame::Keys(bytes) => Message::Binary(bytes.into()),
        ClientFrame::Control(message) => Message::Text(serde_json::to_string(&message)?.into()),
    })
}

#[async_trait]
impl TerminalTransport for WsTerminalTransport {
    async fn connect(&self, request: &ConnectRequest) -> Result<TerminalLink> {
        let url = self.connect_url(request);
        debug!(target: "tether::ws", "Connecting to {}", url);

        let (socket, _) = match connect_async(url.as_str()).await {
            Ok(connected) => connected,
            Err(WsError::Http(response)) if response.status().as_u16() == StatusCode::NOT_FOUND.as_u16() => {
                return Err(TetherError::SessionNotFound(request.session_id.clone().unwrap_or_default()));
            }
            Err(e) => return Err(TetherError::Transport(e.to_string())),
        };
        info!(target: "tether::ws", "WebSocket open ({})", request.mode.as_str());

        let (mut sink, stream) = socket.split();
        let (outbound, mut from_session) = mpsc::channel::<ClientFrame>(OUTBOUND_BUFFER);

        // Ends when the session drops the link's sender or the socket fails.
        tokio::spawn(async move {
            while let Some(frame) = from_session.recv().await {
                let message = match encode(frame) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(target: "tether::ws", "Dropping unencodable frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(message).await {
                    debug!(target: "tether::ws", "Write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let inbound = stream
            .filter_map(|message| async move {
                match message {
                    Ok(Message::Binary(bytes)) => Some(Ok(ServerFrame::Output(bytes.to_vec()))),
                    Ok(Message::Text(text)) => {
                        trace!(target: "tether::ws", "Text frame: {}", text.as_str());
                        Some(Ok(ServerFrame::from_text(text.as_str())))
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(target: "tether::ws", "Server closed: {:?}", frame);
                        None
                    }
                    Ok(_) => None,
                    Err(e) => Some(Err(TetherError::Transport(e.to_string()))),
                }
            })
            .boxed();

        Ok(TerminalLink { outbound, inbound })
    }
}
