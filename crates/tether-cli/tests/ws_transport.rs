//! WebSocket terminal transport against a local axum server.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::Query;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tether_cli::WsTerminalTransport;
use tether_core::records::load_session_id;
use tether_core::{
    ConnectRequest, MemoryStore, TerminalConfig, TerminalEvent, TerminalSession, TerminalTransport, TetherError,
};
use tether_types::{ClientFrame, ServerFrame, SessionMode, TerminalClientMessage, TerminalServerMessage};

const KNOWN_SESSION: &str = "abc";

async fn terminal(Query(params): Query<HashMap<String, String>>, ws: WebSocketUpgrade) -> Response {
    let mode = params.get("mode").map(String::as_str).unwrap_or("new");
    let session_id = params.get("session_id").cloned();
    if mode == "attach" && session_id.as_deref() != Some(KNOWN_SESSION) {
        return (StatusCode::NOT_FOUND, "no such session").into_response();
    }
    ws.on_upgrade(move |socket| run_session(socket, session_id.unwrap_or_else(|| KNOWN_SESSION.to_string())))
}

/// Echo keystrokes as output and ack every input.
async fn run_session(mut socket: WebSocket, session_id: String) {
    let hello = serde_json::to_string(&TerminalServerMessage::Hello { session_id }).unwrap();
    if socket.send(Message::Text(hello.into())).await.is_err() {
        return;
    }
    let _ = socket.send(Message::Text("plain banner".into())).await;

    while let Some(Ok(message)) = socket.recv().await {
        let reply = match message {
            Message::Binary(bytes) => Message::Binary(bytes),
            Message::Text(text) => match serde_json::from_str::<TerminalClientMessage>(text.as_str()) {
                Ok(TerminalClientMessage::Input { id, data }) => {
                    let ack = TerminalServerMessage::Ack {
                        id,
                        ok: data.ends_with('\n'),
                        message: None,
                    };
                    Message::Text(serde_json::to_string(&ack).unwrap().into())
                }
                Ok(TerminalClientMessage::Resize { cols, rows }) => {
                    Message::Binary(format!("[{}x{}]", cols, rows).into_bytes().into())
                }
                Err(_) => continue,
            },
            Message::Close(_) => break,
            _ => continue,
        };
        if socket.send(reply).await.is_err() {
            break;
        }
    }
}

async fn serve() -> String {
    let app = Router::new().route("/ws/terminal", get(terminal));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("ws://{}/ws/terminal", addr)
}

fn request(mode: SessionMode, session_id: Option<&str>) -> ConnectRequest {
    ConnectRequest {
        mode,
        session_id: session_id.map(str::to_string),
        cols: 80,
        rows: 24,
    }
}

async fn next_frame(link: &mut tether_core::TerminalLink) -> ServerFrame {
    tokio::time::timeout(Duration::from_secs(5), link.inbound.next())
        .await
        .expect("timed out")
        .expect("stream ended")
        .expect("transport error")
}

#[tokio::test]
async fn frames_round_trip_over_the_socket() {
    let transport = WsTerminalTransport::new(&serve().await).unwrap();
    let mut link = transport.connect(&request(SessionMode::New, None)).await.unwrap();

    assert_eq!(
        next_frame(&mut link).await,
        ServerFrame::Control(TerminalServerMessage::Hello {
            session_id: KNOWN_SESSION.into()
        })
    );
    assert_eq!(next_frame(&mut link).await, ServerFrame::Output(b"plain banner".to_vec()));

    link.outbound.send(ClientFrame::Keys(b"q".to_vec())).await.unwrap();
    assert_eq!(next_frame(&mut link).await, ServerFrame::Output(b"q".to_vec()));

    link.outbound
        .send(ClientFrame::Control(TerminalClientMessage::Input {
            id: "p1".into(),
            data: "ls\n".into(),
        }))
        .await
        .unwrap();
    assert_eq!(
        next_frame(&mut link).await,
        ServerFrame::Control(TerminalServerMessage::Ack {
            id: "p1".into(),
            ok: true,
            message: None,
        })
    );
}

#[tokio::test]
async fn rejected_handshake_is_session_not_found() {
    let transport = WsTerminalTransport::new(&serve().await).unwrap();
    let result = transport.connect(&request(SessionMode::Attach, Some("gone"))).await;
    assert!(matches!(result, Err(TetherError::SessionNotFound(id)) if id == "gone"));
}

#[tokio::test]
async fn terminal_session_over_websocket() {
    let transport = Arc::new(WsTerminalTransport::new(&serve().await).unwrap());
    let store = Arc::new(MemoryStore::new());
    let handle = TerminalSession::spawn(TerminalConfig::default(), transport, store.clone());
    let mut events = handle.subscribe();

    handle.connect(SessionMode::New).await.unwrap();
    let id = handle.send_input("echo ok").await.unwrap();

    let acked = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(TerminalEvent::InputAcked { id, cleared_composer }) = events.recv().await {
                return (id, cleared_composer);
            }
        }
    })
    .await
    .expect("no ack");
    assert_eq!(acked, (id, true));
    assert_eq!(load_session_id(store.as_ref()).as_deref(), Some(KNOWN_SESSION));

    handle.shutdown().await.unwrap();
}
