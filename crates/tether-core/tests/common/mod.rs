//! In-memory fakes of the turn backend and terminal transport.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_core::{
    byte_stream_from_chunks, ByteStream, ConnectRequest, Result, TerminalLink, TerminalTransport,
    TetherError, TurnBackend,
};
use tether_types::{
    ActiveTurnStatus, ClientFrame, Draft, ServerFrame, SubmitRequest, TurnCoordinates,
};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;

// ============================================================================
// Turn backend
// ============================================================================

pub enum Script {
    /// Serve these chunks, then end cleanly.
    Chunks(Vec<Vec<u8>>),
    /// Serve whatever the test pushes; ends when the sender is dropped.
    Channel(mpsc::UnboundedReceiver<Result<Vec<u8>>>),
    /// Fail the request itself.
    Fail(String),
}

#[derive(Default)]
pub struct FakeBackend {
    submit_scripts: Mutex<VecDeque<Script>>,
    attach_scripts: Mutex<VecDeque<Script>>,
    queries: Mutex<VecDeque<ActiveTurnStatus>>,
    draft: Mutex<Option<Draft>>,
    pub submitted: Mutex<Vec<SubmitRequest>>,
    pub attached: Mutex<Vec<TurnCoordinates>>,
    pub applied: Mutex<Vec<(String, bool)>>,
    pub query_count: AtomicUsize,
    pub interrupt_count: AtomicUsize,
    pub discard_count: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_submit(&self, chunks: &[&str]) {
        let chunks = chunks.iter().map(|c| c.as_bytes().to_vec()).collect();
        self.submit_scripts.lock().unwrap().push_back(Script::Chunks(chunks));
    }

    pub fn push_submit_channel(&self) -> mpsc::UnboundedSender<Result<Vec<u8>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.submit_scripts.lock().unwrap().push_back(Script::Channel(rx));
        tx
    }

    pub fn push_submit_failure(&self, message: &str) {
        self.submit_scripts.lock().unwrap().push_back(Script::Fail(message.to_string()));
    }

    pub fn push_attach_channel(&self) -> mpsc::UnboundedSender<Result<Vec<u8>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.attach_scripts.lock().unwrap().push_back(Script::Channel(rx));
        tx
    }

    /// Queue query responses. The last one repeats once the queue drains.
    pub fn push_query(&self, status: ActiveTurnStatus) {
        self.queries.lock().unwrap().push_back(status);
    }

    pub fn set_draft(&self, draft: Option<Draft>) {
        *self.draft.lock().unwrap() = draft;
    }

    pub fn queries(&self) -> usize {
        self.query_count.load(Ordering::SeqCst)
    }

    fn serve(script: Option<Script>) -> Result<ByteStream> {
        match script {
            Some(Script::Chunks(chunks)) => Ok(byte_stream_from_chunks(chunks)),
            Some(Script::Channel(rx)) => Ok(UnboundedReceiverStream::new(rx).boxed()),
            Some(Script::Fail(message)) => Err(TetherError::Transport(message)),
            None => Ok(futures::stream::pending().boxed()),
        }
    }
}

#[async_trait]
impl TurnBackend for FakeBackend {
    async fn submit_turn(&self, request: &SubmitRequest) -> Result<ByteStream> {
        self.submitted.lock().unwrap().push(request.clone());
        let script = self.submit_scripts.lock().unwrap().pop_front();
        Self::serve(script)
    }

    async fn query_active_turn(&self, _turn_id: &str) -> Result<ActiveTurnStatus> {
        self.query_count.fetch_add(1, Ordering::SeqCst);
        let mut queries = self.queries.lock().unwrap();
        let status = if queries.len() > 1 {
            queries.pop_front()
        } else {
            queries.front().cloned()
        };
        Ok(status.unwrap_or_default())
    }

    async fn attach_turn_events(&self, coordinates: &TurnCoordinates) -> Result<ByteStream> {
        self.attached.lock().unwrap().push(coordinates.clone());
        let script = self.attach_scripts.lock().unwrap().pop_front();
        Self::serve(script)
    }

    async fn interrupt_turn(&self, _target: &str) -> Result<()> {
        self.interrupt_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reset_thread(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn get_draft(&self, _target: &str) -> Result<Option<Draft>> {
        Ok(self.draft.lock().unwrap().clone())
    }

    async fn apply_draft(&self, target: &str, force: bool) -> Result<()> {
        self.applied.lock().unwrap().push((target.to_string(), force));
        Ok(())
    }

    async fn discard_draft(&self, _target: &str) -> Result<()> {
        self.discard_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Terminal transport
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accept,
    Fail,
    NotFound,
    /// The handshake never completes.
    Hang,
}

/// The server side of one accepted connection.
pub struct ServerEnd {
    pub request: ConnectRequest,
    pub from_client: mpsc::Receiver<ClientFrame>,
    pub to_client: mpsc::UnboundedSender<Result<ServerFrame>>,
}

impl ServerEnd {
    pub async fn next_frame(&mut self) -> ClientFrame {
        tokio::time::timeout(Duration::from_secs(60), self.from_client.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("client closed the connection")
    }

    pub fn send(&self, frame: ServerFrame) {
        let _ = self.to_client.send(Ok(frame));
    }
}

pub struct FakeTransport {
    outcomes: Mutex<VecDeque<Outcome>>,
    pub attempts: Mutex<Vec<(ConnectRequest, Instant)>>,
    servers: mpsc::UnboundedSender<ServerEnd>,
}

impl FakeTransport {
    /// Outcomes are consumed in order; once exhausted every attempt is accepted.
    pub fn new(outcomes: &[Outcome]) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (servers, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            outcomes: Mutex::new(outcomes.iter().copied().collect()),
            attempts: Mutex::new(Vec::new()),
            servers,
        });
        (transport, rx)
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().iter().map(|(_, at)| *at).collect()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }
}

#[async_trait]
impl TerminalTransport for FakeTransport {
    async fn connect(&self, request: &ConnectRequest) -> Result<TerminalLink> {
        self.attempts.lock().unwrap().push((request.clone(), Instant::now()));
        let outcome = self.outcomes.lock().unwrap().pop_front().unwrap_or(Outcome::Accept);

        match outcome {
            Outcome::Fail => Err(TetherError::Transport("connection refused".to_string())),
            Outcome::Hang => futures::future::pending().await,
            Outcome::NotFound => Err(TetherError::SessionNotFound(
                request.session_id.clone().unwrap_or_default(),
            )),
            Outcome::Accept => {
                let (outbound, from_client) = mpsc::channel(64);
                let (to_client, inbound) = mpsc::unbounded_channel();
                let _ = self.servers.send(ServerEnd {
                    request: request.clone(),
                    from_client,
                    to_client,
                });
                Ok(TerminalLink {
                    outbound,
                    inbound: UnboundedReceiverStream::new(inbound).boxed(),
                })
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Receive broadcast events until one matches.
pub async fn wait_for<T, F>(rx: &mut broadcast::Receiver<T>, mut matches: F) -> T
where
    T: Clone,
    F: FnMut(&T) -> bool,
{
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            match rx.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

pub async fn next_server(servers: &mut mpsc::UnboundedReceiver<ServerEnd>) -> ServerEnd {
    tokio::time::timeout(Duration::from_secs(600), servers.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("transport dropped")
}
