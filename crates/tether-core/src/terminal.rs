//! Terminal session manager.
//!
//! One actor task owns the connection and all of its state. The application
//! drives it through a cloneable [`TerminalHandle`] and observes it through a
//! broadcast channel of [`TerminalEvent`]s. A torn-down connection's inbound
//! stream is dropped before a replacement is installed, so frames from an old
//! socket are never processed after a reconnect.

use crate::reconnect::ReconnectPolicy;
use crate::records::{self, SESSION_ID_KEY};
use crate::store::DurableStore;
use crate::terminal_input::{AckOutcome, InputTracker, DEFAULT_RETRY_MIN_INTERVAL};
use crate::transport::{ConnectRequest, TerminalLink, TerminalTransport};
use crate::{Result, TetherError};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tether_types::{
    ClientFrame, ConnectionState, PendingInput, ServerFrame, SessionMode, TerminalClientMessage,
    TerminalServerMessage,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for a terminal session.
#[derive(Debug, Clone)]
pub struct TerminalConfig {
    pub reconnect: ReconnectPolicy,
    /// Upper bound on a single connection handshake
    pub connect_timeout: Duration,
    /// Minimum spacing between manual retries of pending input
    pub retry_min_interval: Duration,
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry_min_interval: DEFAULT_RETRY_MIN_INTERVAL,
            cols: 80,
            rows: 24,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    StateChanged(ConnectionState),
    Output(Vec<u8>),
    SessionAssigned(String),
    /// The saved session id was rejected by the server and forgotten.
    SessionInvalidated,
    InputSent { id: String, replay: bool },
    InputAcked { id: String, cleared_composer: bool },
    InputFailed { id: String, message: String },
    /// Pending input dropped because the composer no longer matches it.
    InputDiscarded { id: String },
    ComposerChanged(String),
    Reconnecting { attempt: u32, delay: Duration },
    Exited { code: Option<i32> },
    /// Status text for the user; never blocks anything.
    Notice(String),
}

/// Point-in-time view of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalSnapshot {
    pub state: ConnectionState,
    pub mode: SessionMode,
    pub session_id: Option<String>,
    pub pending_input: Option<PendingInput>,
    pub composer: String,
    pub reconnect_attempt: u32,
    pub cols: u16,
    pub rows: u16,
}

enum Command {
    Connect {
        mode: SessionMode,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect,
    SendKeys(Vec<u8>),
    SendInput {
        text: String,
        reply: oneshot::Sender<Result<String>>,
    },
    RetryInput {
        reply: oneshot::Sender<Result<()>>,
    },
    EditComposer(String),
    Resize {
        cols: u16,
        rows: u16,
    },
    Snapshot(oneshot::Sender<TerminalSnapshot>),
    Shutdown,
}

/// Cloneable handle to a running terminal session.
#[derive(Clone)]
pub struct TerminalHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<TerminalEvent>,
}

impl TerminalHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<TerminalEvent> {
        self.events.subscribe()
    }

    /// Open a connection in `mode`. Resolves once the connection is open or
    /// the attempt failed. A `disconnect` or `shutdown` issued meanwhile
    /// abandons the attempt and this resolves to [`TetherError::Aborted`].
    pub async fn connect(&self, mode: SessionMode) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Connect { mode, reply }).await?;
        rx.await.map_err(|_| TetherError::ChannelClosed)?
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.send(Command::Disconnect).await
    }

    /// Raw keystrokes; dropped unless the connection is open.
    pub async fn send_keys(&self, bytes: impl Into<Vec<u8>>) -> Result<()> {
        self.send(Command::SendKeys(bytes.into())).await
    }

    /// Send composed text as ack-tracked input. Returns its correlation id.
    ///
    /// The input is durable before this resolves; if the connection is not
    /// open it is delivered on the next successful connection.
    pub async fn send_input(&self, text: &str) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SendInput {
            text: text.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| TetherError::ChannelClosed)?
    }

    pub async fn retry_input(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RetryInput { reply }).await?;
        rx.await.map_err(|_| TetherError::ChannelClosed)?
    }

    pub async fn edit_composer(&self, text: &str) -> Result<()> {
        self.send(Command::EditComposer(text.to_string())).await
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.send(Command::Resize { cols, rows }).await
    }

    pub async fn snapshot(&self) -> Result<TerminalSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot(reply)).await?;
        rx.await.map_err(|_| TetherError::ChannelClosed)
    }

    /// Close the connection and stop the actor.
    pub async fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown).await
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| TetherError::ChannelClosed)
    }
}

pub struct TerminalSession;

impl TerminalSession {
    /// Start the session actor. No connection is opened until
    /// [`TerminalHandle::connect`] is called.
    pub fn spawn(
        config: TerminalConfig,
        transport: Arc<dyn TerminalTransport>,
        store: Arc<dyn DurableStore>,
    ) -> TerminalHandle {
        let (commands_tx, commands) = mpsc::channel(64);
        let (events, _) = broadcast::channel(256);

        let actor = TerminalActor {
            inputs: InputTracker::load(store.clone(), config.retry_min_interval),
            session_id: records::load_session_id(store.as_ref()),
            cols: config.cols,
            rows: config.rows,
            config,
            transport,
            store,
            state: ConnectionState::Disconnected,
            mode: SessionMode::Attach,
            link: None,
            attempt: None,
            generation: 0,
            reconnect_attempt: 0,
            reconnect_at: None,
            exhausted_notice_sent: false,
            events: events.clone(),
            commands,
        };
        tokio::spawn(actor.run());

        TerminalHandle {
            commands: commands_tx,
            events,
        }
    }
}

struct ConnectAttempt {
    future: BoxFuture<'static, Result<TerminalLink>>,
    /// Present for user-initiated connects; automatic reconnects have no caller
    reply: Option<oneshot::Sender<Result<()>>>,
}

struct TerminalActor {
    config: TerminalConfig,
    transport: Arc<dyn TerminalTransport>,
    store: Arc<dyn DurableStore>,
    inputs: InputTracker,
    state: ConnectionState,
    mode: SessionMode,
    session_id: Option<String>,
    link: Option<TerminalLink>,
    /// In-flight handshake; dropping it abandons the attempt
    attempt: Option<ConnectAttempt>,
    /// Incremented on every successful open
    generation: u64,
    reconnect_attempt: u32,
    reconnect_at: Option<Instant>,
    exhausted_notice_sent: bool,
    cols: u16,
    rows: u16,
    events: broadcast::Sender<TerminalEvent>,
    commands: mpsc::Receiver<Command>,
}

impl TerminalActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => {
                        self.close();
                        break;
                    }
                    Some(command) => self.handle(command).await,
                },
                frame = next_inbound(&mut self.link) => self.on_inbound(frame).await,
                result = next_attempt(&mut self.attempt) => self.on_attempt(result).await,
                _ = wait_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.reconnect();
                }
            }
        }
        debug!(target: "tether::terminal", "Terminal session actor stopped");
    }

    fn emit(&self, event: TerminalEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(target: "tether::terminal", "Connection {:?} -> {:?}", self.state, state);
            self.state = state;
            self.emit(TerminalEvent::StateChanged(state));
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Connect { mode, reply } => self.connect(mode, reply),
            Command::Disconnect => self.close(),
            Command::SendKeys(bytes) => {
                if self.state == ConnectionState::Open {
                    self.send_frame(ClientFrame::Keys(bytes)).await;
                } else {
                    debug!(target: "tether::terminal", "Dropping {} keystroke bytes while {:?}", bytes.len(), self.state);
                }
            }
            Command::SendInput { text, reply } => {
                let result = self.send_input(&text).await;
                let _ = reply.send(result);
            }
            Command::RetryInput { reply } => {
                let result = self.retry_input().await;
                let _ = reply.send(result);
            }
            Command::EditComposer(text) => {
                if let Some(discarded) = self.inputs.edit_composer(&text) {
                    info!(target: "tether::terminal", "Discarding stale pending input {}", discarded.id);
                    self.emit(TerminalEvent::InputDiscarded { id: discarded.id });
                }
                self.emit(TerminalEvent::ComposerChanged(text));
            }
            Command::Resize { cols, rows } => {
                self.cols = cols;
                self.rows = rows;
                if self.state == ConnectionState::Open {
                    self.send_frame(ClientFrame::Control(TerminalClientMessage::Resize { cols, rows }))
                        .await;
                }
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => {}
        }
    }

    fn snapshot(&self) -> TerminalSnapshot {
        TerminalSnapshot {
            state: self.state,
            mode: self.mode,
            session_id: self.session_id.clone(),
            pending_input: self.inputs.pending().cloned(),
            composer: self.inputs.composer().to_string(),
            reconnect_attempt: self.reconnect_attempt,
            cols: self.cols,
            rows: self.rows,
        }
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    fn connect(&mut self, mode: SessionMode, reply: oneshot::Sender<Result<()>>) {
        self.abort_attempt();
        self.link = None;
        self.reconnect_at = None;
        self.reconnect_attempt = 0;
        self.exhausted_notice_sent = false;

        if mode == SessionMode::New && self.session_id.is_some() {
            self.forget_session();
        }
        if mode == SessionMode::Attach && self.session_id.is_none() {
            self.set_state(ConnectionState::Disconnected);
            self.emit(TerminalEvent::Notice("No saved session to attach to".to_string()));
            let _ = reply.send(Err(TetherError::SessionNotFound("no saved session".to_string())));
            return;
        }

        self.mode = mode;
        self.set_state(ConnectionState::Connecting);
        self.start_attempt(Some(reply));
    }

    /// Begin a handshake with the current mode and session id. The actor keeps
    /// serving commands while it runs.
    fn start_attempt(&mut self, reply: Option<oneshot::Sender<Result<()>>>) {
        let request = ConnectRequest {
            mode: self.mode,
            session_id: self.session_id.clone(),
            cols: self.cols,
            rows: self.rows,
        };
        let transport = self.transport.clone();
        let limit = self.config.connect_timeout;

        let future = async move {
            match timeout(limit, transport.connect(&request)).await {
                Ok(result) => result,
                Err(_) => Err(TetherError::Transport(format!("connect timed out after {:?}", limit))),
            }
        }
        .boxed();
        self.attempt = Some(ConnectAttempt { future, reply });
    }

    /// Drop the in-flight handshake, failing its caller with `Aborted`.
    fn abort_attempt(&mut self) {
        let Some(attempt) = self.attempt.take() else {
            return;
        };
        info!(target: "tether::terminal", "Abandoning connection attempt ({})", self.mode.as_str());
        if let Some(reply) = attempt.reply {
            let _ = reply.send(Err(TetherError::Aborted));
        }
    }

    async fn on_attempt(&mut self, result: Result<TerminalLink>) {
        let reply = self.attempt.take().and_then(|attempt| attempt.reply);
        let manual = reply.is_some();

        let result = match result {
            Ok(link) => {
                self.on_open(link).await;
                Ok(())
            }
            Err(TetherError::SessionNotFound(id)) => {
                self.invalidate_session();
                self.set_state(ConnectionState::Disconnected);
                Err(TetherError::SessionNotFound(id))
            }
            Err(e) if manual => {
                warn!(target: "tether::terminal", "Connect ({}) failed: {}", self.mode.as_str(), e);
                self.emit(TerminalEvent::Notice(format!("Connection failed: {}", e)));
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
            Err(e) => {
                self.on_connection_lost(&e.to_string());
                Err(e)
            }
        };

        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }

    /// Install a fresh link and run the on-open sequence.
    async fn on_open(&mut self, link: TerminalLink) {
        self.link = Some(link);
        self.generation += 1;
        self.reconnect_attempt = 0;
        self.exhausted_notice_sent = false;
        self.set_state(ConnectionState::Open);
        info!(target: "tether::terminal", "Terminal connected ({}, generation {})", self.mode.as_str(), self.generation);

        let resize = TerminalClientMessage::Resize {
            cols: self.cols,
            rows: self.rows,
        };
        if !self.send_frame(ClientFrame::Control(resize)).await {
            return;
        }

        if let Some(input) = self.inputs.take_replay(self.generation) {
            info!(target: "tether::terminal", "Replaying pending input {}", input.id);
            self.deliver(&input, true).await;
        }
    }

    fn reconnect(&mut self) {
        if self.session_id.is_none() {
            self.set_state(ConnectionState::Disconnected);
            return;
        }
        if self.attempt.is_some() {
            return;
        }
        self.mode = SessionMode::Attach;
        info!(target: "tether::terminal", "Reconnect attempt {}", self.reconnect_attempt);
        self.start_attempt(None);
    }

    /// User-initiated close; no auto-reconnect.
    fn close(&mut self) {
        self.abort_attempt();
        self.reconnect_at = None;
        if self.link.is_some() {
            self.set_state(ConnectionState::Closing);
            self.link = None;
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn on_connection_lost(&mut self, reason: &str) {
        self.link = None;
        warn!(target: "tether::terminal", "Terminal connection lost: {}", reason);

        if self.session_id.is_none() {
            self.set_state(ConnectionState::Disconnected);
            self.emit(TerminalEvent::Notice("Disconnected".to_string()));
            return;
        }

        let attempt = self.reconnect_attempt + 1;
        match self.config.reconnect.delay(attempt) {
            Some(delay) => {
                self.reconnect_attempt = attempt;
                self.reconnect_at = Some(Instant::now() + delay);
                self.set_state(ConnectionState::Connecting);
                self.emit(TerminalEvent::Reconnecting { attempt, delay });
            }
            None => {
                self.reconnect_at = None;
                self.set_state(ConnectionState::Disconnected);
                if !self.exhausted_notice_sent {
                    self.exhausted_notice_sent = true;
                    self.emit(TerminalEvent::Notice(
                        "Connection lost. Reconnect manually to continue.".to_string(),
                    ));
                }
            }
        }
    }

    // ========================================================================
    // Inbound frames
    // ========================================================================

    async fn on_inbound(&mut self, frame: Option<Result<ServerFrame>>) {
        match frame {
            Some(Ok(ServerFrame::Output(bytes))) => self.emit(TerminalEvent::Output(bytes)),
            Some(Ok(ServerFrame::Control(message))) => self.on_control(message),
            Some(Err(e)) => self.on_connection_lost(&e.to_string()),
            None => self.on_connection_lost("closed by server"),
        }
    }

    fn on_control(&mut self, message: TerminalServerMessage) {
        if message.is_session_not_found() {
            self.link = None;
            self.invalidate_session();
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        match message {
            TerminalServerMessage::Hello { session_id } => {
                info!(target: "tether::terminal", "Session assigned: {}", session_id);
                if let Err(e) = records::save(self.store.as_ref(), SESSION_ID_KEY, &session_id) {
                    warn!(target: "tether::store", "Failed to persist session id: {}", e);
                }
                self.session_id = Some(session_id.clone());
                self.emit(TerminalEvent::SessionAssigned(session_id));
            }
            TerminalServerMessage::Ack { id, ok, message } => match self.inputs.on_ack(&id, ok, message) {
                AckOutcome::Delivered { id, cleared_composer } => {
                    debug!(target: "tether::terminal", "Input {} acknowledged", id);
                    self.emit(TerminalEvent::InputAcked { id, cleared_composer });
                    if cleared_composer {
                        self.emit(TerminalEvent::ComposerChanged(String::new()));
                    }
                }
                AckOutcome::Rejected { id, message } => {
                    warn!(target: "tether::terminal", "Input {} rejected: {}", id, message);
                    self.emit(TerminalEvent::InputFailed { id, message });
                }
                AckOutcome::Unmatched => {}
            },
            TerminalServerMessage::Exit { code } => {
                info!(target: "tether::terminal", "Terminal process exited ({:?})", code);
                self.link = None;
                self.reconnect_at = None;
                self.forget_session();
                self.set_state(ConnectionState::Disconnected);
                self.emit(TerminalEvent::Exited { code });
            }
            TerminalServerMessage::Error { message, .. } => {
                warn!(target: "tether::terminal", "Server error: {}", message);
                self.emit(TerminalEvent::Notice(message));
            }
        }
    }

    fn forget_session(&mut self) {
        self.session_id = None;
        if let Err(e) = records::clear(self.store.as_ref(), SESSION_ID_KEY) {
            warn!(target: "tether::store", "Failed to clear session id: {}", e);
        }
    }

    /// The saved session no longer exists; stop retrying it.
    fn invalidate_session(&mut self) {
        warn!(target: "tether::terminal", "Saved session not found; forgetting it");
        self.reconnect_at = None;
        self.forget_session();
        self.emit(TerminalEvent::SessionInvalidated);
        self.emit(TerminalEvent::Notice("Session not found. Start a new session.".to_string()));
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Write a frame to the open link. A failed write counts as a lost
    /// connection.
    async fn send_frame(&mut self, frame: ClientFrame) -> bool {
        let Some(link) = &self.link else {
            return false;
        };
        if link.outbound.send(frame).await.is_ok() {
            return true;
        }
        self.on_connection_lost("outbound channel closed");
        false
    }

    async fn deliver(&mut self, input: &PendingInput, replay: bool) {
        let frame = ClientFrame::Control(TerminalClientMessage::Input {
            id: input.id.clone(),
            data: input.payload.clone(),
        });
        if self.send_frame(frame).await {
            self.inputs.mark_sent(self.generation);
            self.emit(TerminalEvent::InputSent {
                id: input.id.clone(),
                replay,
            });
        }
    }

    async fn send_input(&mut self, text: &str) -> Result<String> {
        let input = self.inputs.compose(text)?;
        self.emit(TerminalEvent::ComposerChanged(text.to_string()));
        if self.state == ConnectionState::Open {
            self.deliver(&input, false).await;
        } else {
            debug!(target: "tether::terminal", "Queued input {} until connected", input.id);
        }
        Ok(input.id)
    }

    async fn retry_input(&mut self) -> Result<()> {
        if self.state != ConnectionState::Open {
            return Err(TetherError::NotConnected);
        }
        let input = self.inputs.begin_retry()?;
        info!(target: "tether::terminal", "Retrying input {}", input.id);
        self.deliver(&input, false).await;
        Ok(())
    }
}

async fn next_inbound(link: &mut Option<TerminalLink>) -> Option<Result<ServerFrame>> {
    match link {
        Some(link) => link.inbound.next().await,
        None => futures::future::pending().await,
    }
}

async fn next_attempt(attempt: &mut Option<ConnectAttempt>) -> Result<TerminalLink> {
    match attempt {
        Some(attempt) => (&mut attempt.future).await,
        None => futures::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}
