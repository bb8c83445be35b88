//! Turn session: owns per-target turn state, in-flight handles and the
//! durable pending-turn records.
//!
//! A `TurnSession` is created by the hosting application and dropped (or
//! [`TurnSession::detach`]ed) when it goes away. Every network operation runs
//! in its own task behind an [`AbortHandle`], so a new submit for a target
//! aborts whatever was in flight for it before starting.

use crate::backend::TurnBackend;
use crate::event_log::DEFAULT_EVENT_LOG_CAPACITY;
use crate::events::TurnEvent;
use crate::records;
use crate::recovery::{RecoveryConfig, RecoveryOutcome};
use crate::staleness;
use crate::store::DurableStore;
use crate::stream::{read_frames, ByteStream};
use crate::turn::{Transition, TurnState};
use crate::{Result, TetherError};
use futures::future::{AbortHandle, AbortRegistration, Abortable};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tether_types::{Draft, PendingTurn, SubmitOptions, SubmitRequest, TurnPhase, TurnResult};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Configuration for a turn session.
#[derive(Debug, Clone)]
pub struct TurnSessionConfig {
    pub event_log_capacity: usize,
    pub recovery: RecoveryConfig,
}

impl Default for TurnSessionConfig {
    fn default() -> Self {
        Self {
            event_log_capacity: DEFAULT_EVENT_LOG_CAPACITY,
            recovery: RecoveryConfig::default(),
        }
    }
}

/// Notifications for whoever renders the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Started { target: String, turn_id: String },
    Recovering { target: String, turn_id: String },
    Token { target: String, turn_id: String, delta: String },
    Updated { target: String, phase: TurnPhase, status: Option<String> },
    DraftChanged { target: String, has_draft: bool },
    Finished { target: String, turn_id: String, phase: TurnPhase, error: Option<String> },
    /// Dismissible, non-blocking message
    Notice { target: String, message: String },
}

struct TurnHandle {
    turn_id: String,
    abort: AbortHandle,
}

/// What to do with the pending-turn record when a transition finishes a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingPolicy {
    /// A terminal status was observed; the record can go.
    Clear,
    /// The client gave up locally; the server may still hold a result.
    Keep,
    /// Clear unless the turn ended in an error.
    KeepOnError,
}

pub(crate) struct Inner {
    pub(crate) backend: Arc<dyn TurnBackend>,
    pub(crate) store: Arc<dyn DurableStore>,
    pub(crate) config: TurnSessionConfig,
    slots: RwLock<HashMap<String, TurnState>>,
    handles: Mutex<HashMap<String, TurnHandle>>,
    events: broadcast::Sender<SessionEvent>,
}

/// Cloneable handle to the session's shared state.
#[derive(Clone)]
pub struct TurnSession {
    inner: Arc<Inner>,
}

impl TurnSession {
    pub fn new(
        backend: Arc<dyn TurnBackend>,
        store: Arc<dyn DurableStore>,
        config: TurnSessionConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                backend,
                store,
                config,
                slots: RwLock::new(HashMap::new()),
                handles: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Current state of the target's turn.
    pub async fn snapshot(&self, target: &str) -> Option<TurnState> {
        self.inner.slots.read().await.get(target).cloned()
    }

    /// Submit a message for `target`. Returns the client-generated turn id.
    ///
    /// The pending-turn record is written before the request starts; any
    /// in-flight operation for the same target is aborted first.
    pub async fn submit(&self, target: &str, message: &str, options: SubmitOptions) -> Result<String> {
        let turn_id = Uuid::new_v4().to_string();
        let pending = PendingTurn {
            turn_id: turn_id.clone(),
            message: message.to_string(),
            started_at_ms: now_ms(),
            target: target.to_string(),
        };

        records::save_pending_turn(self.inner.store.as_ref(), &pending)?;
        let registration = self.inner.register_handle(target, &turn_id);
        self.inner.install(TurnState::submitted(&pending, self.inner.config.event_log_capacity)).await;

        info!(target: "tether::turn", "Submitting turn {} for {}", turn_id, target);
        self.inner.emit(SessionEvent::Started {
            target: target.to_string(),
            turn_id: turn_id.clone(),
        });

        let request = SubmitRequest {
            target: target.to_string(),
            message: message.to_string(),
            turn_id: turn_id.clone(),
            options,
        };
        let inner = self.inner.clone();
        tokio::spawn(Abortable::new(inner.drive_submit(request), registration));

        Ok(turn_id)
    }

    /// Stop the target's turn: abort the local read, ask the server to stop,
    /// and mark the turn interrupted.
    pub async fn cancel(&self, target: &str) -> Result<()> {
        self.inner.abort_handle(target);

        if let Err(e) = self.inner.backend.interrupt_turn(target).await {
            warn!(target: "tether::turn", "Interrupt request for {} failed: {}", target, e);
        }

        let turn_id = self
            .snapshot(target)
            .await
            .and_then(|state| state.turn_id)
            .or_else(|| records::load_pending_turn(self.inner.store.as_ref(), target).map(|p| p.turn_id));

        if let Some(turn_id) = turn_id {
            self.inner
                .transition(target, &turn_id, PendingPolicy::Clear, |state| state.interrupt(&turn_id))
                .await;
            records::clear_pending_turn_if(self.inner.store.as_ref(), target, &turn_id)?;
        }
        Ok(())
    }

    /// Abort everything in flight without asking the server to stop.
    ///
    /// Pending-turn records are kept so a later session can recover them.
    pub fn detach(&self) {
        let mut handles = self.inner.handles.lock().unwrap_or_else(PoisonError::into_inner);
        for (target, handle) in handles.drain() {
            debug!(target: "tether::turn", "Detaching from turn {} for {}", handle.turn_id, target);
            handle.abort.abort();
        }
    }

    /// Resume an unfinished turn for `target` if one was recorded.
    pub async fn recover(&self, target: &str) -> Result<RecoveryOutcome> {
        let Some(pending) = records::load_pending_turn(self.inner.store.as_ref(), target) else {
            return Ok(RecoveryOutcome::NothingPending);
        };

        if self.inner.has_handle(target, &pending.turn_id) {
            return Ok(RecoveryOutcome::InProgress { turn_id: pending.turn_id });
        }

        let registration = self.inner.register_handle(target, &pending.turn_id);
        self.inner
            .install(TurnState::recovering(&pending, self.inner.config.event_log_capacity))
            .await;

        info!(target: "tether::recovery", "Recovering turn {} for {}", pending.turn_id, target);
        self.inner.emit(SessionEvent::Recovering {
            target: target.to_string(),
            turn_id: pending.turn_id.clone(),
        });

        let turn_id = pending.turn_id.clone();
        let inner = self.inner.clone();
        tokio::spawn(Abortable::new(inner.run_recovery(pending), registration));

        Ok(RecoveryOutcome::Started { turn_id })
    }

    /// Recover every target with a pending-turn record.
    pub async fn recover_all(&self) -> Result<Vec<(String, RecoveryOutcome)>> {
        let mut outcomes = Vec::new();
        for target in records::pending_turn_targets(self.inner.store.as_ref())? {
            let outcome = self.recover(&target).await?;
            outcomes.push((target, outcome));
        }
        Ok(outcomes)
    }

    pub async fn reset_thread(&self, key: &str) -> Result<()> {
        self.inner.backend.reset_thread(key).await
    }

    // ========================================================================
    // Drafts
    // ========================================================================

    /// The target's current draft, as last produced by a turn or fetched.
    pub async fn draft(&self, target: &str) -> Option<Draft> {
        self.inner.slots.read().await.get(target).and_then(|state| state.draft.clone())
    }

    /// The target's draft with staleness refreshed against `document`.
    pub async fn draft_against(&self, target: &str, document: &str) -> Option<Draft> {
        let mut draft = self.draft(target).await?;
        staleness::refresh(&mut draft, document);
        Some(draft)
    }

    /// Fetch the target's draft from the backend and install it locally.
    pub async fn fetch_draft(&self, target: &str) -> Result<Option<Draft>> {
        let draft = self.inner.backend.get_draft(target).await?;
        self.inner.set_draft(target, draft.clone()).await;
        Ok(draft)
    }

    /// Apply the target's draft.
    ///
    /// With a live `document`, a stale draft is refused unless `force` is set;
    /// the backend is not called in that case.
    pub async fn apply_draft(&self, target: &str, document: Option<&str>, force: bool) -> Result<()> {
        let draft = match self.draft(target).await {
            Some(draft) => draft,
            None => self
                .fetch_draft(target)
                .await?
                .ok_or_else(|| TetherError::NoDraft(target.to_string()))?,
        };

        if let Some(document) = document {
            staleness::check_apply(&draft, document, force)?;
        }

        self.inner.backend.apply_draft(target, force).await?;
        info!(target: "tether::turn", "Applied draft for {} (force: {})", target, force);
        self.inner.set_draft(target, None).await;
        Ok(())
    }

    pub async fn discard_draft(&self, target: &str) -> Result<()> {
        self.inner.backend.discard_draft(target).await?;
        info!(target: "tether::turn", "Discarded draft for {}", target);
        self.inner.set_draft(target, None).await;
        Ok(())
    }
}

impl Inner {
    pub(crate) fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Abort any previous handle for `target` and register a new one.
    fn register_handle(&self, target: &str, turn_id: &str) -> AbortRegistration {
        let (abort, registration) = AbortHandle::new_pair();
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = handles.insert(
            target.to_string(),
            TurnHandle {
                turn_id: turn_id.to_string(),
                abort,
            },
        ) {
            debug!(target: "tether::turn", "Aborting in-flight turn {} for {}", previous.turn_id, target);
            previous.abort.abort();
        }
        registration
    }

    fn abort_handle(&self, target: &str) {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = handles.remove(target) {
            handle.abort.abort();
        }
    }

    fn has_handle(&self, target: &str, turn_id: &str) -> bool {
        let handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        handles.get(target).is_some_and(|handle| handle.turn_id == turn_id)
    }

    /// Forget the handle for a turn that finished on its own.
    fn release_handle(&self, target: &str, turn_id: &str) {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        if handles.get(target).is_some_and(|handle| handle.turn_id == turn_id) {
            handles.remove(target);
        }
    }

    /// Replace the target's turn state, carrying over its draft.
    async fn install(&self, mut state: TurnState) {
        let mut slots = self.slots.write().await;
        if let Some(previous) = slots.get_mut(&state.target) {
            state.draft = previous.draft.take();
        }
        slots.insert(state.target.clone(), state);
    }

    async fn set_draft(&self, target: &str, draft: Option<Draft>) {
        {
            let mut slots = self.slots.write().await;
            let state = slots
                .entry(target.to_string())
                .or_insert_with(|| TurnState::idle(target, self.config.event_log_capacity));
            state.draft = draft;
        }
        let has_draft = self.draft_present(target).await;
        self.emit(SessionEvent::DraftChanged {
            target: target.to_string(),
            has_draft,
        });
    }

    async fn draft_present(&self, target: &str) -> bool {
        self.slots.read().await.get(target).is_some_and(|state| state.draft.is_some())
    }

    /// Whether the state for `target` has moved on from `turn_id` or finished.
    pub(crate) async fn is_settled(&self, target: &str, turn_id: &str) -> bool {
        match self.slots.read().await.get(target) {
            Some(state) => !state.is_current(turn_id) || state.is_terminal(),
            None => true,
        }
    }

    /// Run `f` against the target's state and publish the outcome.
    pub(crate) async fn transition<F>(&self, target: &str, turn_id: &str, policy: PendingPolicy, f: F) -> Transition
    where
        F: FnOnce(&mut TurnState) -> Transition,
    {
        let (transition, phase, status, error) = {
            let mut slots = self.slots.write().await;
            let Some(state) = slots.get_mut(target) else {
                return Transition::Ignored;
            };
            let transition = f(state);
            (transition, state.phase, state.status_text.clone(), state.error.clone())
        };

        let Transition::Applied { draft_changed, finished } = transition else {
            return transition;
        };

        self.emit(SessionEvent::Updated {
            target: target.to_string(),
            phase,
            status,
        });

        if draft_changed {
            let has_draft = self.draft_present(target).await;
            self.emit(SessionEvent::DraftChanged {
                target: target.to_string(),
                has_draft,
            });
        }

        if finished {
            let clear = match policy {
                PendingPolicy::Clear => true,
                PendingPolicy::Keep => false,
                PendingPolicy::KeepOnError => phase != TurnPhase::Error,
            };
            if clear {
                if let Err(e) = records::clear_pending_turn_if(self.store.as_ref(), target, turn_id) {
                    warn!(target: "tether::store", "Failed to clear pending turn for {}: {}", target, e);
                }
            }
            self.release_handle(target, turn_id);
            info!(target: "tether::turn", "Turn {} for {} finished: {}", turn_id, target, phase);
            self.emit(SessionEvent::Finished {
                target: target.to_string(),
                turn_id: turn_id.to_string(),
                phase,
                error,
            });
        }

        transition
    }

    pub(crate) async fn apply_event(&self, target: &str, turn_id: &str, event: &TurnEvent) -> Transition {
        let transition = self
            .transition(target, turn_id, PendingPolicy::Clear, |state| state.apply(turn_id, event))
            .await;
        if let (TurnEvent::Token(delta), true) = (event, transition.is_applied()) {
            self.emit(SessionEvent::Token {
                target: target.to_string(),
                turn_id: turn_id.to_string(),
                delta: delta.clone(),
            });
        }
        transition
    }

    pub(crate) async fn apply_result(&self, target: &str, turn_id: &str, result: &TurnResult) -> Transition {
        self.transition(target, turn_id, PendingPolicy::Clear, |state| state.apply_result(turn_id, result))
            .await
    }

    async fn fail_transport(&self, target: &str, turn_id: &str, error: &TetherError) {
        warn!(target: "tether::turn", "Turn {} for {} failed in transport: {}", turn_id, target, error);
        let message = error.to_string();
        self.transition(target, turn_id, PendingPolicy::Keep, |state| {
            state.fail_transport(turn_id, &message)
        })
        .await;
    }

    async fn drive_submit(self: Arc<Self>, request: SubmitRequest) {
        let target = request.target.clone();
        let turn_id = request.turn_id.clone();

        let stream = match self.backend.submit_turn(&request).await {
            Ok(stream) => stream,
            Err(e) => {
                self.fail_transport(&target, &turn_id, &e).await;
                return;
            }
        };

        match self.consume(&target, &turn_id, stream).await {
            Ok(true) => {}
            Ok(false) => {
                // A synthesized error keeps the record so recovery can still
                // find the server's result.
                self.transition(&target, &turn_id, PendingPolicy::KeepOnError, |state| {
                    state.finish_stream(&turn_id)
                })
                .await;
            }
            Err(e) => self.fail_transport(&target, &turn_id, &e).await,
        }
    }

    /// Feed a byte stream through the reader and state machine.
    ///
    /// Returns `Ok(true)` once the turn is terminal, `Ok(false)` on a clean end
    /// without one.
    pub(crate) async fn consume(&self, target: &str, turn_id: &str, stream: ByteStream) -> Result<bool> {
        let mut frames = read_frames(stream);
        while let Some(frame) = frames.next().await {
            let frame = frame?;
            let event = TurnEvent::from_frame(&frame);
            self.apply_event(target, turn_id, &event).await;
            if self.is_settled(target, turn_id).await {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

pub(crate) fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
