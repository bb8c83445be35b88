//! Per-target turn state machine.
//!
//! `Idle -> Queued -> Responding -> {Done, Error, Interrupted}`. Once a turn
//! is terminal every further event for it is a no-op, and events carrying a
//! different turn id (a superseded attempt) are ignored outright.

use crate::event_log::EventLog;
use crate::events::TurnEvent;
use crate::update::{parse_update, DraftDirective, ParseStrategy};
use tether_types::{Draft, PendingTurn, TurnCoordinates, TurnPhase, TurnResult, TurnStatus};
use tracing::{debug, trace};

/// Status texts that carry no information beyond the phase itself.
const GENERIC_STATUSES: &[&str] = &["queued", "pending", "running", "responding", "working"];

pub(crate) const STREAM_ENDED_EARLY: &str = "stream ended before the turn finished";

/// Result of feeding one event to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Stale turn id, or the turn was already terminal.
    Ignored,
    Applied {
        draft_changed: bool,
        finished: bool,
    },
}

impl Transition {
    fn applied() -> Self {
        Transition::Applied { draft_changed: false, finished: false }
    }

    pub fn is_applied(self) -> bool {
        matches!(self, Transition::Applied { .. })
    }

    pub fn finished(self) -> bool {
        matches!(self, Transition::Applied { finished: true, .. })
    }

    pub fn draft_changed(self) -> bool {
        matches!(self, Transition::Applied { draft_changed: true, .. })
    }
}

/// Everything the client knows about the current turn for one target.
#[derive(Debug, Clone)]
pub struct TurnState {
    pub target: String,
    pub turn_id: Option<String>,
    pub message: String,
    /// Live coordinates once the backend has announced them
    pub coordinates: Option<TurnCoordinates>,
    pub phase: TurnPhase,
    pub status_text: Option<String>,
    pub started_at_ms: u64,
    pub response: String,
    /// Visible error, set only for `Error`
    pub error: Option<String>,
    pub interrupted_detail: Option<String>,
    pub draft: Option<Draft>,
    pub event_log: EventLog,
    /// Rendered as running while the turn is being recovered after a reload
    pub recovering: bool,
    update_received: bool,
}

impl TurnState {
    pub fn idle(target: impl Into<String>, log_capacity: usize) -> Self {
        Self {
            target: target.into(),
            turn_id: None,
            message: String::new(),
            coordinates: None,
            phase: TurnPhase::Idle,
            status_text: None,
            started_at_ms: 0,
            response: String::new(),
            error: None,
            interrupted_detail: None,
            draft: None,
            event_log: EventLog::new(log_capacity),
            recovering: false,
            update_received: false,
        }
    }

    /// Fresh state for a turn that was just submitted.
    pub fn submitted(pending: &PendingTurn, log_capacity: usize) -> Self {
        let mut state = Self::idle(pending.target.clone(), log_capacity);
        state.turn_id = Some(pending.turn_id.clone());
        state.message = pending.message.clone();
        state.started_at_ms = pending.started_at_ms;
        state.phase = TurnPhase::Queued;
        state.status_text = Some("queued".to_string());
        state
    }

    /// Running state rendered immediately when a pending turn is found on reinit.
    pub fn recovering(pending: &PendingTurn, log_capacity: usize) -> Self {
        let mut state = Self::submitted(pending, log_capacity);
        state.phase = TurnPhase::Responding;
        state.status_text = Some("recovering".to_string());
        state.recovering = true;
        state
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn is_current(&self, turn_id: &str) -> bool {
        self.turn_id.as_deref() == Some(turn_id)
    }

    /// Feed one stream event for `turn_id`.
    pub fn apply(&mut self, turn_id: &str, event: &TurnEvent) -> Transition {
        if !self.is_current(turn_id) {
            debug!(target: "tether::turn", "Ignoring event for superseded turn {}", turn_id);
            return Transition::Ignored;
        }
        if self.is_terminal() {
            trace!(target: "tether::turn", "Ignoring {:?} after terminal {}", event, self.phase);
            return Transition::Ignored;
        }

        match event {
            TurnEvent::Status(text) => self.on_status(text),
            TurnEvent::Token(delta) => self.on_token(delta),
            TurnEvent::Update(raw) => self.on_update(raw),
            TurnEvent::Error(detail) => self.on_error(detail),
            TurnEvent::Interrupted(detail) => self.on_interrupted(detail),
            TurnEvent::Done => self.on_done(),
            TurnEvent::Turn(coords) => {
                self.coordinates = Some(coords.clone());
                Transition::applied()
            }
            TurnEvent::Activity(activity) => {
                self.event_log.record(activity);
                Transition::applied()
            }
            TurnEvent::Unknown { event, data } => {
                self.event_log.record_unknown(event, data);
                Transition::applied()
            }
        }
    }

    fn on_status(&mut self, text: &str) -> Transition {
        let text = text.trim();
        if text.is_empty() {
            return Transition::applied();
        }
        let keep_current = is_generic_status(text)
            && self.status_text.as_deref().is_some_and(|current| !is_generic_status(current));
        if !keep_current {
            self.status_text = Some(text.to_string());
            self.event_log.record_status(text);
        }
        Transition::applied()
    }

    fn on_token(&mut self, delta: &str) -> Transition {
        self.response.push_str(delta);
        if self.phase.rank() < TurnPhase::Responding.rank() {
            self.phase = TurnPhase::Responding;
        }
        Transition::applied()
    }

    fn on_update(&mut self, raw: &str) -> Transition {
        let parsed = parse_update(raw);
        if parsed.strategy != ParseStrategy::Direct {
            debug!(target: "tether::turn", "Update for {} parsed via {:?}", self.target, parsed.strategy);
        }

        if self.response.is_empty() {
            if let Some(message) = &parsed.payload.agent_message {
                self.response = message.clone();
            }
        }

        let draft_changed = match parsed.payload.draft_directive() {
            DraftDirective::Install(mut draft) => {
                if draft.agent_message.is_none() && !self.response.is_empty() {
                    draft.agent_message = Some(self.response.clone());
                }
                self.draft = Some(draft);
                true
            }
            DraftDirective::Clear => self.draft.take().is_some(),
            DraftDirective::Keep => false,
        };

        self.update_received = true;
        Transition::Applied { draft_changed, finished: false }
    }

    fn on_error(&mut self, detail: &str) -> Transition {
        let detail = if detail.trim().is_empty() { "Turn failed" } else { detail.trim() };
        self.phase = TurnPhase::Error;
        self.error = Some(detail.to_string());
        self.status_text = Some("error".to_string());
        self.recovering = false;
        Transition::Applied { draft_changed: false, finished: true }
    }

    fn on_interrupted(&mut self, detail: &str) -> Transition {
        self.phase = TurnPhase::Interrupted;
        self.interrupted_detail = (!detail.trim().is_empty()).then(|| detail.trim().to_string());
        self.status_text = Some("interrupted".to_string());
        self.recovering = false;
        Transition::Applied { draft_changed: false, finished: true }
    }

    fn on_done(&mut self) -> Transition {
        self.phase = TurnPhase::Done;
        self.status_text = Some("done".to_string());
        self.recovering = false;
        Transition::Applied { draft_changed: false, finished: true }
    }

    /// The stream closed cleanly without a terminal frame.
    pub fn finish_stream(&mut self, turn_id: &str) -> Transition {
        if !self.is_current(turn_id) || self.is_terminal() {
            return Transition::Ignored;
        }
        if self.update_received || !self.response.is_empty() {
            self.on_done()
        } else {
            self.on_error(STREAM_ENDED_EARLY)
        }
    }

    /// The transport failed mid-turn.
    pub fn fail_transport(&mut self, turn_id: &str, message: &str) -> Transition {
        if !self.is_current(turn_id) || self.is_terminal() {
            return Transition::Ignored;
        }
        self.on_error(message)
    }

    /// Mark the turn interrupted locally (user cancel).
    pub fn interrupt(&mut self, turn_id: &str) -> Transition {
        self.apply(turn_id, &TurnEvent::Interrupted(String::new()))
    }

    /// Apply a final result reported by `queryActiveTurn`.
    ///
    /// Non-terminal results are ignored; terminal ones go through the same
    /// handlers as the live stream.
    pub fn apply_result(&mut self, turn_id: &str, result: &TurnResult) -> Transition {
        if !self.is_current(turn_id) || self.is_terminal() || !result.status.is_terminal() {
            return Transition::Ignored;
        }

        let text = result.detail.clone().or_else(|| result.message.clone()).unwrap_or_default();
        match result.status {
            TurnStatus::Error => self.on_error(&text),
            TurnStatus::Interrupted => self.on_interrupted(&text),
            TurnStatus::Done => {
                let mut draft_changed = false;
                if let Some(update) = &result.update {
                    let raw = match update {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    draft_changed = self.on_update(&raw).draft_changed();
                }
                if self.response.is_empty() {
                    if let Some(message) = &result.message {
                        self.response = message.clone();
                    }
                }
                self.on_done();
                Transition::Applied { draft_changed, finished: true }
            }
            TurnStatus::Queued | TurnStatus::Running => Transition::Ignored,
        }
    }
}

fn is_generic_status(text: &str) -> bool {
    let lowered = text.trim().trim_end_matches(['.', '…']).to_lowercase();
    GENERIC_STATUSES.contains(&lowered.as_str())
}
