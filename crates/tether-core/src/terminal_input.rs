//! Acknowledgement-tracked delivery of composed terminal input.
//!
//! At most one input is outstanding. It is written to the durable store before
//! any send attempt and cleared only by a matching positive ack, by being
//! superseded by newer input, or when the user edits the composer away from
//! it.

use crate::records::{self, COMPOSER_DRAFT_KEY, PENDING_INPUT_KEY};
use crate::session::now_ms;
use crate::store::DurableStore;
use crate::{Result, TetherError};
use std::sync::Arc;
use std::time::Duration;
use tether_types::PendingInput;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_RETRY_MIN_INTERVAL: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// Positive ack for the outstanding input.
    Delivered { id: String, cleared_composer: bool },
    /// Negative ack; the input stays pending for a retry.
    Rejected { id: String, message: String },
    /// Ack for an input that is no longer outstanding.
    Unmatched,
}

pub struct InputTracker {
    store: Arc<dyn DurableStore>,
    pending: Option<PendingInput>,
    composer: String,
    retry_min_interval: Duration,
    last_attempt: Option<Instant>,
    /// Connection generation the pending input was last sent on
    sent_generation: Option<u64>,
    /// The server refused the pending input; only a manual retry resends it
    rejected: bool,
}

impl InputTracker {
    /// Restore pending input and composer text from the store.
    pub fn load(store: Arc<dyn DurableStore>, retry_min_interval: Duration) -> Self {
        let pending = records::load_pending_input(store.as_ref());
        let composer = records::load_composer(store.as_ref());
        if let Some(input) = &pending {
            debug!(target: "tether::terminal", "Restored pending input {}", input.id);
        }
        Self {
            store,
            pending,
            composer,
            retry_min_interval,
            last_attempt: None,
            sent_generation: None,
            rejected: false,
        }
    }

    pub fn pending(&self) -> Option<&PendingInput> {
        self.pending.as_ref()
    }

    pub fn composer(&self) -> &str {
        &self.composer
    }

    /// Wrap composed text as a new outstanding input, superseding any older one.
    ///
    /// The record is durable when this returns.
    pub fn compose(&mut self, text: &str) -> Result<PendingInput> {
        let input = PendingInput {
            id: Uuid::new_v4().to_string(),
            payload: format!("{}\n", text),
            original_text: text.to_string(),
            sent_at: now_ms(),
            last_retry_at: None,
        };
        if let Some(previous) = &self.pending {
            debug!(target: "tether::terminal", "Input {} superseded by {}", previous.id, input.id);
        }
        records::save(self.store.as_ref(), PENDING_INPUT_KEY, &input)?;
        self.pending = Some(input.clone());
        self.sent_generation = None;
        self.rejected = false;
        self.set_composer(text);
        Ok(input)
    }

    /// Record that the outstanding input was written to connection `generation`.
    pub fn mark_sent(&mut self, generation: u64) {
        self.sent_generation = Some(generation);
        self.last_attempt = Some(Instant::now());
    }

    /// The outstanding input, if it has not been sent on `generation` yet and
    /// was not refused by the server.
    pub fn take_replay(&mut self, generation: u64) -> Option<PendingInput> {
        if self.rejected || self.sent_generation == Some(generation) {
            return None;
        }
        self.pending.clone()
    }

    pub fn on_ack(&mut self, id: &str, ok: bool, message: Option<String>) -> AckOutcome {
        let Some(pending) = self.pending.as_ref().filter(|p| p.id == id) else {
            debug!(target: "tether::terminal", "Ignoring ack for unknown input {}", id);
            return AckOutcome::Unmatched;
        };

        if !ok {
            self.rejected = true;
            return AckOutcome::Rejected {
                id: id.to_string(),
                message: message.unwrap_or_else(|| "Input rejected".to_string()),
            };
        }

        let cleared_composer = self.composer == pending.original_text;
        self.pending = None;
        self.sent_generation = None;
        self.rejected = false;
        if let Err(e) = records::clear(self.store.as_ref(), PENDING_INPUT_KEY) {
            warn!(target: "tether::store", "Failed to clear pending input: {}", e);
        }
        if cleared_composer {
            self.set_composer("");
        }
        AckOutcome::Delivered {
            id: id.to_string(),
            cleared_composer,
        }
    }

    /// Update the composer text. Returns the pending input if the edit made it
    /// stale and it was discarded.
    pub fn edit_composer(&mut self, text: &str) -> Option<PendingInput> {
        self.set_composer(text);
        let stale = self.pending.as_ref().is_some_and(|p| p.original_text != text);
        if !stale {
            return None;
        }
        let discarded = self.pending.take();
        self.sent_generation = None;
        self.rejected = false;
        if let Err(e) = records::clear(self.store.as_ref(), PENDING_INPUT_KEY) {
            warn!(target: "tether::store", "Failed to clear pending input: {}", e);
        }
        discarded
    }

    /// Prepare a manual retry of the outstanding input.
    pub fn begin_retry(&mut self) -> Result<PendingInput> {
        let now = Instant::now();
        if let Some(last) = self.last_attempt {
            let elapsed = now.duration_since(last);
            if elapsed < self.retry_min_interval {
                let wait = self.retry_min_interval - elapsed;
                return Err(TetherError::RetryTooSoon(wait.as_millis() as u64));
            }
        }

        let pending = self.pending.as_mut().ok_or(TetherError::NoPendingInput)?;
        pending.last_retry_at = Some(now_ms());
        let input = pending.clone();
        records::save(self.store.as_ref(), PENDING_INPUT_KEY, &input)?;
        self.last_attempt = Some(now);
        self.rejected = false;
        Ok(input)
    }

    fn set_composer(&mut self, text: &str) {
        self.composer = text.to_string();
        if let Err(e) = records::save(self.store.as_ref(), COMPOSER_DRAFT_KEY, &self.composer) {
            warn!(target: "tether::store", "Failed to persist composer: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn tracker(store: &Arc<MemoryStore>) -> InputTracker {
        InputTracker::load(store.clone(), DEFAULT_RETRY_MIN_INTERVAL)
    }

    #[test]
    fn test_compose_persists_before_send() {
        let store = Arc::new(MemoryStore::new());
        let mut inputs = tracker(&store);
        let input = inputs.compose("ls -la").unwrap();
        assert_eq!(input.payload, "ls -la\n");

        let restored = tracker(&store);
        assert_eq!(restored.pending().unwrap().id, input.id);
        assert_eq!(restored.composer(), "ls -la");
    }

    #[test]
    fn test_positive_ack_clears_unchanged_composer() {
        let store = Arc::new(MemoryStore::new());
        let mut inputs = tracker(&store);
        let input = inputs.compose("ls").unwrap();
        let outcome = inputs.on_ack(&input.id, true, None);
        assert_eq!(outcome, AckOutcome::Delivered { id: input.id, cleared_composer: true });
        assert!(inputs.pending().is_none());
        assert_eq!(inputs.composer(), "");
        assert!(records::load_pending_input(store.as_ref()).is_none());
    }

    #[test]
    fn test_negative_ack_keeps_pending() {
        let store = Arc::new(MemoryStore::new());
        let mut inputs = tracker(&store);
        let input = inputs.compose("ls").unwrap();
        let outcome = inputs.on_ack(&input.id, false, Some("busy".into()));
        assert_eq!(outcome, AckOutcome::Rejected { id: input.id.clone(), message: "busy".into() });
        assert_eq!(inputs.pending().unwrap().id, input.id);
        assert_eq!(inputs.composer(), "ls");
    }

    #[test]
    fn test_unmatched_ack_ignored() {
        let store = Arc::new(MemoryStore::new());
        let mut inputs = tracker(&store);
        let first = inputs.compose("one").unwrap();
        inputs.compose("two").unwrap();
        assert_eq!(inputs.on_ack(&first.id, true, None), AckOutcome::Unmatched);
        assert!(inputs.pending().is_some());
    }

    #[test]
    fn test_edit_discards_stale_pending() {
        let store = Arc::new(MemoryStore::new());
        let mut inputs = tracker(&store);
        inputs.compose("ls").unwrap();
        assert!(inputs.edit_composer("ls").is_none());
        let discarded = inputs.edit_composer("pwd").unwrap();
        assert_eq!(discarded.original_text, "ls");
        assert!(inputs.pending().is_none());
        assert!(records::load_pending_input(store.as_ref()).is_none());
    }

    #[test]
    fn test_replay_once_per_generation() {
        let store = Arc::new(MemoryStore::new());
        let mut inputs = tracker(&store);
        inputs.compose("ls").unwrap();
        inputs.mark_sent(1);
        assert!(inputs.take_replay(1).is_none());
        assert!(inputs.take_replay(2).is_some());
        inputs.mark_sent(2);
        assert!(inputs.take_replay(2).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_input_not_replayed_until_retried() {
        let store = Arc::new(MemoryStore::new());
        let mut inputs = tracker(&store);
        let input = inputs.compose("make").unwrap();
        inputs.mark_sent(1);
        inputs.on_ack(&input.id, false, None);
        assert!(inputs.take_replay(2).is_none());

        tokio::time::advance(DEFAULT_RETRY_MIN_INTERVAL).await;
        inputs.begin_retry().unwrap();
        inputs.mark_sent(2);
        // Dropped before the retry was acked.
        assert_eq!(inputs.take_replay(3).unwrap().id, input.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_rate_limited() {
        let store = Arc::new(MemoryStore::new());
        let mut inputs = tracker(&store);
        assert!(matches!(inputs.begin_retry(), Err(TetherError::NoPendingInput)));

        inputs.compose("ls").unwrap();
        inputs.mark_sent(1);
        assert!(matches!(inputs.begin_retry(), Err(TetherError::RetryTooSoon(1500))));

        tokio::time::advance(Duration::from_millis(1500)).await;
        let retried = inputs.begin_retry().unwrap();
        assert!(retried.last_retry_at.is_some());
        assert!(matches!(inputs.begin_retry(), Err(TetherError::RetryTooSoon(_))));
    }
}
