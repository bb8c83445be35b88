//! Resume recovery for turns that were in flight when the previous session
//! went away.
//!
//! A recovery round polls `query_active_turn` until either a terminal
//! `lastResult` shows up (applied once through the state machine) or the
//! turn's live coordinates do (the live event channel is attached while
//! polling continues). If neither appears before the timeout the turn stays
//! in its recovering state and another round starts after a lazy delay.

use crate::events::TurnEvent;
use crate::session::{Inner, PendingPolicy, SessionEvent};
use std::sync::Arc;
use std::time::Duration;
use tether_types::{PendingTurn, TurnCoordinates};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// How long to look for coordinates or a result before backing off
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Delay before another round after a timeout
    pub lazy_retry: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(8),
            poll_interval: Duration::from_millis(250),
            lazy_retry: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    NothingPending,
    Started { turn_id: String },
    /// A recovery for the same turn is already running.
    InProgress { turn_id: String },
}

enum Round {
    /// The turn reached a terminal state or was superseded.
    Settled,
    TimedOut,
}

/// Aborts the attach task when the recovery that owns it goes away.
struct AttachTask(JoinHandle<()>);

impl Drop for AttachTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Inner {
    pub(crate) async fn run_recovery(self: Arc<Self>, pending: PendingTurn) {
        let mut round_number = 1u32;
        loop {
            match self.recovery_round(&pending).await {
                Round::Settled => {
                    debug!(target: "tether::recovery", "Recovery of {} settled", pending.turn_id);
                    return;
                }
                Round::TimedOut => {
                    let retry = self.config.recovery.lazy_retry;
                    info!(
                        target: "tether::recovery",
                        "Turn {} not found after round {}; retrying in {:?}",
                        pending.turn_id, round_number, retry
                    );
                    self.emit(SessionEvent::Notice {
                        target: pending.target.clone(),
                        message: format!("Still recovering; retrying in {}s", retry.as_secs()),
                    });
                    sleep(retry).await;
                    round_number += 1;
                }
            }
        }
    }

    async fn recovery_round(self: &Arc<Self>, pending: &PendingTurn) -> Round {
        let target = pending.target.as_str();
        let turn_id = pending.turn_id.as_str();
        let config = &self.config.recovery;

        let deadline = Instant::now() + config.timeout;
        let mut ticker = interval(config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut attached: Option<AttachTask> = None;

        loop {
            ticker.tick().await;

            if self.is_settled(target, turn_id).await {
                return Round::Settled;
            }

            match self.backend.query_active_turn(turn_id).await {
                Ok(status) => {
                    if let Some(result) = status.last_result.filter(|r| r.status.is_terminal()) {
                        info!(target: "tether::recovery", "Applying final result for {}: {:?}", turn_id, result.status);
                        self.apply_result(target, turn_id, &result).await;
                        return Round::Settled;
                    }
                    if attached.is_none() {
                        if let Some(coordinates) = status.current {
                            attached = Some(self.spawn_attach(pending, coordinates));
                        }
                    }
                }
                Err(e) => {
                    debug!(target: "tether::recovery", "Query for {} failed: {}", turn_id, e);
                }
            }

            if self.is_settled(target, turn_id).await {
                return Round::Settled;
            }

            // An attach that ended without settling the turn may be retried.
            if attached.as_ref().is_some_and(|task| task.0.is_finished()) {
                attached = None;
            }

            // Attached turns may run for minutes; keep polling for the result.
            if attached.is_none() && Instant::now() >= deadline {
                return Round::TimedOut;
            }
        }
    }

    fn spawn_attach(self: &Arc<Self>, pending: &PendingTurn, coordinates: TurnCoordinates) -> AttachTask {
        info!(
            target: "tether::recovery",
            "Attaching to live turn {} on thread {}", coordinates.turn_id, coordinates.thread_id
        );
        let inner = self.clone();
        let target = pending.target.clone();
        let turn_id = pending.turn_id.clone();

        AttachTask(tokio::spawn(async move {
            inner
                .transition(&target, &turn_id, PendingPolicy::Keep, |state| {
                    state.apply(&turn_id, &TurnEvent::Turn(coordinates.clone()))
                })
                .await;

            let stream = match inner.backend.attach_turn_events(&coordinates).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(target: "tether::recovery", "Attach to {} failed: {}", coordinates.turn_id, e);
                    return;
                }
            };
            match inner.consume(&target, &turn_id, stream).await {
                Ok(true) => debug!(target: "tether::recovery", "Live stream settled {}", turn_id),
                // The result poll owns finalization when the live channel just ends.
                Ok(false) => debug!(target: "tether::recovery", "Live stream for {} ended", turn_id),
                Err(e) => warn!(target: "tether::recovery", "Live stream for {} failed: {}", turn_id, e),
            }
        }))
    }
}
