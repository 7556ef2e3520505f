use super::frame::FrameOrigin;
use super::region::Region;
use super::ticket::Ticket;
use crate::submission::Outcome;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Scanning,
    Submitting,
    LoggedIn,
    Failed,
    Cancelled,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::LoggedIn | PipelineState::Failed | PipelineState::Cancelled
        )
    }
}

/// Shared pipeline state. Terminal states stick until the cell is recreated.
#[derive(Clone)]
pub struct StateCell {
    tx: watch::Sender<PipelineState>,
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(PipelineState::Idle);
        Self { tx }
    }

    pub fn get(&self) -> PipelineState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.tx.subscribe()
    }

    /// Moves to `next` unless the current state is terminal. Returns whether it moved.
    pub fn transition(&self, next: PipelineState) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                return false;
            }
            tracing::debug!("Pipeline state {:?} -> {:?}", current, next);
            *current = next;
            true
        })
    }

    /// A confirmed login outranks a failure or cancellation recorded while
    /// the submission was still in flight.
    pub fn mark_logged_in(&self) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == PipelineState::LoggedIn {
                return false;
            }
            tracing::debug!("Pipeline state {:?} -> LoggedIn", current);
            *current = PipelineState::LoggedIn;
            true
        })
    }

    /// Like [`StateCell::transition`] but only from `from`.
    pub fn transition_from(&self, from: PipelineState, next: PipelineState) -> bool {
        self.tx.send_if_modified(|current| {
            if *current != from || from == next {
                return false;
            }
            tracing::debug!("Pipeline state {:?} -> {:?}", current, next);
            *current = next;
            true
        })
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Notifications for whoever drives the pipeline.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    ScanStarted {
        source: String,
    },
    CodeFound {
        ticket: Ticket,
        origin: FrameOrigin,
        region: Region,
        decoder: &'static str,
        latency: Duration,
    },
    SubmissionStarted {
        ticket: Ticket,
    },
    SubmissionFinished {
        ticket: Ticket,
        outcome: Outcome,
    },
    LoggedIn {
        ticket: Ticket,
    },
    /// Why scanning stopped.
    CaptureFailed {
        reason: String,
    },
    /// Why a code didn't work.
    SubmissionFailed {
        ticket: Ticket,
        outcome: Outcome,
    },
    ModelUnavailable {
        reason: String,
    },
    Cancelled,
}

/// Broadcast sender that ignores the no-subscriber case.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_stick() {
        let state = StateCell::new();
        assert!(state.transition(PipelineState::Scanning));
        assert!(state.transition(PipelineState::LoggedIn));
        assert!(!state.transition(PipelineState::Cancelled));
        assert!(!state.transition(PipelineState::Scanning));
        assert_eq!(state.get(), PipelineState::LoggedIn);
    }

    #[test]
    fn login_overrides_failure_and_cancellation() {
        for stopped in [PipelineState::Failed, PipelineState::Cancelled] {
            let state = StateCell::new();
            state.transition(PipelineState::Scanning);
            state.transition(stopped);
            assert!(state.mark_logged_in());
            assert_eq!(state.get(), PipelineState::LoggedIn);
            assert!(!state.mark_logged_in());
            assert!(!state.transition(PipelineState::Failed));
        }
    }

    #[test]
    fn conditional_transition() {
        let state = StateCell::new();
        state.transition(PipelineState::Scanning);
        assert!(!state.transition_from(PipelineState::Submitting, PipelineState::Scanning));
        assert!(state.transition_from(PipelineState::Scanning, PipelineState::Submitting));
        assert_eq!(state.get(), PipelineState::Submitting);
    }

    #[tokio::test]
    async fn subscribers_see_changes() {
        let state = StateCell::new();
        let mut rx = state.subscribe();
        state.transition(PipelineState::Scanning);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), PipelineState::Scanning);
    }
}
