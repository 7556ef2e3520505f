use super::{
    BoxError, Credentials, InstrumentLayer, LoginRequest, LoginResponse, Outcome, SteppedBackoff,
};
use crate::common::{EventBus, PipelineEvent, PipelineState, StateCell, Ticket};
use crate::config::Settings;
use crate::pipeline::metrics::{PerformanceMonitor, Phase};
use indexmap::IndexMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower::util::BoxCloneService;
use tower::{Service, ServiceBuilder, ServiceExt};

type LoginService = BoxCloneService<LoginRequest, LoginResponse, BoxError>;

enum Entry {
    InFlight(watch::Receiver<Option<Outcome>>),
    Done(Outcome),
}

enum Role {
    Leader(watch::Sender<Option<Outcome>>),
    Follower(watch::Receiver<Option<Outcome>>),
    Known(Outcome),
}

/// Submits each ticket at most once, however many workers decode it.
///
/// The first caller for a ticket becomes its leader and talks to the
/// endpoint; concurrent callers wait for the leader's outcome, and later
/// callers get the recorded outcome back without any network traffic.
pub struct SubmissionCoordinator {
    table: Mutex<IndexMap<Ticket, Entry>>,
    service: Mutex<LoginService>,
    credentials: Arc<Credentials>,
    auto_login: bool,
    auto_retry: bool,
    max_attempts: u32,
    history_limit: usize,
    state: StateCell,
    events: EventBus,
    cancel: CancellationToken,
    metrics: Option<PerformanceMonitor>,
}

impl SubmissionCoordinator {
    /// Wraps `endpoint` in the retry, instrumentation and timeout layers.
    pub fn new<S>(
        endpoint: S,
        settings: &Settings,
        credentials: Credentials,
        state: StateCell,
        events: EventBus,
        cancel: CancellationToken,
    ) -> Self
    where
        S: Service<LoginRequest, Response = LoginResponse> + Clone + Send + 'static,
        S::Error: Into<BoxError>,
        S::Future: Send + 'static,
    {
        let policy = SteppedBackoff::from_settings(&settings.submission);
        let max_attempts = policy.max_attempts();
        let service = ServiceBuilder::new()
            .retry(policy)
            .layer(InstrumentLayer::new("login"))
            .timeout(settings.submission.attempt_timeout())
            .service(endpoint);

        Self {
            table: Mutex::new(IndexMap::new()),
            service: Mutex::new(BoxCloneService::new(service)),
            credentials: Arc::new(credentials),
            auto_login: settings.api.auto_login,
            auto_retry: settings.scan.auto_retry,
            max_attempts,
            history_limit: settings.submission.history_limit.max(1),
            state,
            events,
            cancel,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: PerformanceMonitor) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn lock_table(&self) -> MutexGuard<'_, IndexMap<Ticket, Entry>> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether `ticket` is in flight or has a recorded outcome.
    pub fn is_tracked(&self, ticket: &Ticket) -> bool {
        self.lock_table().contains_key(ticket)
    }

    pub fn outcome_of(&self, ticket: &Ticket) -> Option<Outcome> {
        match self.lock_table().get(ticket) {
            Some(Entry::Done(outcome)) => Some(outcome.clone()),
            _ => None,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.lock_table()
            .values()
            .filter(|e| matches!(e, Entry::InFlight(_)))
            .count()
    }

    pub async fn submit(&self, ticket: Ticket) -> Outcome {
        // Check-and-insert happens under one lock; that decides the leader.
        let role = {
            let mut table = self.lock_table();
            match table.get(&ticket) {
                Some(Entry::Done(outcome)) => Role::Known(outcome.clone()),
                Some(Entry::InFlight(rx)) => Role::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    table.insert(ticket.clone(), Entry::InFlight(rx));
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Known(outcome) => {
                tracing::debug!("Ticket {} already settled: {}", ticket.short(), outcome);
                outcome
            }
            Role::Follower(rx) => self.follow(&ticket, rx).await,
            Role::Leader(tx) => self.lead(ticket, tx).await,
        }
    }

    async fn follow(&self, ticket: &Ticket, mut rx: watch::Receiver<Option<Outcome>>) -> Outcome {
        tracing::debug!("Ticket {} already in flight, waiting", ticket.short());
        let settled = rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|outcome| outcome.clone());
        match settled {
            Some(outcome) => outcome,
            None => {
                // The leader went away without an answer.
                let mut table = self.lock_table();
                if matches!(table.get(ticket), Some(Entry::InFlight(rx)) if rx.has_changed().is_err())
                {
                    table.shift_remove(ticket);
                }
                Outcome::PermanentFailure {
                    attempts: 0,
                    reason: "submission abandoned".to_string(),
                }
            }
        }
    }

    async fn lead(&self, ticket: Ticket, tx: watch::Sender<Option<Outcome>>) -> Outcome {
        self.state
            .transition_from(PipelineState::Scanning, PipelineState::Submitting);
        self.events.emit(PipelineEvent::SubmissionStarted {
            ticket: ticket.clone(),
        });
        tracing::info!("Submitting ticket {}", ticket.short());

        let start = Instant::now();
        let outcome = self.attempt(&ticket).await;
        if let Some(metrics) = &self.metrics {
            metrics.record(Phase::Submit, start.elapsed());
        }

        let others_in_flight = {
            let mut table = self.lock_table();
            table.insert(ticket.clone(), Entry::Done(outcome.clone()));
            self.evict(&mut table);
            table.values().any(|e| matches!(e, Entry::InFlight(_)))
        };
        tx.send_replace(Some(outcome.clone()));

        self.settle(&ticket, &outcome, others_in_flight);
        outcome
    }

    async fn attempt(&self, ticket: &Ticket) -> Outcome {
        let request = LoginRequest {
            ticket: ticket.clone(),
            credentials: Arc::clone(&self.credentials),
            auto_login: self.auto_login,
            verify_code: String::new(),
        };
        let service = self
            .service
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        match service.oneshot(request).await {
            Ok(response) => Outcome::from(response),
            Err(e) => Outcome::PermanentFailure {
                attempts: self.max_attempts,
                reason: e.to_string(),
            },
        }
    }

    fn settle(&self, ticket: &Ticket, outcome: &Outcome, others_in_flight: bool) {
        self.events.emit(PipelineEvent::SubmissionFinished {
            ticket: ticket.clone(),
            outcome: outcome.clone(),
        });

        if outcome.is_success() {
            tracing::info!("Ticket {} logged in, stopping scan", ticket.short());
            self.state.mark_logged_in();
            self.events.emit(PipelineEvent::LoggedIn {
                ticket: ticket.clone(),
            });
            self.cancel.cancel();
            return;
        }

        tracing::warn!("Ticket {} failed: {}", ticket.short(), outcome);
        self.events.emit(PipelineEvent::SubmissionFailed {
            ticket: ticket.clone(),
            outcome: outcome.clone(),
        });
        if !self.auto_retry {
            tracing::error!("Auto retry is off, stopping scan");
            self.state.transition(PipelineState::Failed);
            self.cancel.cancel();
        } else if !others_in_flight {
            self.state
                .transition_from(PipelineState::Submitting, PipelineState::Scanning);
        }
    }

    /// Forgets the oldest settled tickets beyond the history limit.
    fn evict(&self, table: &mut IndexMap<Ticket, Entry>) {
        let settled = table
            .values()
            .filter(|e| matches!(e, Entry::Done(_)))
            .count();
        let mut excess = settled.saturating_sub(self.history_limit);
        if excess == 0 {
            return;
        }
        table.retain(|ticket, entry| {
            if excess > 0 && matches!(entry, Entry::Done(_)) {
                tracing::debug!("Forgetting settled ticket {}", ticket.short());
                excess -= 1;
                return false;
            }
            true
        });
    }
}
