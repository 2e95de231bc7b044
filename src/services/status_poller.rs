//! Client-facing bounded polling loop.
//!
//! Reads stored status on a fixed cadence until the request is terminal or the attempt
//! ceiling is reached, then asks the provider once directly. A request that is still
//! pending after that is handed to the delayed resolution queue and reported as
//! delayed, never as failed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::payments::taxonomy::ErrorClassification;
use crate::services::payment_orchestrator::{
    DeferredResolution, OrchestratorError, OrchestratorResult, PaymentOrchestrator,
    PaymentRequestView, ResolutionKind, ResolutionResult,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_attempts: 30,
        }
    }
}

impl PollerConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.interval = Duration::from_secs(
            std::env::var("POLL_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(cfg.interval.as_secs()),
        );
        cfg.max_attempts = std::env::var("POLL_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(cfg.max_attempts);
        cfg
    }
}

// ---------------------------------------------------------------------------
// State, time and status seams
// ---------------------------------------------------------------------------

/// Where the loop is; handed to every status read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollState {
    pub attempt: u32,
    pub elapsed: Duration,
}

/// Source of poll ticks. Each tick reports how much time passed since the last one.
#[async_trait]
pub trait Ticker: Send {
    async fn tick(&mut self) -> Duration;
}

/// Real-time ticker; the first tick fires one full interval after creation.
pub struct TokioTicker {
    interval: Interval,
    period: Duration,
}

impl TokioTicker {
    pub fn new(period: Duration) -> Self {
        let start = tokio::time::Instant::now() + period;
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval, period }
    }
}

#[async_trait]
impl Ticker for TokioTicker {
    async fn tick(&mut self) -> Duration {
        self.interval.tick().await;
        self.period
    }
}

/// What the poller needs from the payment engine.
#[async_trait]
pub trait PaymentStatusSource: Send + Sync {
    async fn read_status(&self, id: Uuid, state: PollState) -> OrchestratorResult<PaymentRequestView>;

    async fn refresh(&self, id: Uuid) -> OrchestratorResult<ResolutionResult>;

    async fn defer(&self, id: Uuid) -> OrchestratorResult<DeferredResolution>;
}

#[async_trait]
impl PaymentStatusSource for PaymentOrchestrator {
    async fn read_status(&self, id: Uuid, state: PollState) -> OrchestratorResult<PaymentRequestView> {
        debug!(
            payment_request_id = %id,
            attempt = state.attempt,
            elapsed_ms = state.elapsed.as_millis() as u64,
            "polling payment status"
        );
        self.get_status(id).await
    }

    async fn refresh(&self, id: Uuid) -> OrchestratorResult<ResolutionResult> {
        self.refresh_from_gateway(id).await
    }

    async fn defer(&self, id: Uuid) -> OrchestratorResult<DeferredResolution> {
        self.defer_resolution(id).await
    }
}

#[async_trait]
impl<S: PaymentStatusSource + ?Sized> PaymentStatusSource for Arc<S> {
    async fn read_status(&self, id: Uuid, state: PollState) -> OrchestratorResult<PaymentRequestView> {
        (**self).read_status(id, state).await
    }

    async fn refresh(&self, id: Uuid) -> OrchestratorResult<ResolutionResult> {
        (**self).refresh(id).await
    }

    async fn defer(&self, id: Uuid) -> OrchestratorResult<DeferredResolution> {
        (**self).defer(id).await
    }
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum PollOutcome {
    /// The request reached a terminal status.
    Resolved {
        view: PaymentRequestView,
        state: PollState,
    },
    /// Still pending after the direct refresh; the background queue owns it now.
    Delayed {
        view: PaymentRequestView,
        classification: ErrorClassification,
        next_attempt_at: DateTime<Utc>,
        state: PollState,
    },
    /// The caller stopped watching. The request itself is untouched.
    Cancelled { state: PollState },
}

pub struct StatusPoller<S, T> {
    source: S,
    ticker: T,
    config: PollerConfig,
}

impl<S: PaymentStatusSource> StatusPoller<S, TokioTicker> {
    pub fn new(source: S, config: PollerConfig) -> Self {
        let ticker = TokioTicker::new(config.interval);
        Self::with_ticker(source, ticker, config)
    }
}

impl<S: PaymentStatusSource, T: Ticker> StatusPoller<S, T> {
    pub fn with_ticker(source: S, ticker: T, config: PollerConfig) -> Self {
        Self {
            source,
            ticker,
            config,
        }
    }

    pub async fn poll(
        mut self,
        payment_request_id: Uuid,
        mut cancel: watch::Receiver<bool>,
    ) -> OrchestratorResult<PollOutcome> {
        let mut state = PollState::default();

        while state.attempt < self.config.max_attempts {
            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => {
                    info!(payment_request_id = %payment_request_id, attempt = state.attempt, "status polling cancelled");
                    return Ok(PollOutcome::Cancelled { state });
                }
                elapsed = self.ticker.tick() => {
                    state.elapsed += elapsed;
                }
            }
            state.attempt += 1;

            match self.source.read_status(payment_request_id, state).await {
                Ok(view) if view.status.is_terminal() => {
                    return Ok(PollOutcome::Resolved { view, state });
                }
                Ok(_) => {}
                Err(e @ OrchestratorError::NotFound { .. }) => return Err(e),
                Err(e) => {
                    warn!(
                        payment_request_id = %payment_request_id,
                        attempt = state.attempt,
                        error = %e,
                        "status read failed, continuing to poll"
                    );
                }
            }
        }

        if *cancel.borrow() {
            return Ok(PollOutcome::Cancelled { state });
        }

        info!(
            payment_request_id = %payment_request_id,
            attempts = state.attempt,
            elapsed_secs = state.elapsed.as_secs(),
            "polling ceiling reached, querying provider directly"
        );

        let refreshed = self.source.refresh(payment_request_id).await?;
        match refreshed.kind {
            ResolutionKind::Applied | ResolutionKind::AlreadyResolved
                if refreshed.request.is_terminal() =>
            {
                Ok(PollOutcome::Resolved {
                    view: PaymentRequestView::from(&refreshed.request),
                    state,
                })
            }
            _ => match self.source.defer(payment_request_id).await {
                Ok(deferred) => Ok(PollOutcome::Delayed {
                    view: PaymentRequestView::from(&deferred.request),
                    classification: deferred.classification,
                    next_attempt_at: deferred.job.next_attempt_at,
                    state,
                }),
                // A callback resolved the request after the refresh.
                Err(OrchestratorError::NotPending { status, .. }) => {
                    debug!(
                        payment_request_id = %payment_request_id,
                        status = %status,
                        "request resolved while being deferred"
                    );
                    let view = self.source.read_status(payment_request_id, state).await?;
                    Ok(PollOutcome::Resolved { view, state })
                }
                Err(e) => Err(e),
            },
        }
    }
}

/// Resolves once the flag is set. A dropped sender means nobody can cancel any more.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::payment_request_repository::PaymentRequest;
    use crate::database::resolution_job_repository::ResolutionJob;
    use crate::payments::taxonomy;
    use crate::payments::types::PaymentStatus;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct InstantTicker {
        step: Duration,
    }

    #[async_trait]
    impl Ticker for InstantTicker {
        async fn tick(&mut self) -> Duration {
            tokio::task::yield_now().await;
            self.step
        }
    }

    fn request(status: PaymentStatus) -> PaymentRequest {
        let now = Utc::now();
        PaymentRequest {
            id: Uuid::nil(),
            idempotency_key: "key".to_string(),
            user_id: Uuid::nil(),
            wallet_id: Uuid::nil(),
            payment_type: "daily".to_string(),
            amount: 87,
            phone: "254712345678".to_string(),
            days_count: 1,
            checkout_request_id: "ws_CO_1".to_string(),
            merchant_request_id: "m-1".to_string(),
            status: status.to_db_status().to_string(),
            result_code: None,
            result_desc: None,
            mpesa_receipt_number: (status == PaymentStatus::Completed)
                .then(|| "ABC123".to_string()),
            callback_received_at: None,
            resolution_source: None,
            resolved_at: None,
            needs_reconciliation: false,
            reconciliation_reason: None,
            ledger_applied_at: None,
            created_at: now,
            updated_at: now,
            expires_at: now,
        }
    }

    /// Reports pending until `resolve_on_read`, then completed.
    struct ScriptedSource {
        reads: AtomicU32,
        resolve_on_read: Option<u32>,
        refresh_status: PaymentStatus,
        states: Mutex<Vec<PollState>>,
        deferred: AtomicU32,
        /// `defer` finds the request already completed.
        resolved_before_defer: bool,
    }

    impl ScriptedSource {
        fn new(resolve_on_read: Option<u32>, refresh_status: PaymentStatus) -> Self {
            Self {
                reads: AtomicU32::new(0),
                resolve_on_read,
                refresh_status,
                states: Mutex::new(Vec::new()),
                deferred: AtomicU32::new(0),
                resolved_before_defer: false,
            }
        }
    }

    #[async_trait]
    impl PaymentStatusSource for ScriptedSource {
        async fn read_status(&self, _id: Uuid, state: PollState) -> OrchestratorResult<PaymentRequestView> {
            self.states.lock().unwrap().push(state);
            let n = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
            let status = match self.resolve_on_read {
                Some(at) if n >= at => PaymentStatus::Completed,
                _ => PaymentStatus::Pending,
            };
            Ok(PaymentRequestView::from(&request(status)))
        }

        async fn refresh(&self, _id: Uuid) -> OrchestratorResult<ResolutionResult> {
            let kind = if self.refresh_status.is_terminal() {
                ResolutionKind::Applied
            } else {
                ResolutionKind::StillPending
            };
            Ok(ResolutionResult {
                request: request(self.refresh_status),
                kind,
                classification: None,
            })
        }

        async fn defer(&self, id: Uuid) -> OrchestratorResult<DeferredResolution> {
            self.deferred.fetch_add(1, Ordering::SeqCst);
            if self.resolved_before_defer {
                return Err(OrchestratorError::NotPending {
                    id,
                    status: PaymentStatus::Completed,
                });
            }
            let now = Utc::now();
            Ok(DeferredResolution {
                request: request(PaymentStatus::Pending),
                job: ResolutionJob {
                    id: Uuid::new_v4(),
                    payment_request_id: Uuid::nil(),
                    attempts: 0,
                    max_attempts: 5,
                    next_attempt_at: now + chrono::Duration::seconds(30),
                    locked_until: None,
                    last_error: None,
                    created_at: now,
                    updated_at: now,
                },
                classification: taxonomy::timeout(),
            })
        }
    }

    fn poller(
        source: &Arc<ScriptedSource>,
        max_attempts: u32,
    ) -> StatusPoller<Arc<ScriptedSource>, InstantTicker> {
        StatusPoller::with_ticker(
            source.clone(),
            InstantTicker {
                step: Duration::from_secs(2),
            },
            PollerConfig {
                interval: Duration::from_secs(2),
                max_attempts,
            },
        )
    }

    #[tokio::test]
    async fn stops_as_soon_as_status_is_terminal() {
        let source = Arc::new(ScriptedSource::new(Some(3), PaymentStatus::Pending));
        let (_tx, rx) = watch::channel(false);

        let outcome = poller(&source, 30).poll(Uuid::nil(), rx).await.unwrap();

        match outcome {
            PollOutcome::Resolved { view, state } => {
                assert_eq!(view.status, PaymentStatus::Completed);
                assert_eq!(state.attempt, 3);
                assert_eq!(state.elapsed, Duration::from_secs(6));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(source.deferred.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn passes_explicit_state_to_every_read() {
        let source = Arc::new(ScriptedSource::new(None, PaymentStatus::Pending));
        let (_tx, rx) = watch::channel(false);

        poller(&source, 4).poll(Uuid::nil(), rx).await.unwrap();

        let states = source.states.lock().unwrap().clone();
        let attempts: Vec<u32> = states.iter().map(|s| s.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3, 4]);
        assert_eq!(states[3].elapsed, Duration::from_secs(8));
    }

    #[tokio::test]
    async fn ceiling_refresh_can_still_resolve() {
        let source = Arc::new(ScriptedSource::new(None, PaymentStatus::Completed));
        let (_tx, rx) = watch::channel(false);

        let outcome = poller(&source, 30).poll(Uuid::nil(), rx).await.unwrap();

        assert!(matches!(outcome, PollOutcome::Resolved { state, .. } if state.attempt == 30));
        assert_eq!(source.deferred.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn still_pending_after_refresh_is_delayed_not_failed() {
        let source = Arc::new(ScriptedSource::new(None, PaymentStatus::Pending));
        let (_tx, rx) = watch::channel(false);

        let outcome = poller(&source, 30).poll(Uuid::nil(), rx).await.unwrap();

        match outcome {
            PollOutcome::Delayed {
                view,
                classification,
                state,
                ..
            } => {
                assert_eq!(view.status, PaymentStatus::Pending);
                assert!(classification.is_timeout);
                assert_eq!(state.elapsed, Duration::from_secs(60));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(source.deferred.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn callback_landing_before_defer_is_reported_resolved() {
        // Reads 1..=4 are pending; the read after the failed defer sees COMPLETED.
        let source = Arc::new(ScriptedSource {
            resolved_before_defer: true,
            ..ScriptedSource::new(Some(5), PaymentStatus::Pending)
        });
        let (_tx, rx) = watch::channel(false);

        let outcome = poller(&source, 4).poll(Uuid::nil(), rx).await.unwrap();

        match outcome {
            PollOutcome::Resolved { view, state } => {
                assert_eq!(view.status, PaymentStatus::Completed);
                assert_eq!(state.attempt, 4);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(source.deferred.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_stops_only_the_loop() {
        let source = Arc::new(ScriptedSource::new(None, PaymentStatus::Completed));
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let outcome = poller(&source, 30).poll(Uuid::nil(), rx).await.unwrap();

        assert!(matches!(outcome, PollOutcome::Cancelled { state } if state.attempt == 0));
        assert_eq!(source.deferred.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dropped_cancel_sender_does_not_cancel() {
        let source = Arc::new(ScriptedSource::new(Some(2), PaymentStatus::Pending));
        let (tx, rx) = watch::channel(false);
        drop(tx);

        let outcome = poller(&source, 30).poll(Uuid::nil(), rx).await.unwrap();
        assert!(matches!(outcome, PollOutcome::Resolved { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_ticker_waits_a_full_period_first() {
        let mut ticker = TokioTicker::new(Duration::from_secs(2));
        let start = tokio::time::Instant::now();
        assert_eq!(ticker.tick().await, Duration::from_secs(2));
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }
}
