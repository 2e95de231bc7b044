use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::database::error::DatabaseError;
use crate::database::payment_request_repository::PaymentRequestStore;
use crate::database::resolution_job_repository::{ResolutionJob, ResolutionJobStore};
use crate::payments::types::{PaymentStatus, ResolutionSource};
use crate::services::payment_orchestrator::{
    OrchestratorError, OrchestratorResult, PaymentOrchestrator, ResolutionKind,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures inside one worker cycle. They are logged by `run`, never propagated.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DelayedResolutionConfig {
    /// Wait before attempt n+1 is `backoff[n]`; its length is the attempt budget.
    pub backoff: Vec<Duration>,
    /// How often the worker wakes up to claim due jobs.
    pub poll_interval: Duration,
    pub batch_size: i64,
    /// Jobs processed at the same time inside one worker.
    pub concurrency: usize,
    /// How long a claimed job stays invisible to other workers.
    pub lease: Duration,
    /// Pending requests this long past `expires_at` with no callback are queued even if
    /// no client deferred them.
    pub stale_grace: Duration,
}

impl Default for DelayedResolutionConfig {
    fn default() -> Self {
        Self {
            backoff: [30, 60, 120, 240, 480]
                .into_iter()
                .map(Duration::from_secs)
                .collect(),
            poll_interval: Duration::from_secs(5),
            batch_size: 50,
            concurrency: 8,
            lease: Duration::from_secs(60),
            stale_grace: Duration::from_secs(60),
        }
    }
}

impl DelayedResolutionConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(backoff) = std::env::var("RESOLUTION_BACKOFF_SECS")
            .ok()
            .and_then(|v| parse_backoff(&v))
        {
            cfg.backoff = backoff;
        }
        cfg.poll_interval = Duration::from_secs(
            std::env::var("RESOLUTION_POLL_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(cfg.poll_interval.as_secs()),
        );
        cfg.batch_size = std::env::var("RESOLUTION_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(cfg.batch_size);
        cfg.concurrency = std::env::var("RESOLUTION_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(cfg.concurrency);
        cfg.lease = Duration::from_secs(
            std::env::var("RESOLUTION_LEASE_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.lease.as_secs()),
        );
        cfg.stale_grace = Duration::from_secs(
            std::env::var("RESOLUTION_STALE_GRACE_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.stale_grace.as_secs()),
        );
        cfg
    }

    /// Stretch the lease so it outlives the slowest batch: every claimed job may
    /// wait for `ceil(batch_size / concurrency)` refreshes of `refresh_budget`.
    /// Otherwise another instance re-claims a job that is still running.
    pub fn covering_refresh(mut self, refresh_budget: Duration) -> Self {
        let rounds = (self.batch_size.max(1) as u64).div_ceil(self.concurrency.max(1) as u64);
        let required = refresh_budget * rounds as u32 + LEASE_MARGIN;
        if self.lease < required {
            warn!(
                configured_secs = self.lease.as_secs(),
                required_secs = required.as_secs(),
                "resolution lease shorter than the slowest batch, raising it"
            );
            self.lease = required;
        }
        self
    }

    pub fn max_attempts(&self) -> i32 {
        self.backoff.len() as i32
    }

    pub fn first_delay(&self) -> Duration {
        self.backoff.first().copied().unwrap_or_default()
    }

    /// Wait after `attempts` finished attempts.
    pub fn delay_after(&self, attempts: i32) -> Duration {
        self.backoff
            .get(attempts.max(0) as usize)
            .or(self.backoff.last())
            .copied()
            .unwrap_or_default()
    }
}

const LEASE_MARGIN: Duration = Duration::from_secs(30);

fn parse_backoff(raw: &str) -> Option<Vec<Duration>> {
    let parsed: Option<Vec<Duration>> = raw
        .split(',')
        .map(|part| part.trim().parse::<u64>().ok().map(Duration::from_secs))
        .collect();
    parsed.filter(|steps| !steps.is_empty())
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// How one job ended up after an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Resolved(PaymentStatus),
    Rescheduled { attempts: i32 },
    /// Handed to operators with `needs_reconciliation`.
    Flagged { reason: String },
    /// The payment request no longer exists.
    Dropped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub enqueued_stale: usize,
    pub claimed: usize,
    pub resolved: usize,
    pub rescheduled: usize,
    pub flagged: usize,
    pub ledger_repaired: usize,
}

pub struct DelayedResolutionWorker {
    orchestrator: Arc<PaymentOrchestrator>,
    store: Arc<dyn PaymentRequestStore>,
    jobs: Arc<dyn ResolutionJobStore>,
    clock: Arc<dyn Clock>,
    config: DelayedResolutionConfig,
}

impl DelayedResolutionWorker {
    pub fn new(
        orchestrator: Arc<PaymentOrchestrator>,
        store: Arc<dyn PaymentRequestStore>,
        jobs: Arc<dyn ResolutionJobStore>,
        config: DelayedResolutionConfig,
    ) -> Self {
        let clock = orchestrator.clock();
        Self {
            orchestrator,
            store,
            jobs,
            clock,
            config,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_attempts = self.config.max_attempts(),
            batch_size = self.config.batch_size,
            concurrency = self.config.concurrency,
            "delayed resolution worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("delayed resolution worker stopping");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    match self.run_cycle().await {
                        Ok(report) if report.claimed > 0 || report.enqueued_stale > 0 => {
                            info!(
                                enqueued_stale = report.enqueued_stale,
                                claimed = report.claimed,
                                resolved = report.resolved,
                                rescheduled = report.rescheduled,
                                flagged = report.flagged,
                                ledger_repaired = report.ledger_repaired,
                                "delayed resolution cycle finished"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "delayed resolution cycle failed"),
                    }
                }
            }
        }

        info!("delayed resolution worker stopped");
    }

    pub async fn run_cycle(&self) -> Result<CycleReport, WorkerError> {
        let mut report = CycleReport {
            enqueued_stale: self.enqueue_stale().await?,
            ..CycleReport::default()
        };

        let now = self.clock.now();
        let claimed = self
            .jobs
            .claim_due(now, to_chrono(self.config.lease), self.config.batch_size)
            .await?;
        report.claimed = claimed.len();

        let outcomes: Vec<Result<JobOutcome, WorkerError>> = stream::iter(claimed)
            .map(|job| async move { self.process_job(job).await })
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Ok(JobOutcome::Resolved(_)) | Ok(JobOutcome::Dropped) => report.resolved += 1,
                Ok(JobOutcome::Rescheduled { .. }) => report.rescheduled += 1,
                Ok(JobOutcome::Flagged { .. }) => report.flagged += 1,
                // The lease expires and another cycle retries the job.
                Err(e) => error!(error = %e, "resolution job failed"),
            }
        }

        report.ledger_repaired = self
            .orchestrator
            .repair_ledger_effects(self.config.batch_size)
            .await?;

        Ok(report)
    }

    /// Queue pending requests nobody deferred, e.g. because the payer closed the app.
    async fn enqueue_stale(&self) -> Result<usize, WorkerError> {
        let now = self.clock.now();
        let cutoff = now - to_chrono(self.config.stale_grace);
        let stale = self
            .store
            .find_stale_pending(cutoff, self.config.batch_size)
            .await?;

        let mut enqueued = 0;
        for request in stale {
            if self
                .jobs
                .find_by_payment_request(request.id)
                .await?
                .is_some()
            {
                continue;
            }
            self.jobs
                .enqueue(request.id, self.config.max_attempts(), now, now)
                .await?;
            debug!(payment_request_id = %request.id, "stale pending request queued for resolution");
            enqueued += 1;
        }
        Ok(enqueued)
    }

    pub async fn process_job(&self, job: ResolutionJob) -> Result<JobOutcome, WorkerError> {
        let result: OrchestratorResult<_> = self
            .orchestrator
            .refresh_with_source(job.payment_request_id, ResolutionSource::Reconciliation)
            .await;

        let result = match result {
            Ok(result) => result,
            Err(OrchestratorError::NotFound { .. }) => {
                warn!(job_id = %job.id, payment_request_id = %job.payment_request_id, "resolution job for missing request");
                self.jobs.remove(job.id).await?;
                return Ok(JobOutcome::Dropped);
            }
            Err(e) => return self.record_failed_attempt(&job, &e.to_string()).await,
        };

        match result.kind {
            ResolutionKind::Applied | ResolutionKind::AlreadyResolved => {
                self.jobs.remove(job.id).await?;
                info!(
                    job_id = %job.id,
                    payment_request_id = %job.payment_request_id,
                    attempt = job.attempts + 1,
                    status = %result.status(),
                    "delayed payment resolved"
                );
                Ok(JobOutcome::Resolved(result.status()))
            }
            ResolutionKind::StillPending => {
                self.record_failed_attempt(&job, "still processing at provider")
                    .await
            }
            ResolutionKind::GatewayError {
                message,
                provider_code: Some(code),
                retryable: false,
            } => {
                let reason = format!("provider rejected status query ({}): {}", code, message);
                self.flag(&job, reason).await
            }
            ResolutionKind::GatewayError { message, .. } => {
                self.record_failed_attempt(&job, &message).await
            }
        }
    }

    async fn record_failed_attempt(
        &self,
        job: &ResolutionJob,
        last_error: &str,
    ) -> Result<JobOutcome, WorkerError> {
        let attempts = job.attempts + 1;
        if attempts >= job.max_attempts {
            let reason = format!(
                "no resolution after {} attempts: {}",
                attempts, last_error
            );
            return self.flag(job, reason).await;
        }

        let now = self.clock.now();
        let next_attempt_at = now + to_chrono(self.config.delay_after(attempts));
        self.jobs
            .reschedule(job.id, attempts, next_attempt_at, Some(last_error), now)
            .await?;

        debug!(
            job_id = %job.id,
            payment_request_id = %job.payment_request_id,
            attempts,
            next_attempt_at = %next_attempt_at,
            last_error,
            "resolution attempt rescheduled"
        );
        Ok(JobOutcome::Rescheduled { attempts })
    }

    async fn flag(&self, job: &ResolutionJob, reason: String) -> Result<JobOutcome, WorkerError> {
        let flagged = self
            .store
            .flag_for_reconciliation(job.payment_request_id, &reason, self.clock.now())
            .await?;
        self.jobs.remove(job.id).await?;

        if flagged {
            warn!(
                job_id = %job.id,
                payment_request_id = %job.payment_request_id,
                reason = %reason,
                needs_reconciliation = true,
                "payment request handed to manual reconciliation"
            );
        }
        Ok(JobOutcome::Flagged { reason })
    }
}
