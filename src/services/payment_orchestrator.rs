//! Payment Orchestrator Service
//!
//! Owns the payment request state machine. Every resolution path (provider
//! callback, client refresh, background reconciliation) funnels into
//! `apply_outcome`, where a conditional update lets exactly one caller move a
//! request out of PENDING. Only that caller writes the ledger effect and notifies
//! the payer.

use crate::clock::Clock;
use crate::config::PaymentRulesConfig;
use crate::database::error::DatabaseError;
use crate::database::payment_request_repository::{
    NewPaymentRequest, PaymentRequest, PaymentRequestStore, Resolution, PROVISIONAL_RECEIPT_PREFIX,
};
use crate::database::resolution_job_repository::{ResolutionJob, ResolutionJobStore};
use crate::error::{AppError, AppErrorKind, DomainError, ValidationError};
use crate::payments::error::PaymentError;
use crate::payments::gateway::MobileMoneyGateway;
use crate::payments::taxonomy::{self, ErrorClassification};
use crate::payments::types::{
    GatewayStatus, PaymentOutcome, PaymentStatus, PaymentType, ResolutionSource, StkPushRequest,
};
use crate::payments::utils::{mask_phone, normalize_phone};
use crate::services::ledger::{LedgerApplication, LedgerEffect, LedgerError, LedgerWriter};
use crate::services::notification::{Notifier, NotifyError, OutcomeNotice};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

// ============================================================================
// Configuration Types
// ============================================================================

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub rules: PaymentRulesConfig,
    /// Delay before the first background re-query of a deferred request.
    pub resolution_first_delay: ChronoDuration,
    /// Background re-queries allowed before a request is handed to operators.
    pub resolution_max_attempts: i32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            rules: PaymentRulesConfig::default(),
            resolution_first_delay: ChronoDuration::seconds(30),
            resolution_max_attempts: 5,
        }
    }
}

impl OrchestratorConfig {
    fn push_validity(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.rules.push_validity_secs as i64)
    }

    fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.rules.notify_timeout_secs)
    }

    /// Price of `days_count` days of the given payment type.
    pub fn expected_amount(&self, payment_type: PaymentType, days_count: i32) -> i64 {
        match payment_type {
            PaymentType::Deposit => self.rules.deposit_amount,
            PaymentType::Daily => self.rules.daily_amount * days_count as i64,
        }
    }
}

// ============================================================================
// Request / Result Types
// ============================================================================

/// Caller input for a new payment attempt.
#[derive(Debug, Clone)]
pub struct InitiatePayment {
    pub user_id: Uuid,
    pub wallet_id: Uuid,
    pub payment_type: PaymentType,
    pub amount: i64,
    pub phone: String,
    pub idempotency_key: String,
    pub days_count: i32,
}

#[derive(Debug, Clone)]
pub struct Initiation {
    pub request: PaymentRequest,
    /// False when an earlier attempt with the same idempotency key was returned.
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionKind {
    /// This call moved the request to its terminal status.
    Applied,
    /// The request was already terminal; nothing changed.
    AlreadyResolved,
    /// The provider has not seen a payer decision yet.
    StillPending,
    /// The provider could not be asked; the request is unchanged.
    GatewayError {
        message: String,
        provider_code: Option<String>,
        retryable: bool,
    },
}

#[derive(Debug, Clone)]
pub struct ResolutionResult {
    pub request: PaymentRequest,
    pub kind: ResolutionKind,
    /// Set for FAILED and CANCELLED requests.
    pub classification: Option<ErrorClassification>,
}

impl ResolutionResult {
    fn new(request: PaymentRequest, kind: ResolutionKind) -> Self {
        let classification = failure_classification(&request);
        Self {
            request,
            kind,
            classification,
        }
    }

    pub fn status(&self) -> PaymentStatus {
        self.request.status()
    }
}

/// Client facing view of a payment request.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentRequestView {
    pub id: Uuid,
    pub status: PaymentStatus,
    pub payment_type: String,
    pub amount: i64,
    pub days_count: i32,
    pub phone: String,
    pub receipt_number: Option<String>,
    pub result_code: Option<String>,
    pub result_desc: Option<String>,
    pub error: Option<ErrorClassification>,
    pub resolution_source: Option<String>,
    pub needs_reconciliation: bool,
    pub reconciliation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl From<&PaymentRequest> for PaymentRequestView {
    fn from(request: &PaymentRequest) -> Self {
        Self {
            id: request.id,
            status: request.status(),
            payment_type: request.payment_type.clone(),
            amount: request.amount,
            days_count: request.days_count,
            phone: mask_phone(&request.phone),
            receipt_number: request.mpesa_receipt_number.clone(),
            result_code: request.result_code.clone(),
            result_desc: request.result_desc.clone(),
            error: failure_classification(request),
            resolution_source: request.resolution_source.clone(),
            needs_reconciliation: request.needs_reconciliation,
            reconciliation_reason: request.reconciliation_reason.clone(),
            created_at: request.created_at,
            expires_at: request.expires_at,
            resolved_at: request.resolved_at,
        }
    }
}

/// A still pending request handed over to the background queue.
#[derive(Debug, Clone)]
pub struct DeferredResolution {
    pub request: PaymentRequest,
    pub job: ResolutionJob,
    /// Always the synthetic `TIMEOUT` classification.
    pub classification: ErrorClassification,
}

fn failure_classification(request: &PaymentRequest) -> Option<ErrorClassification> {
    match request.status() {
        PaymentStatus::Failed | PaymentStatus::Cancelled => Some(taxonomy::classify(
            request.result_code.as_deref().unwrap_or("UNKNOWN"),
        )),
        _ => None,
    }
}

// ============================================================================
// Orchestrator Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("payment request not found: {id}")]
    NotFound { id: Uuid },

    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("amount {actual} does not match expected {expected}")]
    InvalidAmount { expected: i64, actual: i64 },

    #[error("wallet {wallet_id} not found for user")]
    WalletNotFound { wallet_id: Uuid },

    #[error("idempotency key {idempotency_key} already used for a different payment")]
    IdempotencyConflict { idempotency_key: String },

    #[error("payment request {id} is already {status}")]
    NotPending { id: Uuid, status: PaymentStatus },

    #[error("gateway error: {0}")]
    Gateway(#[from] PaymentError),

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::NotFound { id } => {
                AppError::new(AppErrorKind::Domain(DomainError::PaymentRequestNotFound {
                    id: id.to_string(),
                }))
            }
            OrchestratorError::Validation { field, message } => {
                AppError::new(AppErrorKind::Validation(ValidationError::InvalidField {
                    field,
                    reason: message,
                }))
            }
            OrchestratorError::InvalidAmount { expected, actual } => {
                AppError::new(AppErrorKind::Domain(DomainError::InvalidAmount {
                    amount: actual,
                    reason: format!("expected {}", expected),
                }))
            }
            OrchestratorError::WalletNotFound { wallet_id } => {
                AppError::new(AppErrorKind::Domain(DomainError::WalletNotFound {
                    wallet_id: wallet_id.to_string(),
                }))
            }
            OrchestratorError::IdempotencyConflict { idempotency_key } => {
                AppError::new(AppErrorKind::Domain(DomainError::DuplicatePaymentRequest {
                    idempotency_key,
                }))
            }
            OrchestratorError::NotPending { id, status } => {
                AppError::new(AppErrorKind::Domain(DomainError::PaymentNotPending {
                    id: id.to_string(),
                    status: status.to_string(),
                }))
            }
            OrchestratorError::Gateway(e) => e.into(),
            OrchestratorError::Database(e) => e.into(),
            OrchestratorError::Ledger(e) => e.into(),
        }
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

// ============================================================================
// Per-key initiation lock
// ============================================================================

/// Serializes work on the same key inside one process. Entries are dropped once no
/// task holds or waits for them.
#[derive(Default)]
struct KeyedLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

struct KeyedGuard<'a> {
    owner: &'a KeyedLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    async fn acquire(&self, key: &str) -> KeyedGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(key.to_string()).or_default().clone()
        };
        KeyedGuard {
            owner: self,
            key: key.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.owner.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

// ============================================================================
// Main Payment Orchestrator
// ============================================================================

pub struct PaymentOrchestrator {
    store: Arc<dyn PaymentRequestStore>,
    jobs: Arc<dyn ResolutionJobStore>,
    gateway: Arc<dyn MobileMoneyGateway>,
    ledger: Arc<dyn LedgerWriter>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
    initiation_locks: KeyedLocks,
}

impl PaymentOrchestrator {
    pub fn new(
        store: Arc<dyn PaymentRequestStore>,
        jobs: Arc<dyn ResolutionJobStore>,
        gateway: Arc<dyn MobileMoneyGateway>,
        ledger: Arc<dyn LedgerWriter>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            jobs,
            gateway,
            ledger,
            notifier,
            clock,
            config,
            initiation_locks: KeyedLocks::default(),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    // =========================================================================
    // Initiation
    // =========================================================================

    /// Start a push payment, or return the live attempt for the same idempotency key.
    ///
    /// Gateway failures surface as errors and leave no request behind.
    pub async fn initiate(&self, input: InitiatePayment) -> OrchestratorResult<Initiation> {
        let phone = self.validate(&input)?;
        let _guard = self.initiation_locks.acquire(&input.idempotency_key).await;

        if let Some(existing) = self
            .store
            .find_active_by_idempotency_key(&input.idempotency_key)
            .await?
        {
            return self.reuse_existing(existing, &input);
        }

        if !self
            .ledger
            .wallet_belongs_to(input.wallet_id, input.user_id)
            .await?
        {
            return Err(OrchestratorError::WalletNotFound {
                wallet_id: input.wallet_id,
            });
        }

        let id = Uuid::new_v4();
        let push = StkPushRequest {
            amount: input.amount,
            phone: phone.clone(),
            account_reference: account_reference(id),
            description: match input.payment_type {
                PaymentType::Deposit => "Cover deposit".to_string(),
                PaymentType::Daily => "Daily cover".to_string(),
            },
        };

        let pushed = match self.gateway.initiate_push(push).await {
            Ok(pushed) => pushed,
            Err(e) => {
                warn!(
                    idempotency_key = %input.idempotency_key,
                    phone = %mask_phone(&phone),
                    provider_code = ?e.provider_code(),
                    retryable = e.is_retryable(),
                    error = %e,
                    "push payment initiation failed"
                );
                return Err(e.into());
            }
        };

        let now = self.clock.now();
        let new_request = NewPaymentRequest {
            id,
            idempotency_key: input.idempotency_key.clone(),
            user_id: input.user_id,
            wallet_id: input.wallet_id,
            payment_type: input.payment_type,
            amount: input.amount,
            phone: phone.clone(),
            days_count: input.days_count,
            checkout_request_id: pushed.checkout_request_id.clone(),
            merchant_request_id: pushed.merchant_request_id.clone(),
            expires_at: now + self.config.push_validity(),
        };

        match self.store.insert(new_request, now).await {
            Ok(request) => {
                info!(
                    payment_request_id = %request.id,
                    checkout_request_id = %request.checkout_request_id,
                    payment_type = %input.payment_type,
                    amount = request.amount,
                    days_count = request.days_count,
                    phone = %mask_phone(&request.phone),
                    expires_at = %request.expires_at,
                    "payment request initiated"
                );
                Ok(Initiation {
                    request,
                    created: true,
                })
            }
            Err(e) if e.is_unique_violation() => {
                // Another instance won the key between our lookup and insert.
                warn!(
                    idempotency_key = %input.idempotency_key,
                    orphan_checkout_request_id = %pushed.checkout_request_id,
                    "idempotency key claimed concurrently, returning existing request"
                );
                match self
                    .store
                    .find_active_by_idempotency_key(&input.idempotency_key)
                    .await?
                {
                    Some(existing) => Ok(Initiation {
                        request: existing,
                        created: false,
                    }),
                    None => Err(e.into()),
                }
            }
            Err(e) => {
                error!(
                    idempotency_key = %input.idempotency_key,
                    checkout_request_id = %pushed.checkout_request_id,
                    error = %e,
                    "push sent but payment request could not be stored"
                );
                Err(e.into())
            }
        }
    }

    fn validate(&self, input: &InitiatePayment) -> OrchestratorResult<String> {
        let key = input.idempotency_key.trim();
        if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(OrchestratorError::Validation {
                field: "idempotency_key".to_string(),
                message: format!("must be 1 to {} characters", MAX_IDEMPOTENCY_KEY_LEN),
            });
        }

        let max_days = self.config.rules.max_days_per_request as i32;
        match input.payment_type {
            PaymentType::Deposit if input.days_count != 1 => {
                return Err(OrchestratorError::Validation {
                    field: "days_count".to_string(),
                    message: "a deposit covers exactly one payment".to_string(),
                });
            }
            PaymentType::Daily if !(1..=max_days).contains(&input.days_count) => {
                return Err(OrchestratorError::Validation {
                    field: "days_count".to_string(),
                    message: format!("must be between 1 and {}", max_days),
                });
            }
            _ => {}
        }

        let expected = self
            .config
            .expected_amount(input.payment_type, input.days_count);
        if input.amount != expected {
            return Err(OrchestratorError::InvalidAmount {
                expected,
                actual: input.amount,
            });
        }

        normalize_phone(&input.phone).map_err(|e| OrchestratorError::Validation {
            field: "phone".to_string(),
            message: e.user_message(),
        })
    }

    fn reuse_existing(
        &self,
        existing: PaymentRequest,
        input: &InitiatePayment,
    ) -> OrchestratorResult<Initiation> {
        let same_payment = existing.wallet_id == input.wallet_id
            && existing.user_id == input.user_id
            && existing.payment_type == input.payment_type.as_str()
            && existing.amount == input.amount
            && existing.days_count == input.days_count;
        if !same_payment {
            warn!(
                idempotency_key = %input.idempotency_key,
                existing_payment_request_id = %existing.id,
                "idempotency key reused for a different payment"
            );
            return Err(OrchestratorError::IdempotencyConflict {
                idempotency_key: input.idempotency_key.clone(),
            });
        }

        info!(
            payment_request_id = %existing.id,
            idempotency_key = %input.idempotency_key,
            status = %existing.status,
            "returning existing payment request for idempotency key"
        );
        Ok(Initiation {
            request: existing,
            created: false,
        })
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    /// Apply a provider outcome. Idempotent: once a request is terminal every later
    /// call returns the stored state untouched.
    pub async fn apply_outcome(
        &self,
        payment_request_id: Uuid,
        outcome: PaymentOutcome,
        source: ResolutionSource,
    ) -> OrchestratorResult<ResolutionResult> {
        let now = self.clock.now();
        let request = self.load(payment_request_id).await?;

        if source == ResolutionSource::Callback {
            self.store
                .mark_callback_received(payment_request_id, now)
                .await?;
        }

        if request.is_terminal() {
            return self.already_resolved(request, &outcome, source).await;
        }

        if outcome.status == PaymentStatus::Pending {
            return Ok(ResolutionResult::new(request, ResolutionKind::StillPending));
        }

        let receipt_number = match outcome.status {
            PaymentStatus::Completed => Some(outcome.receipt_number.clone().unwrap_or_else(|| {
                format!("{}{}", PROVISIONAL_RECEIPT_PREFIX, request.checkout_request_id)
            })),
            _ => None,
        };
        let resolution = Resolution {
            status: outcome.status,
            result_code: outcome.result_code.clone(),
            result_desc: outcome.result_desc.clone(),
            receipt_number,
            source,
        };

        let late = now > request.expires_at;
        if late {
            warn!(
                payment_request_id = %payment_request_id,
                status = %outcome.status,
                source = %source,
                late = true,
                "outcome arrived after the push expired, applying it anyway"
            );
        }

        let Some(resolved) = self
            .store
            .resolve_if_pending(payment_request_id, &resolution, now)
            .await?
        else {
            let current = self.load(payment_request_id).await?;
            debug!(
                payment_request_id = %payment_request_id,
                source = %source,
                "lost resolution race, request already terminal"
            );
            return self.already_resolved(current, &outcome, source).await;
        };

        info!(
            payment_request_id = %resolved.id,
            status = %resolved.status,
            result_code = ?resolved.result_code,
            source = %source,
            late,
            "payment request resolved"
        );

        if resolved.status() == PaymentStatus::Completed {
            self.apply_ledger_effect(&resolved).await;
        }
        self.clear_resolution_job(resolved.id).await;
        self.notify(&resolved);

        // Re-read so the caller sees `ledger_applied_at`.
        let resolved = self
            .store
            .find_by_id(resolved.id)
            .await?
            .unwrap_or(resolved);
        Ok(ResolutionResult::new(resolved, ResolutionKind::Applied))
    }

    async fn already_resolved(
        &self,
        request: PaymentRequest,
        outcome: &PaymentOutcome,
        source: ResolutionSource,
    ) -> OrchestratorResult<ResolutionResult> {
        let mut request = request;
        let stored = request.status();

        if outcome.status != PaymentStatus::Pending && outcome.status != stored {
            error!(
                payment_request_id = %request.id,
                stored_status = %stored,
                reported_status = %outcome.status,
                reported_result_code = ?outcome.result_code,
                source = %source,
                conflicting = true,
                "provider reported a different outcome for a resolved payment"
            );
        }

        if source == ResolutionSource::Callback
            && stored == PaymentStatus::Completed
            && outcome.status == PaymentStatus::Completed
            && request.has_provisional_receipt()
        {
            if let Some(receipt) = outcome.receipt_number.as_deref() {
                let now = self.clock.now();
                if self.store.backfill_receipt(request.id, receipt, now).await? {
                    info!(
                        payment_request_id = %request.id,
                        receipt = receipt,
                        "provisional receipt replaced by provider receipt"
                    );
                    request = self.load(request.id).await?;
                }
            }
        } else {
            debug!(
                payment_request_id = %request.id,
                status = %stored,
                source = %source,
                "duplicate outcome ignored"
            );
        }

        Ok(ResolutionResult::new(request, ResolutionKind::AlreadyResolved))
    }

    /// Ask the provider directly and apply whatever it reports.
    pub async fn refresh_from_gateway(
        &self,
        payment_request_id: Uuid,
    ) -> OrchestratorResult<ResolutionResult> {
        self.refresh_with_source(payment_request_id, ResolutionSource::Refresh)
            .await
    }

    pub async fn refresh_with_source(
        &self,
        payment_request_id: Uuid,
        source: ResolutionSource,
    ) -> OrchestratorResult<ResolutionResult> {
        let request = self.load(payment_request_id).await?;
        if request.is_terminal() {
            return Ok(ResolutionResult::new(
                request,
                ResolutionKind::AlreadyResolved,
            ));
        }

        match self
            .gateway
            .query_status(&request.checkout_request_id)
            .await
        {
            Ok(GatewayStatus::Processing) => {
                debug!(
                    payment_request_id = %payment_request_id,
                    source = %source,
                    "payment still processing at provider"
                );
                Ok(ResolutionResult::new(request, ResolutionKind::StillPending))
            }
            Ok(GatewayStatus::Resolved(outcome))
                if outcome.status == PaymentStatus::Failed
                    && !outcome
                        .result_code
                        .as_deref()
                        .is_some_and(taxonomy::settles_payment) =>
            {
                info!(
                    payment_request_id = %payment_request_id,
                    source = %source,
                    result_code = ?outcome.result_code,
                    result_desc = ?outcome.result_desc,
                    "status query answer is not a final decision, keeping request pending"
                );
                Ok(ResolutionResult::new(request, ResolutionKind::StillPending))
            }
            Ok(GatewayStatus::Resolved(outcome)) => {
                self.apply_outcome(payment_request_id, outcome, source).await
            }
            Err(e) => {
                warn!(
                    payment_request_id = %payment_request_id,
                    checkout_request_id = %request.checkout_request_id,
                    source = %source,
                    provider_code = ?e.provider_code(),
                    error = %e,
                    "status query failed"
                );
                let kind = ResolutionKind::GatewayError {
                    message: e.to_string(),
                    provider_code: e.provider_code().map(str::to_string),
                    retryable: e.is_retryable(),
                };
                Ok(ResolutionResult::new(request, kind))
            }
        }
    }

    // =========================================================================
    // Reads and deferral
    // =========================================================================

    pub async fn get_status(&self, payment_request_id: Uuid) -> OrchestratorResult<PaymentRequestView> {
        let request = self.load(payment_request_id).await?;
        Ok(PaymentRequestView::from(&request))
    }

    pub async fn find_by_checkout_request_id(
        &self,
        checkout_request_id: &str,
    ) -> OrchestratorResult<Option<PaymentRequest>> {
        Ok(self
            .store
            .find_by_checkout_request_id(checkout_request_id)
            .await?)
    }

    /// Hand a still pending request to the background queue. Enqueueing twice
    /// returns the job already queued.
    pub async fn defer_resolution(
        &self,
        payment_request_id: Uuid,
    ) -> OrchestratorResult<DeferredResolution> {
        let request = self.load(payment_request_id).await?;
        if request.is_terminal() {
            return Err(OrchestratorError::NotPending {
                id: request.id,
                status: request.status(),
            });
        }

        let now = self.clock.now();
        let job = self
            .jobs
            .enqueue(
                request.id,
                self.config.resolution_max_attempts,
                now + self.config.resolution_first_delay,
                now,
            )
            .await?;

        info!(
            payment_request_id = %request.id,
            job_id = %job.id,
            next_attempt_at = %job.next_attempt_at,
            attempts = job.attempts,
            "payment confirmation delayed, queued for background resolution"
        );

        Ok(DeferredResolution {
            request,
            job,
            classification: taxonomy::timeout(),
        })
    }

    /// Pending requests that exhausted background resolution.
    pub async fn list_reconciliation(&self, limit: i64) -> OrchestratorResult<Vec<PaymentRequestView>> {
        Ok(self
            .store
            .list_flagged(limit)
            .await?
            .iter()
            .map(PaymentRequestView::from)
            .collect())
    }

    /// Re-apply ledger effects for completed requests whose ledger write failed.
    /// Returns how many requests were repaired.
    pub async fn repair_ledger_effects(&self, limit: i64) -> OrchestratorResult<usize> {
        let pending = self.store.find_completed_without_ledger(limit).await?;
        let mut repaired = 0;
        for request in &pending {
            if self.apply_ledger_effect(request).await {
                repaired += 1;
            }
        }
        if repaired > 0 {
            info!(repaired, "ledger effects repaired");
        }
        Ok(repaired)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn load(&self, payment_request_id: Uuid) -> OrchestratorResult<PaymentRequest> {
        self.store
            .find_by_id(payment_request_id)
            .await?
            .ok_or(OrchestratorError::NotFound {
                id: payment_request_id,
            })
    }

    /// Write the ledger effect for a completed request. Failures are logged and left
    /// for `repair_ledger_effects`; they never touch the request status.
    async fn apply_ledger_effect(&self, request: &PaymentRequest) -> bool {
        let payment_type = match request.payment_type() {
            Ok(payment_type) => payment_type,
            Err(e) => {
                error!(payment_request_id = %request.id, error = %e, "unknown payment type on completed request");
                return false;
            }
        };
        let effect = LedgerEffect {
            payment_request_id: request.id,
            wallet_id: request.wallet_id,
            payment_type,
            amount: request.amount,
            days_count: request.days_count,
        };

        match self.ledger.apply_payment_effect(&effect).await {
            Ok(application) => {
                if application == LedgerApplication::AlreadyApplied {
                    debug!(payment_request_id = %request.id, "ledger effect already recorded");
                }
                if let Err(e) = self
                    .store
                    .mark_ledger_applied(request.id, self.clock.now())
                    .await
                {
                    warn!(payment_request_id = %request.id, error = %e, "failed to mark ledger effect applied");
                }
                true
            }
            Err(e) => {
                error!(
                    payment_request_id = %request.id,
                    wallet_id = %request.wallet_id,
                    error = %e,
                    "ledger effect failed, will be repaired"
                );
                false
            }
        }
    }

    async fn clear_resolution_job(&self, payment_request_id: Uuid) {
        match self.jobs.find_by_payment_request(payment_request_id).await {
            Ok(Some(job)) => {
                if let Err(e) = self.jobs.remove(job.id).await {
                    warn!(%payment_request_id, job_id = %job.id, error = %e, "failed to remove resolution job");
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(%payment_request_id, error = %e, "failed to look up resolution job");
            }
        }
    }

    /// Hand the outcome to the notifier on its own task. Delivery is bounded by
    /// `notify_timeout` and never delays the caller.
    fn notify(&self, request: &PaymentRequest) {
        let Ok(payment_type) = request.payment_type() else {
            return;
        };
        let notice = OutcomeNotice {
            status: request.status(),
            payment_type,
            amount: request.amount,
            days_count: request.days_count,
            receipt_number: request.mpesa_receipt_number.clone(),
            classification: failure_classification(request),
        };
        let notifier = self.notifier.clone();
        let timeout = self.config.notify_timeout();
        let user_id = request.user_id;
        let payment_request_id = request.id;

        tokio::spawn(async move {
            let delivered = tokio::time::timeout(
                timeout,
                notifier.notify_outcome(user_id, payment_request_id, &notice),
            )
            .await
            .unwrap_or(Err(NotifyError::Timeout));
            if let Err(e) = delivered {
                warn!(%payment_request_id, error = %e, "outcome notification failed");
            }
        });
    }
}

/// Daraja limits AccountReference to 12 characters.
fn account_reference(id: Uuid) -> String {
    let simple = id.simple().to_string().to_uppercase();
    format!("BIMA{}", &simple[..8])
}
