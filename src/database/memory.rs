//! In-memory stores for `SKIP_EXTERNALS` runs and tests.
//!
//! They honour the same contracts as the Postgres repositories: the conditional
//! resolve happens under one lock, the active idempotency key is unique and job
//! leases hide claimed jobs from other claimers.

use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::database::ledger_repository::Wallet;
use crate::database::payment_request_repository::{
    NewPaymentRequest, PaymentRequest, PaymentRequestStore, Resolution, PROVISIONAL_RECEIPT_PREFIX,
};
use crate::database::resolution_job_repository::{ResolutionJob, ResolutionJobStore};
use crate::payments::types::{PaymentStatus, PaymentType};
use crate::services::ledger::{LedgerApplication, LedgerEffect, LedgerError, LedgerWriter};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn is_active(status: &str) -> bool {
    matches!(
        PaymentStatus::from_db_status(status),
        Some(PaymentStatus::Pending) | Some(PaymentStatus::Completed)
    )
}

#[derive(Default)]
pub struct MemoryPaymentRequestStore {
    rows: Mutex<HashMap<Uuid, PaymentRequest>>,
    unavailable: Mutex<bool>,
}

impl MemoryPaymentRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.rows).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<PaymentRequest> {
        let mut rows: Vec<_> = lock(&self.rows).values().cloned().collect();
        rows.sort_by_key(|r| r.created_at);
        rows
    }

    /// Make resolution writes fail until switched back. Reads keep working.
    pub fn set_unavailable(&self, unavailable: bool) {
        *lock(&self.unavailable) = unavailable;
    }

    fn check_writable(&self) -> Result<(), DatabaseError> {
        if *lock(&self.unavailable) {
            return Err(DatabaseError::new(DatabaseErrorKind::ConnectionFailed {
                message: "payment request store unavailable".to_string(),
            }));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentRequestStore for MemoryPaymentRequestStore {
    async fn insert(
        &self,
        request: NewPaymentRequest,
        now: DateTime<Utc>,
    ) -> Result<PaymentRequest, DatabaseError> {
        let mut rows = lock(&self.rows);
        if rows
            .values()
            .any(|r| r.idempotency_key == request.idempotency_key && is_active(&r.status))
        {
            return Err(DatabaseError::new(DatabaseErrorKind::UniqueViolation {
                constraint: Some("payment_requests_active_idempotency_key".to_string()),
            }));
        }
        if rows
            .values()
            .any(|r| r.checkout_request_id == request.checkout_request_id)
        {
            return Err(DatabaseError::new(DatabaseErrorKind::UniqueViolation {
                constraint: Some("payment_requests_checkout_request_id_key".to_string()),
            }));
        }

        let row = PaymentRequest {
            id: request.id,
            idempotency_key: request.idempotency_key,
            user_id: request.user_id,
            wallet_id: request.wallet_id,
            payment_type: request.payment_type.as_str().to_string(),
            amount: request.amount,
            phone: request.phone,
            days_count: request.days_count,
            checkout_request_id: request.checkout_request_id,
            merchant_request_id: request.merchant_request_id,
            status: PaymentStatus::Pending.to_db_status().to_string(),
            result_code: None,
            result_desc: None,
            mpesa_receipt_number: None,
            callback_received_at: None,
            resolution_source: None,
            resolved_at: None,
            needs_reconciliation: false,
            reconciliation_reason: None,
            ledger_applied_at: None,
            created_at: now,
            updated_at: now,
            expires_at: request.expires_at,
        };
        rows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentRequest>, DatabaseError> {
        Ok(lock(&self.rows).get(&id).cloned())
    }

    async fn find_active_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<PaymentRequest>, DatabaseError> {
        Ok(lock(&self.rows)
            .values()
            .filter(|r| r.idempotency_key == idempotency_key && is_active(&r.status))
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn find_by_checkout_request_id(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<PaymentRequest>, DatabaseError> {
        Ok(lock(&self.rows)
            .values()
            .find(|r| r.checkout_request_id == checkout_request_id)
            .cloned())
    }

    async fn resolve_if_pending(
        &self,
        id: Uuid,
        resolution: &Resolution,
        now: DateTime<Utc>,
    ) -> Result<Option<PaymentRequest>, DatabaseError> {
        self.check_writable()?;
        let mut rows = lock(&self.rows);
        let Some(row) = rows.get_mut(&id) else {
            return Ok(None);
        };
        if row.status() != PaymentStatus::Pending {
            return Ok(None);
        }

        row.status = resolution.status.to_db_status().to_string();
        row.result_code = resolution.result_code.clone();
        row.result_desc = resolution.result_desc.clone();
        row.mpesa_receipt_number = if resolution.status == PaymentStatus::Completed {
            resolution.receipt_number.clone()
        } else {
            None
        };
        row.resolution_source = Some(resolution.source.as_str().to_string());
        row.resolved_at = Some(now);
        row.needs_reconciliation = false;
        row.updated_at = now;
        Ok(Some(row.clone()))
    }

    async fn mark_callback_received(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.check_writable()?;
        if let Some(row) = lock(&self.rows).get_mut(&id) {
            row.callback_received_at.get_or_insert(now);
            row.updated_at = now;
        }
        Ok(())
    }

    async fn backfill_receipt(
        &self,
        id: Uuid,
        receipt_number: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut rows = lock(&self.rows);
        match rows.get_mut(&id) {
            Some(row)
                if row.status() == PaymentStatus::Completed
                    && row
                        .mpesa_receipt_number
                        .as_deref()
                        .is_some_and(|r| r.starts_with(PROVISIONAL_RECEIPT_PREFIX)) =>
            {
                row.mpesa_receipt_number = Some(receipt_number.to_string());
                row.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn flag_for_reconciliation(
        &self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut rows = lock(&self.rows);
        match rows.get_mut(&id) {
            Some(row) if row.status() == PaymentStatus::Pending => {
                row.needs_reconciliation = true;
                row.reconciliation_reason = Some(reason.to_string());
                row.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_flagged(&self, limit: i64) -> Result<Vec<PaymentRequest>, DatabaseError> {
        let mut flagged: Vec<_> = lock(&self.rows)
            .values()
            .filter(|r| r.needs_reconciliation && r.status() == PaymentStatus::Pending)
            .cloned()
            .collect();
        flagged.sort_by_key(|r| r.created_at);
        flagged.truncate(limit.max(0) as usize);
        Ok(flagged)
    }

    async fn mark_ledger_applied(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), DatabaseError> {
        if let Some(row) = lock(&self.rows).get_mut(&id) {
            if row.status() == PaymentStatus::Completed {
                row.ledger_applied_at.get_or_insert(now);
                row.updated_at = now;
            }
        }
        Ok(())
    }

    async fn find_completed_without_ledger(
        &self,
        limit: i64,
    ) -> Result<Vec<PaymentRequest>, DatabaseError> {
        let mut rows: Vec<_> = lock(&self.rows)
            .values()
            .filter(|r| r.status() == PaymentStatus::Completed && r.ledger_applied_at.is_none())
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.resolved_at);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn find_stale_pending(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentRequest>, DatabaseError> {
        let mut rows: Vec<_> = lock(&self.rows)
            .values()
            .filter(|r| {
                r.status() == PaymentStatus::Pending
                    && !r.needs_reconciliation
                    && r.expires_at < cutoff
            })
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.expires_at);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }
}

#[derive(Default)]
pub struct MemoryResolutionJobStore {
    jobs: Mutex<HashMap<Uuid, ResolutionJob>>,
}

impl MemoryResolutionJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<ResolutionJob> {
        lock(&self.jobs).values().cloned().collect()
    }
}

#[async_trait]
impl ResolutionJobStore for MemoryResolutionJobStore {
    async fn enqueue(
        &self,
        payment_request_id: Uuid,
        max_attempts: i32,
        first_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ResolutionJob, DatabaseError> {
        let mut jobs = lock(&self.jobs);
        if let Some(existing) = jobs
            .values()
            .find(|j| j.payment_request_id == payment_request_id)
        {
            return Ok(existing.clone());
        }

        let job = ResolutionJob {
            id: Uuid::new_v4(),
            payment_request_id,
            attempts: 0,
            max_attempts,
            next_attempt_at: first_attempt_at,
            locked_until: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: i64,
    ) -> Result<Vec<ResolutionJob>, DatabaseError> {
        let mut jobs = lock(&self.jobs);
        let mut due: Vec<_> = jobs
            .values()
            .filter(|j| j.next_attempt_at <= now && j.locked_until.map_or(true, |l| l <= now))
            .map(|j| (j.next_attempt_at, j.id))
            .collect();
        due.sort();
        due.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(job) = jobs.get_mut(&id) {
                job.locked_until = Some(now + lease);
                job.updated_at = now;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn reschedule(
        &self,
        id: Uuid,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        last_error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        if let Some(job) = lock(&self.jobs).get_mut(&id) {
            job.attempts = attempts;
            job.next_attempt_at = next_attempt_at;
            job.last_error = last_error.map(str::to_string);
            job.locked_until = None;
            job.updated_at = now;
        }
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<(), DatabaseError> {
        lock(&self.jobs).remove(&id);
        Ok(())
    }

    async fn find_by_payment_request(
        &self,
        payment_request_id: Uuid,
    ) -> Result<Option<ResolutionJob>, DatabaseError> {
        Ok(lock(&self.jobs)
            .values()
            .find(|j| j.payment_request_id == payment_request_id)
            .cloned())
    }

    async fn count_active(&self) -> Result<i64, DatabaseError> {
        Ok(lock(&self.jobs).len() as i64)
    }
}

#[derive(Default)]
struct LedgerState {
    wallets: HashMap<Uuid, Wallet>,
    effects: HashMap<Uuid, LedgerEffect>,
}

/// In-memory wallet ledger.
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
    /// Create wallets on first sight instead of rejecting unknown ones.
    auto_create_wallets: bool,
    unavailable: Mutex<bool>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger that opens a wallet for any (wallet, user) pair it is asked about.
    pub fn permissive() -> Self {
        Self {
            auto_create_wallets: true,
            ..Self::default()
        }
    }

    pub fn add_wallet(&self, wallet_id: Uuid, user_id: Uuid) {
        let now = Utc::now();
        lock(&self.state).wallets.insert(
            wallet_id,
            Wallet {
                id: wallet_id,
                user_id,
                balance: 0,
                deposit_paid: false,
                daily_payments_count: 0,
                created_at: now,
                updated_at: now,
            },
        );
    }

    pub fn wallet(&self, wallet_id: Uuid) -> Option<Wallet> {
        lock(&self.state).wallets.get(&wallet_id).cloned()
    }

    pub fn effect(&self, payment_request_id: Uuid) -> Option<LedgerEffect> {
        lock(&self.state).effects.get(&payment_request_id).cloned()
    }

    pub fn effect_count(&self) -> usize {
        lock(&self.state).effects.len()
    }

    /// Make every write fail until switched back, to exercise repair paths.
    pub fn set_unavailable(&self, unavailable: bool) {
        *lock(&self.unavailable) = unavailable;
    }
}

#[async_trait]
impl LedgerWriter for MemoryLedger {
    async fn apply_payment_effect(
        &self,
        effect: &LedgerEffect,
    ) -> Result<LedgerApplication, LedgerError> {
        if *lock(&self.unavailable) {
            return Err(LedgerError::Rejected {
                message: "ledger unavailable".to_string(),
            });
        }

        let mut state = lock(&self.state);
        if state.effects.contains_key(&effect.payment_request_id) {
            return Ok(LedgerApplication::AlreadyApplied);
        }

        let wallet = state
            .wallets
            .get_mut(&effect.wallet_id)
            .ok_or(LedgerError::WalletNotFound {
                wallet_id: effect.wallet_id,
            })?;
        wallet.balance += effect.amount;
        match effect.payment_type {
            PaymentType::Deposit => wallet.deposit_paid = true,
            PaymentType::Daily => wallet.daily_payments_count += effect.days_count,
        }
        wallet.updated_at = Utc::now();

        state
            .effects
            .insert(effect.payment_request_id, effect.clone());
        Ok(LedgerApplication::Applied)
    }

    async fn wallet_belongs_to(&self, wallet_id: Uuid, user_id: Uuid) -> Result<bool, LedgerError> {
        if let Some(wallet) = lock(&self.state).wallets.get(&wallet_id) {
            return Ok(wallet.user_id == user_id);
        }
        if self.auto_create_wallets {
            self.add_wallet(wallet_id, user_id);
            return Ok(true);
        }
        Ok(false)
    }
}
