use crate::database::error::DatabaseError;
use crate::payments::error::PaymentError;
use crate::payments::types::{PaymentStatus, PaymentType, ResolutionSource};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use uuid::Uuid;

/// Prefix of the placeholder receipt stored when a direct status query confirms a
/// payment; the query response carries no receipt number.
pub const PROVISIONAL_RECEIPT_PREFIX: &str = "PENDING-RECEIPT:";

const COLUMNS: &str = "id, idempotency_key, user_id, wallet_id, payment_type, amount, phone, \
     days_count, checkout_request_id, merchant_request_id, status, result_code, result_desc, \
     mpesa_receipt_number, callback_received_at, resolution_source, resolved_at, \
     needs_reconciliation, reconciliation_reason, ledger_applied_at, created_at, updated_at, \
     expires_at";

/// One attempt to collect money from a user.
#[derive(Debug, Clone, FromRow, PartialEq)]
pub struct PaymentRequest {
    pub id: Uuid,
    pub idempotency_key: String,
    pub user_id: Uuid,
    pub wallet_id: Uuid,
    pub payment_type: String,
    pub amount: i64,
    pub phone: String,
    pub days_count: i32,
    pub checkout_request_id: String,
    pub merchant_request_id: String,
    pub status: String,
    pub result_code: Option<String>,
    pub result_desc: Option<String>,
    pub mpesa_receipt_number: Option<String>,
    pub callback_received_at: Option<DateTime<Utc>>,
    pub resolution_source: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub needs_reconciliation: bool,
    pub reconciliation_reason: Option<String>,
    pub ledger_applied_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PaymentRequest {
    /// Unrecognised values read as pending; the conditional update still decides
    /// whether a transition happens.
    pub fn status(&self) -> PaymentStatus {
        PaymentStatus::from_db_status(&self.status).unwrap_or(PaymentStatus::Pending)
    }

    pub fn payment_type(&self) -> Result<PaymentType, PaymentError> {
        PaymentType::from_str(&self.payment_type)
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn has_provisional_receipt(&self) -> bool {
        self.mpesa_receipt_number
            .as_deref()
            .is_some_and(|r| r.starts_with(PROVISIONAL_RECEIPT_PREFIX))
    }
}

/// Values for a freshly initiated request.
#[derive(Debug, Clone)]
pub struct NewPaymentRequest {
    pub id: Uuid,
    pub idempotency_key: String,
    pub user_id: Uuid,
    pub wallet_id: Uuid,
    pub payment_type: PaymentType,
    pub amount: i64,
    pub phone: String,
    pub days_count: i32,
    pub checkout_request_id: String,
    pub merchant_request_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Terminal write applied by the conditional update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub status: PaymentStatus,
    pub result_code: Option<String>,
    pub result_desc: Option<String>,
    pub receipt_number: Option<String>,
    pub source: ResolutionSource,
}

/// Durable record of payment attempts.
///
/// `resolve_if_pending` is the only way a request leaves PENDING: it must behave as
/// an atomic compare-and-set so concurrent resolvers see exactly one winner.
#[async_trait]
pub trait PaymentRequestStore: Send + Sync {
    /// Fails with a unique violation when an active request already holds the key.
    async fn insert(
        &self,
        request: NewPaymentRequest,
        now: DateTime<Utc>,
    ) -> Result<PaymentRequest, DatabaseError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentRequest>, DatabaseError>;

    /// Latest PENDING or COMPLETED request for the key.
    async fn find_active_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<PaymentRequest>, DatabaseError>;

    async fn find_by_checkout_request_id(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<PaymentRequest>, DatabaseError>;

    /// Returns the updated row when this call performed the transition, `None` when
    /// the request was no longer pending.
    async fn resolve_if_pending(
        &self,
        id: Uuid,
        resolution: &Resolution,
        now: DateTime<Utc>,
    ) -> Result<Option<PaymentRequest>, DatabaseError>;

    async fn mark_callback_received(&self, id: Uuid, now: DateTime<Utc>)
        -> Result<(), DatabaseError>;

    /// Replace a provisional receipt with the real one. Returns whether a row changed.
    async fn backfill_receipt(
        &self,
        id: Uuid,
        receipt_number: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Flag a still pending request for manual reconciliation. Returns whether a row
    /// changed.
    async fn flag_for_reconciliation(
        &self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Pending requests flagged for operators, oldest first.
    async fn list_flagged(&self, limit: i64) -> Result<Vec<PaymentRequest>, DatabaseError>;

    async fn mark_ledger_applied(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), DatabaseError>;

    async fn find_completed_without_ledger(
        &self,
        limit: i64,
    ) -> Result<Vec<PaymentRequest>, DatabaseError>;

    /// Pending, unflagged requests whose push expired before `cutoff`. A callback that was
    /// recorded but left the request pending does not exclude it.
    async fn find_stale_pending(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentRequest>, DatabaseError>;
}

/// Postgres-backed payment request store
pub struct PaymentRequestRepository {
    pool: PgPool,
}

impl PaymentRequestRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PaymentRequestStore for PaymentRequestRepository {
    async fn insert(
        &self,
        request: NewPaymentRequest,
        now: DateTime<Utc>,
    ) -> Result<PaymentRequest, DatabaseError> {
        sqlx::query_as::<_, PaymentRequest>(&format!(
            "INSERT INTO payment_requests
             (id, idempotency_key, user_id, wallet_id, payment_type, amount, phone, days_count,
              checkout_request_id, merchant_request_id, status, created_at, updated_at, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'PENDING', $11, $11, $12)
             RETURNING {COLUMNS}"
        ))
        .bind(request.id)
        .bind(&request.idempotency_key)
        .bind(request.user_id)
        .bind(request.wallet_id)
        .bind(request.payment_type.as_str())
        .bind(request.amount)
        .bind(&request.phone)
        .bind(request.days_count)
        .bind(&request.checkout_request_id)
        .bind(&request.merchant_request_id)
        .bind(now)
        .bind(request.expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentRequest>, DatabaseError> {
        sqlx::query_as::<_, PaymentRequest>(&format!(
            "SELECT {COLUMNS} FROM payment_requests WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn find_active_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<PaymentRequest>, DatabaseError> {
        sqlx::query_as::<_, PaymentRequest>(&format!(
            "SELECT {COLUMNS} FROM payment_requests
             WHERE idempotency_key = $1 AND status IN ('PENDING', 'COMPLETED')
             ORDER BY created_at DESC
             LIMIT 1"
        ))
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn find_by_checkout_request_id(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<PaymentRequest>, DatabaseError> {
        sqlx::query_as::<_, PaymentRequest>(&format!(
            "SELECT {COLUMNS} FROM payment_requests WHERE checkout_request_id = $1"
        ))
        .bind(checkout_request_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn resolve_if_pending(
        &self,
        id: Uuid,
        resolution: &Resolution,
        now: DateTime<Utc>,
    ) -> Result<Option<PaymentRequest>, DatabaseError> {
        let receipt = if resolution.status == PaymentStatus::Completed {
            resolution.receipt_number.as_deref()
        } else {
            None
        };

        sqlx::query_as::<_, PaymentRequest>(&format!(
            "UPDATE payment_requests
             SET status = $2,
                 result_code = $3,
                 result_desc = $4,
                 mpesa_receipt_number = $5,
                 resolution_source = $6,
                 resolved_at = $7,
                 needs_reconciliation = FALSE,
                 updated_at = $7
             WHERE id = $1 AND status = 'PENDING'
             RETURNING {COLUMNS}"
        ))
        .bind(id)
        .bind(resolution.status.to_db_status())
        .bind(&resolution.result_code)
        .bind(&resolution.result_desc)
        .bind(receipt)
        .bind(resolution.source.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn mark_callback_received(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE payment_requests
             SET callback_received_at = COALESCE(callback_received_at, $2), updated_at = $2
             WHERE id = $1",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn backfill_receipt(
        &self,
        id: Uuid,
        receipt_number: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE payment_requests
             SET mpesa_receipt_number = $2, updated_at = $3
             WHERE id = $1 AND status = 'COMPLETED' AND mpesa_receipt_number LIKE $4",
        )
        .bind(id)
        .bind(receipt_number)
        .bind(now)
        .bind(format!("{}%", PROVISIONAL_RECEIPT_PREFIX))
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn flag_for_reconciliation(
        &self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE payment_requests
             SET needs_reconciliation = TRUE, reconciliation_reason = $2, updated_at = $3
             WHERE id = $1 AND status = 'PENDING'",
        )
        .bind(id)
        .bind(reason)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_flagged(&self, limit: i64) -> Result<Vec<PaymentRequest>, DatabaseError> {
        sqlx::query_as::<_, PaymentRequest>(&format!(
            "SELECT {COLUMNS} FROM payment_requests
             WHERE needs_reconciliation = TRUE AND status = 'PENDING'
             ORDER BY created_at ASC
             LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn mark_ledger_applied(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE payment_requests
             SET ledger_applied_at = COALESCE(ledger_applied_at, $2), updated_at = $2
             WHERE id = $1 AND status = 'COMPLETED'",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn find_completed_without_ledger(
        &self,
        limit: i64,
    ) -> Result<Vec<PaymentRequest>, DatabaseError> {
        sqlx::query_as::<_, PaymentRequest>(&format!(
            "SELECT {COLUMNS} FROM payment_requests
             WHERE status = 'COMPLETED' AND ledger_applied_at IS NULL
             ORDER BY resolved_at ASC
             LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn find_stale_pending(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentRequest>, DatabaseError> {
        sqlx::query_as::<_, PaymentRequest>(&format!(
            "SELECT {COLUMNS} FROM payment_requests
             WHERE status = 'PENDING'
               AND needs_reconciliation = FALSE
               AND expires_at < $1
             ORDER BY expires_at ASC
             LIMIT $2"
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }
}
