use crate::database::error::DatabaseError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

const COLUMNS: &str = "id, payment_request_id, attempts, max_attempts, next_attempt_at, \
     locked_until, last_error, created_at, updated_at";

/// Durable entry asking the background worker to re-query one payment request.
#[derive(Debug, Clone, FromRow, PartialEq, Eq)]
pub struct ResolutionJob {
    pub id: Uuid,
    pub payment_request_id: Uuid,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait ResolutionJobStore: Send + Sync {
    /// Create a job for the request unless one is already queued; either way the
    /// queued job is returned.
    async fn enqueue(
        &self,
        payment_request_id: Uuid,
        max_attempts: i32,
        first_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ResolutionJob, DatabaseError>;

    /// Lease up to `limit` due jobs. A leased job is invisible to other claimers
    /// until the lease runs out or the job is rescheduled.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: i64,
    ) -> Result<Vec<ResolutionJob>, DatabaseError>;

    /// Record a finished attempt and release the lease.
    async fn reschedule(
        &self,
        id: Uuid,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        last_error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn remove(&self, id: Uuid) -> Result<(), DatabaseError>;

    async fn find_by_payment_request(
        &self,
        payment_request_id: Uuid,
    ) -> Result<Option<ResolutionJob>, DatabaseError>;

    async fn count_active(&self) -> Result<i64, DatabaseError>;
}

/// Postgres-backed delayed resolution queue
pub struct ResolutionJobRepository {
    pool: PgPool,
}

impl ResolutionJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResolutionJobStore for ResolutionJobRepository {
    async fn enqueue(
        &self,
        payment_request_id: Uuid,
        max_attempts: i32,
        first_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ResolutionJob, DatabaseError> {
        let inserted = sqlx::query_as::<_, ResolutionJob>(&format!(
            "INSERT INTO resolution_jobs
             (id, payment_request_id, attempts, max_attempts, next_attempt_at, created_at, updated_at)
             VALUES ($1, $2, 0, $3, $4, $5, $5)
             ON CONFLICT (payment_request_id) DO NOTHING
             RETURNING {COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(payment_request_id)
        .bind(max_attempts)
        .bind(first_attempt_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        match inserted {
            Some(job) => Ok(job),
            None => sqlx::query_as::<_, ResolutionJob>(&format!(
                "SELECT {COLUMNS} FROM resolution_jobs WHERE payment_request_id = $1"
            ))
            .bind(payment_request_id)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx),
        }
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: i64,
    ) -> Result<Vec<ResolutionJob>, DatabaseError> {
        sqlx::query_as::<_, ResolutionJob>(&format!(
            "UPDATE resolution_jobs
             SET locked_until = $2, updated_at = $1
             WHERE id IN (
                 SELECT id FROM resolution_jobs
                 WHERE next_attempt_at <= $1
                   AND (locked_until IS NULL OR locked_until <= $1)
                 ORDER BY next_attempt_at ASC
                 LIMIT $3
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {COLUMNS}"
        ))
        .bind(now)
        .bind(now + lease)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn reschedule(
        &self,
        id: Uuid,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        last_error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE resolution_jobs
             SET attempts = $2, next_attempt_at = $3, last_error = $4,
                 locked_until = NULL, updated_at = $5
             WHERE id = $1",
        )
        .bind(id)
        .bind(attempts)
        .bind(next_attempt_at)
        .bind(last_error)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM resolution_jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn find_by_payment_request(
        &self,
        payment_request_id: Uuid,
    ) -> Result<Option<ResolutionJob>, DatabaseError> {
        sqlx::query_as::<_, ResolutionJob>(&format!(
            "SELECT {COLUMNS} FROM resolution_jobs WHERE payment_request_id = $1"
        ))
        .bind(payment_request_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn count_active(&self) -> Result<i64, DatabaseError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM resolution_jobs")
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(count)
    }
}
