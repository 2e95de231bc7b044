use crate::database::error::DatabaseError;
use crate::payments::types::PaymentType;
use crate::services::ledger::{LedgerApplication, LedgerEffect, LedgerError, LedgerWriter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::info;
use uuid::Uuid;

/// Wallet entity
#[derive(Debug, Clone, FromRow, PartialEq, Eq)]
pub struct Wallet {
    pub id: Uuid,
    pub user_id: Uuid,
    pub balance: i64,
    pub deposit_paid: bool,
    pub daily_payments_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Postgres ledger writer. The effect row and the wallet update commit together,
/// and the effect's primary key on the payment request id makes replays no-ops.
pub struct WalletLedgerRepository {
    pool: PgPool,
}

impl WalletLedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_wallet(&self, wallet_id: Uuid) -> Result<Option<Wallet>, DatabaseError> {
        sqlx::query_as::<_, Wallet>(
            "SELECT id, user_id, balance, deposit_paid, daily_payments_count, created_at, updated_at
             FROM wallets WHERE id = $1",
        )
        .bind(wallet_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }
}

#[async_trait]
impl LedgerWriter for WalletLedgerRepository {
    async fn apply_payment_effect(
        &self,
        effect: &LedgerEffect,
    ) -> Result<LedgerApplication, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        let inserted = sqlx::query(
            "INSERT INTO wallet_ledger_effects
             (payment_request_id, wallet_id, payment_type, amount, days_count)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (payment_request_id) DO NOTHING",
        )
        .bind(effect.payment_request_id)
        .bind(effect.wallet_id)
        .bind(effect.payment_type.as_str())
        .bind(effect.amount)
        .bind(effect.days_count)
        .execute(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
            return Ok(LedgerApplication::AlreadyApplied);
        }

        let (deposit, days) = match effect.payment_type {
            PaymentType::Deposit => (true, 0),
            PaymentType::Daily => (false, effect.days_count),
        };

        let updated = sqlx::query(
            "UPDATE wallets
             SET balance = balance + $2,
                 deposit_paid = deposit_paid OR $3,
                 daily_payments_count = daily_payments_count + $4,
                 updated_at = NOW()
             WHERE id = $1",
        )
        .bind(effect.wallet_id)
        .bind(effect.amount)
        .bind(deposit)
        .bind(days)
        .execute(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        if updated.rows_affected() == 0 {
            tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
            return Err(LedgerError::WalletNotFound {
                wallet_id: effect.wallet_id,
            });
        }

        tx.commit().await.map_err(DatabaseError::from_sqlx)?;

        info!(
            payment_request_id = %effect.payment_request_id,
            wallet_id = %effect.wallet_id,
            payment_type = %effect.payment_type,
            amount = effect.amount,
            days_count = effect.days_count,
            "ledger effect applied"
        );
        Ok(LedgerApplication::Applied)
    }

    async fn wallet_belongs_to(&self, wallet_id: Uuid, user_id: Uuid) -> Result<bool, LedgerError> {
        Ok(self
            .find_wallet(wallet_id)
            .await?
            .is_some_and(|wallet| wallet.user_id == user_id))
    }
}
