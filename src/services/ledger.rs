//! Wallet ledger contract
//!
//! The ledger applies the financial effect of a completed payment: a deposit
//! marks the wallet's deposit as paid and credits the balance, a daily payment
//! credits the balance and advances the paid-days counter. Writes are keyed by the
//! payment request id and must be idempotent.

use crate::database::error::DatabaseError;
use crate::payments::types::PaymentType;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEffect {
    pub payment_request_id: Uuid,
    pub wallet_id: Uuid,
    pub payment_type: PaymentType,
    pub amount: i64,
    pub days_count: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerApplication {
    Applied,
    /// An effect for this payment request was already recorded.
    AlreadyApplied,
}

#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    #[error("wallet {wallet_id} not found")]
    WalletNotFound { wallet_id: Uuid },

    #[error("ledger rejected effect: {message}")]
    Rejected { message: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<LedgerError> for crate::error::AppError {
    fn from(err: LedgerError) -> Self {
        use crate::error::{AppError, AppErrorKind, DomainError, InfrastructureError};

        match err {
            LedgerError::WalletNotFound { wallet_id } => {
                AppError::new(AppErrorKind::Domain(DomainError::WalletNotFound {
                    wallet_id: wallet_id.to_string(),
                }))
            }
            LedgerError::Database(db) => db.into(),
            other => AppError::new(AppErrorKind::Infrastructure(InfrastructureError::Ledger {
                message: other.to_string(),
            })),
        }
    }
}

#[async_trait]
pub trait LedgerWriter: Send + Sync {
    async fn apply_payment_effect(
        &self,
        effect: &LedgerEffect,
    ) -> Result<LedgerApplication, LedgerError>;

    /// Whether the wallet exists and is owned by the user.
    async fn wallet_belongs_to(&self, wallet_id: Uuid, user_id: Uuid) -> Result<bool, LedgerError>;
}
