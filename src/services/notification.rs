//! Outcome notifications
//!
//! Delivery channels (SMS, push, WhatsApp) live outside this service; the engine
//! only hands over the resolved outcome. Failures never affect the payment.

use crate::payments::taxonomy::ErrorClassification;
use crate::payments::types::{PaymentStatus, PaymentType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// What the payer is told about a resolved payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeNotice {
    pub status: PaymentStatus,
    pub payment_type: PaymentType,
    pub amount: i64,
    pub days_count: i32,
    pub receipt_number: Option<String>,
    /// Present for failed and cancelled payments.
    pub classification: Option<ErrorClassification>,
}

#[derive(Debug, Clone, Error)]
pub enum NotifyError {
    #[error("notification channel unavailable: {0}")]
    Unavailable(String),

    #[error("notification timed out")]
    Timeout,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_outcome(
        &self,
        user_id: Uuid,
        payment_request_id: Uuid,
        notice: &OutcomeNotice,
    ) -> Result<(), NotifyError>;
}

/// Emits notifications as structured log events.
#[derive(Debug, Default, Clone)]
pub struct LoggingNotifier;

impl LoggingNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify_outcome(
        &self,
        user_id: Uuid,
        payment_request_id: Uuid,
        notice: &OutcomeNotice,
    ) -> Result<(), NotifyError> {
        match notice.status {
            PaymentStatus::Completed => info!(
                %user_id,
                %payment_request_id,
                payment_type = %notice.payment_type,
                amount = notice.amount,
                days_count = notice.days_count,
                receipt = ?notice.receipt_number,
                "NOTIFICATION: payment received"
            ),
            PaymentStatus::Failed | PaymentStatus::Cancelled => {
                let (code, guidance) = notice
                    .classification
                    .as_ref()
                    .map(|c| (c.code.as_str(), c.guidance.as_str()))
                    .unwrap_or(("", ""));
                warn!(
                    %user_id,
                    %payment_request_id,
                    status = %notice.status,
                    result_code = code,
                    guidance,
                    "NOTIFICATION: payment not completed"
                );
            }
            PaymentStatus::Pending => info!(
                %user_id,
                %payment_request_id,
                "NOTIFICATION: payment confirmation delayed"
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::taxonomy::classify;

    #[tokio::test]
    async fn logging_notifier_never_fails() {
        let notifier = LoggingNotifier::new();
        let notice = OutcomeNotice {
            status: PaymentStatus::Failed,
            payment_type: PaymentType::Daily,
            amount: 87,
            days_count: 1,
            receipt_number: None,
            classification: Some(classify("2001")),
        };
        assert!(notifier
            .notify_outcome(Uuid::new_v4(), Uuid::new_v4(), &notice)
            .await
            .is_ok());
    }
}
