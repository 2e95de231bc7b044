use crate::payments::error::PaymentError;
use crate::payments::taxonomy::{CANCELLED_BY_USER_CODE, SUCCESS_CODE};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// What a payment request pays for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    /// One-off initial deposit that activates cover.
    Deposit,
    /// Daily premium, possibly covering several days at once.
    Daily,
}

impl PaymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentType::Deposit => "deposit",
            PaymentType::Daily => "daily",
        }
    }
}

impl std::fmt::Display for PaymentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PaymentType {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "deposit" => Ok(PaymentType::Deposit),
            "daily" => Ok(PaymentType::Daily),
            _ => Err(PaymentError::ValidationError {
                message: format!("unsupported payment type: {}", value),
                field: Some("payment_type".to_string()),
            }),
        }
    }
}

/// Resolution state of a payment request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }

    pub fn to_db_status(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Completed => "COMPLETED",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn from_db_status(status: &str) -> Option<Self> {
        match status.trim().to_uppercase().as_str() {
            "PENDING" => Some(PaymentStatus::Pending),
            "COMPLETED" => Some(PaymentStatus::Completed),
            "FAILED" => Some(PaymentStatus::Failed),
            "CANCELLED" => Some(PaymentStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_db_status())
    }
}

/// Which path delivered the outcome that resolved a request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    /// Provider webhook.
    Callback,
    /// Direct status query triggered by the client.
    Refresh,
    /// Direct status query made by the delayed resolution queue.
    Reconciliation,
}

impl ResolutionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionSource::Callback => "callback",
            ResolutionSource::Refresh => "refresh",
            ResolutionSource::Reconciliation => "reconciliation",
        }
    }
}

impl std::fmt::Display for ResolutionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome reported by the provider, either through a callback or a status query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentOutcome {
    pub status: PaymentStatus,
    pub result_code: Option<String>,
    pub result_desc: Option<String>,
    pub receipt_number: Option<String>,
}

impl PaymentOutcome {
    /// Build an outcome from a provider result code. `0` is success, `1032` is a
    /// payer cancellation and every other code is a failure.
    pub fn from_result_code(
        result_code: &str,
        result_desc: Option<String>,
        receipt_number: Option<String>,
    ) -> Self {
        let code = result_code.trim();
        let status = match code {
            SUCCESS_CODE => PaymentStatus::Completed,
            CANCELLED_BY_USER_CODE => PaymentStatus::Cancelled,
            _ => PaymentStatus::Failed,
        };
        Self {
            status,
            result_code: Some(code.to_string()),
            result_desc,
            receipt_number: if status == PaymentStatus::Completed {
                receipt_number.filter(|r| !r.trim().is_empty())
            } else {
                None
            },
        }
    }

    pub fn completed(receipt_number: impl Into<String>) -> Self {
        Self::from_result_code(
            SUCCESS_CODE,
            Some("The service request is processed successfully.".to_string()),
            Some(receipt_number.into()),
        )
    }
}

/// Push-payment initiation request sent to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StkPushRequest {
    pub amount: i64,
    pub phone: String,
    pub account_reference: String,
    pub description: String,
}

/// Correlation identifiers the gateway hands back on a successful initiation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StkPushResponse {
    pub checkout_request_id: String,
    pub merchant_request_id: String,
    pub customer_message: Option<String>,
}

/// Result of a direct status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayStatus {
    /// The payer has not acted yet; the request stays pending.
    Processing,
    Resolved(PaymentOutcome),
}
