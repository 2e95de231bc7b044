//! Unified error handling for the Bima backend
//!
//! Every layer keeps its own error enum; at the HTTP edge they are folded into
//! `AppError`, which carries the status mapping, a machine-readable code and a
//! message that is safe to show to the payer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for programmatic handling by clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Domain errors (4xx)
    #[serde(rename = "PAYMENT_REQUEST_NOT_FOUND")]
    PaymentRequestNotFound,
    #[serde(rename = "WALLET_NOT_FOUND")]
    WalletNotFound,
    #[serde(rename = "INVALID_AMOUNT")]
    InvalidAmount,
    #[serde(rename = "DUPLICATE_PAYMENT_REQUEST")]
    DuplicatePaymentRequest,
    #[serde(rename = "PAYMENT_NOT_PENDING")]
    PaymentNotPending,
    #[serde(rename = "UNAUTHORIZED")]
    Unauthorized,

    // Infrastructure errors (5xx)
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError,
    #[serde(rename = "LEDGER_ERROR")]
    LedgerError,
    #[serde(rename = "CONFIGURATION_ERROR")]
    ConfigurationError,

    // External errors (502, 503, 504)
    #[serde(rename = "PAYMENT_PROVIDER_ERROR")]
    PaymentProviderError,
    #[serde(rename = "RATE_LIMIT_ERROR")]
    RateLimitError,

    // Generic
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError,
    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
}

/// Business rule violations
#[derive(Debug, Clone)]
pub enum DomainError {
    /// Payment request with the given id doesn't exist
    PaymentRequestNotFound { id: String },
    /// Wallet doesn't exist
    WalletNotFound { wallet_id: String },
    /// Amount doesn't match the price of what is being paid for
    InvalidAmount { amount: i64, reason: String },
    /// Another attempt with this idempotency key was created concurrently
    DuplicatePaymentRequest { idempotency_key: String },
    /// Operation requires a request that is still waiting for its outcome
    PaymentNotPending { id: String, status: String },
    /// Caller failed authentication (callback token)
    Unauthorized { reason: String },
}

/// Infrastructure-level errors (database, ledger, configuration)
#[derive(Debug, Clone)]
pub enum InfrastructureError {
    Database { message: String, is_retryable: bool },
    Ledger { message: String },
    Configuration { message: String },
}

/// External service errors
#[derive(Debug, Clone)]
pub enum ExternalError {
    /// Mobile-money provider error
    PaymentProvider {
        provider: String,
        message: String,
        is_retryable: bool,
    },
    RateLimit {
        service: String,
        retry_after: Option<u64>,
    },
}

/// Input validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    InvalidField { field: String, reason: String },
    MissingField { field: String },
}

/// Unified application error type
#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Domain(DomainError),
    Infrastructure(InfrastructureError),
    External(ExternalError),
    Validation(ValidationError),
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
            context: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::PaymentRequestNotFound { .. } => 404,
                DomainError::WalletNotFound { .. } => 404,
                DomainError::InvalidAmount { .. } => 400,
                DomainError::DuplicatePaymentRequest { .. } => 409,
                DomainError::PaymentNotPending { .. } => 409,
                DomainError::Unauthorized { .. } => 401,
            },
            AppErrorKind::Infrastructure(_) => 500,
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { .. } => 502,
                ExternalError::RateLimit { .. } => 429,
            },
            AppErrorKind::Validation(_) => 400,
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::PaymentRequestNotFound { .. } => ErrorCode::PaymentRequestNotFound,
                DomainError::WalletNotFound { .. } => ErrorCode::WalletNotFound,
                DomainError::InvalidAmount { .. } => ErrorCode::InvalidAmount,
                DomainError::DuplicatePaymentRequest { .. } => ErrorCode::DuplicatePaymentRequest,
                DomainError::PaymentNotPending { .. } => ErrorCode::PaymentNotPending,
                DomainError::Unauthorized { .. } => ErrorCode::Unauthorized,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => ErrorCode::DatabaseError,
                InfrastructureError::Ledger { .. } => ErrorCode::LedgerError,
                InfrastructureError::Configuration { .. } => ErrorCode::ConfigurationError,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { .. } => ErrorCode::PaymentProviderError,
                ExternalError::RateLimit { .. } => ErrorCode::RateLimitError,
            },
            AppErrorKind::Validation(_) => ErrorCode::ValidationError,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::PaymentRequestNotFound { id } => {
                    format!("Payment request '{}' not found", id)
                }
                DomainError::WalletNotFound { wallet_id } => {
                    format!("Wallet '{}' not found", wallet_id)
                }
                DomainError::InvalidAmount { amount, reason } => {
                    format!("Invalid amount {}: {}", amount, reason)
                }
                DomainError::DuplicatePaymentRequest { .. } => {
                    "This payment is already being processed".to_string()
                }
                DomainError::PaymentNotPending { status, .. } => {
                    format!("Payment is already {}", status.to_lowercase())
                }
                DomainError::Unauthorized { .. } => "Unauthorized".to_string(),
            },
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { is_retryable, .. } => {
                    if *is_retryable {
                        "M-Pesa is temporarily unavailable. Please try again".to_string()
                    } else {
                        "M-Pesa could not start the payment. Please contact support".to_string()
                    }
                }
                ExternalError::RateLimit {
                    service,
                    retry_after,
                } => match retry_after {
                    Some(secs) => format!(
                        "Rate limit exceeded for {}. Please try again in {} seconds",
                        service, secs
                    ),
                    None => format!("Rate limit exceeded for {}. Please try again later", service),
                },
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::InvalidField { field, reason } => {
                    format!("Invalid value for '{}': {}", field, reason)
                }
                ValidationError::MissingField { field } => {
                    format!("Required field '{}' is missing", field)
                }
            },
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Domain(_) => false,
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => *is_retryable,
                InfrastructureError::Ledger { .. } => true,
                InfrastructureError::Configuration { .. } => false,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { is_retryable, .. } => *is_retryable,
                ExternalError::RateLimit { .. } => true,
            },
            AppErrorKind::Validation(_) => false,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for AppError {}

// From<DatabaseError> lives in database/error.rs, From<PaymentError> in payments/error.rs.

/// Result type for operations that can fail with AppError
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_error() {
        let error = AppError::new(AppErrorKind::Domain(DomainError::PaymentRequestNotFound {
            id: "abc".to_string(),
        }));

        assert_eq!(error.status_code(), 404);
        assert_eq!(error.error_code(), ErrorCode::PaymentRequestNotFound);
        assert!(error.user_message().contains("abc"));
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_provider_error_retryability() {
        let error = AppError::new(AppErrorKind::External(ExternalError::PaymentProvider {
            provider: "mpesa".to_string(),
            message: "503".to_string(),
            is_retryable: true,
        }));

        assert_eq!(error.status_code(), 502);
        assert!(error.is_retryable());
        assert!(error.user_message().contains("temporarily unavailable"));
    }

    #[test]
    fn test_validation_error() {
        let error = AppError::new(AppErrorKind::Validation(ValidationError::InvalidField {
            field: "days_count".to_string(),
            reason: "must be between 1 and 30".to_string(),
        }));

        assert_eq!(error.status_code(), 400);
        assert_eq!(error.error_code(), ErrorCode::ValidationError);
        assert_eq!(
            error.user_message(),
            "Invalid value for 'days_count': must be between 1 and 30"
        );
    }

    #[test]
    fn test_rate_limit_and_unauthorized_mapping() {
        let limited = AppError::new(AppErrorKind::External(ExternalError::RateLimit {
            service: "mpesa".to_string(),
            retry_after: Some(30),
        }));
        assert_eq!(limited.status_code(), 429);
        assert!(limited.is_retryable());
        assert!(limited.user_message().contains("30 seconds"));

        let unauthorized = AppError::new(AppErrorKind::Domain(DomainError::Unauthorized {
            reason: "bad callback token".to_string(),
        }));
        assert_eq!(unauthorized.status_code(), 401);
        assert_eq!(unauthorized.error_code(), ErrorCode::Unauthorized);
    }

    #[test]
    fn test_error_code_serializes_screaming() {
        let json = serde_json::to_value(ErrorCode::PaymentNotPending).unwrap();
        assert_eq!(json, "PAYMENT_NOT_PENDING");
    }
}
