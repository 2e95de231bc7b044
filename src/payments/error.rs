use thiserror::Error;

pub type PaymentResult<T> = Result<T, PaymentError>;

#[derive(Debug, Clone, Error)]
pub enum PaymentError {
    #[error("Validation error: {message}")]
    ValidationError {
        message: String,
        field: Option<String>,
    },

    #[error("Network error: {message}")]
    NetworkError { message: String },

    #[error("Rate limit exceeded: {message}")]
    RateLimitError {
        message: String,
        retry_after_seconds: Option<u64>,
    },

    #[error("Authentication with provider failed: {message}")]
    AuthenticationError { message: String },

    #[error("Callback verification failed: {message}")]
    CallbackVerificationError { message: String },

    #[error("Provider error: provider={provider}, message={message}")]
    ProviderError {
        provider: String,
        message: String,
        provider_code: Option<String>,
        retryable: bool,
    },
}

impl PaymentError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::ValidationError { .. } => false,
            PaymentError::NetworkError { .. } => true,
            PaymentError::RateLimitError { .. } => true,
            PaymentError::AuthenticationError { .. } => true,
            PaymentError::CallbackVerificationError { .. } => false,
            PaymentError::ProviderError { retryable, .. } => *retryable,
        }
    }

    /// Provider supplied error code, when the provider returned one.
    pub fn provider_code(&self) -> Option<&str> {
        match self {
            PaymentError::ProviderError { provider_code, .. } => provider_code.as_deref(),
            _ => None,
        }
    }

    pub fn http_status_code(&self) -> u16 {
        match self {
            PaymentError::ValidationError { .. } => 400,
            PaymentError::NetworkError { .. } => 503,
            PaymentError::RateLimitError { .. } => 429,
            PaymentError::AuthenticationError { .. } => 502,
            PaymentError::CallbackVerificationError { .. } => 401,
            PaymentError::ProviderError { .. } => 502,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            PaymentError::ValidationError { message, .. } => message.clone(),
            PaymentError::NetworkError { .. } => {
                "M-Pesa is temporarily unavailable. Please try again".to_string()
            }
            PaymentError::RateLimitError { .. } => {
                "Too many requests to M-Pesa. Please retry shortly".to_string()
            }
            PaymentError::AuthenticationError { .. } => {
                "M-Pesa is temporarily unavailable. Please try again".to_string()
            }
            PaymentError::CallbackVerificationError { .. } => "Invalid callback".to_string(),
            PaymentError::ProviderError { .. } => "M-Pesa could not start the payment".to_string(),
        }
    }
}

impl From<PaymentError> for crate::error::AppError {
    fn from(err: PaymentError) -> Self {
        use crate::error::{AppError, AppErrorKind, ExternalError, ValidationError};

        match err {
            PaymentError::ValidationError { message, field } => {
                AppError::new(AppErrorKind::Validation(ValidationError::InvalidField {
                    field: field.unwrap_or_else(|| "request".to_string()),
                    reason: message,
                }))
            }
            PaymentError::RateLimitError {
                retry_after_seconds,
                ..
            } => AppError::new(AppErrorKind::External(ExternalError::RateLimit {
                service: "mpesa".to_string(),
                retry_after: retry_after_seconds,
            })),
            other => AppError::new(AppErrorKind::External(ExternalError::PaymentProvider {
                provider: "mpesa".to_string(),
                message: other.to_string(),
                is_retryable: other.is_retryable(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_http_status_mapping_is_correct() {
        assert_eq!(
            PaymentError::ValidationError {
                message: "bad".to_string(),
                field: None
            }
            .http_status_code(),
            400
        );
        assert_eq!(
            PaymentError::RateLimitError {
                message: "limited".to_string(),
                retry_after_seconds: Some(30)
            }
            .http_status_code(),
            429
        );
    }

    #[test]
    fn provider_rate_limit_reaches_the_client_as_429() {
        let app_error: crate::error::AppError = PaymentError::RateLimitError {
            message: "limited".to_string(),
            retry_after_seconds: Some(30),
        }
        .into();
        assert_eq!(app_error.status_code(), 429);
        assert_eq!(app_error.error_code(), crate::error::ErrorCode::RateLimitError);
    }

    #[test]
    fn retryable_flags_are_set() {
        assert!(PaymentError::NetworkError {
            message: "timeout".to_string()
        }
        .is_retryable());
        assert!(!PaymentError::ProviderError {
            provider: "mpesa".to_string(),
            message: "Invalid CheckoutRequestID".to_string(),
            provider_code: Some("400.002.02".to_string()),
            retryable: false,
        }
        .is_retryable());
    }

    #[test]
    fn provider_code_is_exposed() {
        let err = PaymentError::ProviderError {
            provider: "mpesa".to_string(),
            message: "busy".to_string(),
            provider_code: Some("500.003.02".to_string()),
            retryable: true,
        };
        assert_eq!(err.provider_code(), Some("500.003.02"));
        assert_eq!(
            PaymentError::NetworkError {
                message: "x".to_string()
            }
            .provider_code(),
            None
        );
    }
}
