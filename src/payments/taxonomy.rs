//! Mobile-money result code taxonomy
//!
//! Maps every result code the engine can see (M-Pesa `ResultCode` values, Daraja
//! API `errorCode` values and the locally produced `TIMEOUT`) to a user-facing
//! message, guidance text and the flags that decide which follow-up actions the
//! caller may offer.

use serde::{Deserialize, Serialize};

/// Synthetic code emitted when the polling window closes without a resolution.
pub const TIMEOUT_CODE: &str = "TIMEOUT";

/// Result code the provider uses for a successful payment.
pub const SUCCESS_CODE: &str = "0";

/// Result code the provider uses when the payer dismissed the prompt.
pub const CANCELLED_BY_USER_CODE: &str = "1032";

/// Daraja error code returned by the status query while the payer has not acted yet.
pub const STILL_PROCESSING_CODE: &str = "500.001.1001";

/// `ResultCode` some status query answers carry while the transaction is in flight.
pub const QUERY_PROCESSING_CODE: &str = "4999";

/// Retryable codes that still mean the provider made a final decision on the push.
const FINAL_RETRYABLE_CODES: &[&str] = &["1037", "1019", "1001", "1025", "9999"];

/// Follow-up actions a caller may offer once a payment stopped in a non-success state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    /// Start a fresh payment attempt.
    Retry,
    /// Ask the provider (or our status endpoint) for the current state.
    CheckStatus,
    /// Escalate to a human.
    ContactSupport,
}

/// Lookup key: either a provider supplied code or the local timeout marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResultCodeKey<'a> {
    Provider(&'a str),
    Timeout,
}

impl<'a> ResultCodeKey<'a> {
    pub fn parse(code: &'a str) -> Self {
        let code = code.trim();
        if code.eq_ignore_ascii_case(TIMEOUT_CODE) {
            ResultCodeKey::Timeout
        } else {
            ResultCodeKey::Provider(code)
        }
    }
}

/// Classification of a single result code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorClassification {
    pub code: String,
    pub message: String,
    pub guidance: String,
    pub is_timeout: bool,
    pub is_cancelled: bool,
    pub is_user_error: bool,
    pub is_retryable: bool,
    pub actions: Vec<RecommendedAction>,
}

impl ErrorClassification {
    /// Whether background reconciliation may keep working on this outcome on its own.
    /// Cancellations and payer mistakes always need the payer to start over.
    pub fn allows_auto_retry(&self) -> bool {
        self.is_retryable && !self.is_cancelled && !self.is_user_error
    }
}

struct Entry {
    message: &'static str,
    guidance: &'static str,
    is_timeout: bool,
    is_cancelled: bool,
    is_user_error: bool,
    is_retryable: bool,
}

const fn entry(
    message: &'static str,
    guidance: &'static str,
    is_timeout: bool,
    is_cancelled: bool,
    is_user_error: bool,
    is_retryable: bool,
) -> Entry {
    Entry {
        message,
        guidance,
        is_timeout,
        is_cancelled,
        is_user_error,
        is_retryable,
    }
}

fn lookup(key: &ResultCodeKey<'_>) -> Entry {
    let code = match key {
        ResultCodeKey::Timeout => {
            return entry(
                "We have not received a confirmation for this payment yet",
                "Your payment may still go through. Do not pay again; we will notify you once M-Pesa confirms.",
                true,
                false,
                false,
                true,
            )
        }
        ResultCodeKey::Provider(code) => *code,
    };

    match code {
        "0" => entry(
            "Payment completed",
            "Your payment was received.",
            false,
            false,
            false,
            false,
        ),
        "1" => entry(
            "Insufficient M-Pesa balance",
            "Top up your M-Pesa account and try again.",
            false,
            false,
            true,
            false,
        ),
        "1032" => entry(
            "Payment was cancelled on the phone",
            "You dismissed the M-Pesa prompt. Start the payment again when ready.",
            false,
            true,
            false,
            false,
        ),
        "2001" => entry(
            "Wrong M-Pesa PIN entered",
            "Check your PIN and start the payment again.",
            false,
            false,
            true,
            false,
        ),
        "1037" => entry(
            "Your phone could not be reached",
            "Make sure your phone is on and has network, then try again.",
            true,
            false,
            false,
            true,
        ),
        "1019" => entry(
            "The M-Pesa prompt expired before it was answered",
            "Try again and enter your PIN as soon as the prompt appears.",
            true,
            false,
            false,
            true,
        ),
        "1001" => entry(
            "Another M-Pesa transaction is in progress on this phone",
            "Wait a minute for the other transaction to finish, then try again.",
            false,
            false,
            false,
            true,
        ),
        "1025" | "9999" => entry(
            "M-Pesa could not send the payment prompt",
            "Try again in a few minutes.",
            false,
            false,
            false,
            true,
        ),
        "17" | "26" => entry(
            "M-Pesa is temporarily busy",
            "Try again in a few minutes.",
            false,
            false,
            false,
            true,
        ),
        "500.001.1001" | "4999" => entry(
            "The payment is still being processed",
            "Wait for the confirmation message from M-Pesa.",
            false,
            false,
            false,
            true,
        ),
        "400.002.02" => entry(
            "M-Pesa does not recognise this payment request",
            "Contact support with your payment reference.",
            false,
            false,
            false,
            false,
        ),
        "404.001.03" | "404.001.04" => entry(
            "M-Pesa rejected our credentials",
            "Try again later; our team has been alerted.",
            false,
            false,
            false,
            true,
        ),
        _ => entry(
            "The payment could not be completed",
            "Check your M-Pesa messages before trying again, or contact support.",
            false,
            false,
            false,
            true,
        ),
    }
}

/// Classify a provider result code (or `TIMEOUT`).
pub fn classify(code: &str) -> ErrorClassification {
    let key = ResultCodeKey::parse(code);
    let entry = lookup(&key);
    let code = match key {
        ResultCodeKey::Timeout => TIMEOUT_CODE.to_string(),
        ResultCodeKey::Provider(code) => code.to_string(),
    };

    let mut actions = Vec::new();
    if entry.is_timeout && code == TIMEOUT_CODE {
        actions.push(RecommendedAction::CheckStatus);
    } else if entry.is_cancelled || entry.is_user_error || entry.is_retryable {
        actions.push(RecommendedAction::Retry);
        if entry.is_retryable && !entry.is_cancelled && !entry.is_user_error {
            actions.push(RecommendedAction::CheckStatus);
        }
    }
    if !entry.is_cancelled && !entry.is_user_error && code != SUCCESS_CODE {
        actions.push(RecommendedAction::ContactSupport);
    }

    ErrorClassification {
        code,
        message: entry.message.to_string(),
        guidance: entry.guidance.to_string(),
        is_timeout: entry.is_timeout,
        is_cancelled: entry.is_cancelled,
        is_user_error: entry.is_user_error,
        is_retryable: entry.is_retryable,
        actions,
    }
}

/// Whether a status query answering with `code` settles the payment. Still
/// processing markers and codes we do not recognise leave it pending, so a payment
/// that may yet succeed is never reported as failed.
pub fn settles_payment(code: &str) -> bool {
    match ResultCodeKey::parse(code) {
        ResultCodeKey::Timeout => false,
        ResultCodeKey::Provider(STILL_PROCESSING_CODE | QUERY_PROCESSING_CODE) => false,
        ResultCodeKey::Provider(code) => {
            !classify(code).allows_auto_retry() || FINAL_RETRYABLE_CODES.contains(&code)
        }
    }
}

/// Classification for the local polling timeout.
pub fn timeout() -> ErrorClassification {
    classify(TIMEOUT_CODE)
}
