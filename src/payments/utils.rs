use crate::payments::error::{PaymentError, PaymentResult};
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::warn;

/// Credentials attached to an outgoing provider request.
#[derive(Debug, Clone, Copy)]
pub enum HttpAuth<'a> {
    None,
    Bearer(&'a str),
    Basic { username: &'a str, password: &'a str },
}

/// When a failed provider call may be sent again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Retry transport failures and 429/502/503/504 answers. Only for calls the
    /// provider treats as reads.
    Transient,
    /// Retry only when the connection could not be opened, so the provider never
    /// saw the request. Used for calls that create something at the provider.
    ConnectOnly,
}

#[derive(Clone)]
pub struct PaymentHttpClient {
    client: Client,
    provider: &'static str,
    timeout: Duration,
    max_retries: u32,
}

impl PaymentHttpClient {
    pub fn new(provider: &'static str, timeout: Duration, max_retries: u32) -> PaymentResult<Self> {
        let client =
            Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| PaymentError::NetworkError {
                    message: format!("failed to initialize HTTP client: {}", e),
                })?;

        Ok(Self {
            client,
            provider,
            timeout,
            max_retries,
        })
    }

    /// Send a request and decode a JSON body.
    ///
    /// Failures the `retry` policy allows are retried with exponential backoff. Any
    /// other non-success answer is decoded into a `ProviderError` that carries the
    /// provider's own error code so callers can classify it.
    pub async fn request_json<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: &str,
        auth: HttpAuth<'_>,
        body: Option<&JsonValue>,
        retry: RetryPolicy,
    ) -> PaymentResult<T> {
        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            let mut request = self.client.request(method.clone(), url);
            request = request.timeout(self.timeout);

            match auth {
                HttpAuth::None => {}
                HttpAuth::Bearer(token) => request = request.bearer_auth(token),
                HttpAuth::Basic { username, password } => {
                    request = request.basic_auth(username, Some(password))
                }
            }
            if let Some(payload) = body {
                request = request.json(payload);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    if status.is_success() {
                        return serde_json::from_str::<T>(&text).map_err(|e| {
                            PaymentError::ProviderError {
                                provider: self.provider.to_string(),
                                message: format!("invalid provider JSON response: {}", e),
                                provider_code: None,
                                retryable: false,
                            }
                        });
                    }

                    if retry == RetryPolicy::Transient
                        && is_transient(status)
                        && attempt < self.max_retries
                    {
                        warn!(
                            provider = self.provider,
                            status = %status,
                            attempt = attempt + 1,
                            "provider temporarily unavailable, retrying"
                        );
                        tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                        continue;
                    }

                    return Err(self.error_from_response(status, &text));
                }
                Err(e) => {
                    let may_resend = match retry {
                        RetryPolicy::Transient => true,
                        RetryPolicy::ConnectOnly => e.is_connect(),
                    };
                    last_error = Some(PaymentError::NetworkError {
                        message: format!("provider request failed: {}", e),
                    });
                    if may_resend && attempt < self.max_retries {
                        warn!(
                            provider = self.provider,
                            attempt = attempt + 1,
                            error = %e,
                            "provider request failed, retrying"
                        );
                        tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                        continue;
                    }
                    break;
                }
            }
        }

        Err(last_error.unwrap_or(PaymentError::NetworkError {
            message: "provider request failed".to_string(),
        }))
    }

    fn error_from_response(&self, status: StatusCode, text: &str) -> PaymentError {
        if status == StatusCode::TOO_MANY_REQUESTS {
            return PaymentError::RateLimitError {
                message: "provider rate limit exceeded".to_string(),
                retry_after_seconds: None,
            };
        }
        if status == StatusCode::UNAUTHORIZED {
            return PaymentError::AuthenticationError {
                message: format!("HTTP {}: {}", status, text),
            };
        }

        let parsed: Option<JsonValue> = serde_json::from_str(text).ok();
        let provider_code = parsed.as_ref().and_then(extract_error_code);
        let message = parsed
            .as_ref()
            .and_then(|v| {
                v.get("errorMessage")
                    .or_else(|| v.get("ResultDesc"))
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| format!("HTTP {}: {}", status, text));

        PaymentError::ProviderError {
            provider: self.provider.to_string(),
            message,
            provider_code: provider_code.or_else(|| Some(status.as_u16().to_string())),
            retryable: status.is_server_error(),
        }
    }
}

fn is_transient(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

/// Pull a provider error code out of a JSON error body. Daraja uses `errorCode`
/// for API errors and `ResultCode` (string or number) for business results.
pub fn extract_error_code(body: &JsonValue) -> Option<String> {
    body.get("errorCode")
        .or_else(|| body.get("ResultCode"))
        .and_then(|v| match v {
            JsonValue::String(s) => Some(s.trim().to_string()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

fn msisdn_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^254[17]\d{8}$").expect("valid MSISDN pattern"))
}

/// Normalize a Kenyan mobile number to the `2547XXXXXXXX` / `2541XXXXXXXX` form the
/// gateway expects. Accepts local (`07..`), bare (`7..`) and international
/// (`+254..`) spellings with spaces or dashes.
pub fn normalize_phone(raw: &str) -> PaymentResult<String> {
    let digits: String = raw
        .trim()
        .trim_start_matches('+')
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')'))
        .collect();

    let normalized = if digits.len() == 10 && digits.starts_with('0') {
        format!("254{}", &digits[1..])
    } else if digits.len() == 9 && (digits.starts_with('7') || digits.starts_with('1')) {
        format!("254{}", digits)
    } else {
        digits
    };

    if msisdn_pattern().is_match(&normalized) {
        Ok(normalized)
    } else {
        Err(PaymentError::ValidationError {
            message: format!("invalid mobile number: {}", mask_phone(raw)),
            field: Some("phone".to_string()),
        })
    }
}

/// Mask all but the last three digits of a phone number for logs and messages.
pub fn mask_phone(phone: &str) -> String {
    let chars: Vec<char> = phone.trim().chars().collect();
    if chars.len() <= 3 {
        return "***".to_string();
    }
    let visible: String = chars[chars.len() - 3..].iter().collect();
    format!("{}{}", "*".repeat(chars.len() - 3), visible)
}

pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0_u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
