//! Safaricom Daraja (M-Pesa Express) gateway
//!
//! Covers the three provider touch points the engine needs: STK push initiation,
//! the STK push status query and decoding of the asynchronous STK callback.

use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::gateway::MobileMoneyGateway;
use crate::payments::taxonomy::{
    self, QUERY_PROCESSING_CODE, STILL_PROCESSING_CODE, SUCCESS_CODE,
};
use crate::payments::types::{GatewayStatus, PaymentOutcome, StkPushRequest, StkPushResponse};
use crate::payments::utils::{
    extract_error_code, mask_phone, HttpAuth, PaymentHttpClient, RetryPolicy,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{FixedOffset, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const PROVIDER: &str = "mpesa";
/// Daraja timestamps are East Africa Time.
const EAT_OFFSET_SECS: i32 = 3 * 3600;
/// Refresh the OAuth token this long before the provider says it expires.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct MpesaConfig {
    pub base_url: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub passkey: String,
    pub shortcode: String,
    pub transaction_type: String,
    pub callback_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for MpesaConfig {
    fn default() -> Self {
        Self {
            base_url: "https://sandbox.safaricom.co.ke".to_string(),
            consumer_key: String::new(),
            consumer_secret: String::new(),
            passkey: String::new(),
            shortcode: "174379".to_string(),
            transaction_type: "CustomerPayBillOnline".to_string(),
            callback_url: String::new(),
            timeout_secs: 30,
            max_retries: 2,
        }
    }
}

impl MpesaConfig {
    pub fn from_env() -> PaymentResult<Self> {
        let defaults = Self::default();
        let consumer_key = std::env::var("MPESA_CONSUMER_KEY").unwrap_or_default();
        let consumer_secret = std::env::var("MPESA_CONSUMER_SECRET").unwrap_or_default();
        let passkey = std::env::var("MPESA_PASSKEY").unwrap_or_default();
        let callback_url = std::env::var("MPESA_CALLBACK_URL").unwrap_or_default();
        if consumer_key.is_empty()
            || consumer_secret.is_empty()
            || passkey.is_empty()
            || callback_url.is_empty()
        {
            return Err(PaymentError::ValidationError {
                message: "MPESA_CONSUMER_KEY, MPESA_CONSUMER_SECRET, MPESA_PASSKEY and MPESA_CALLBACK_URL are required"
                    .to_string(),
                field: Some("mpesa".to_string()),
            });
        }

        Ok(Self {
            base_url: std::env::var("MPESA_BASE_URL").unwrap_or(defaults.base_url),
            shortcode: std::env::var("MPESA_SHORTCODE").unwrap_or(defaults.shortcode),
            transaction_type: std::env::var("MPESA_TRANSACTION_TYPE")
                .unwrap_or(defaults.transaction_type),
            timeout_secs: std::env::var("MPESA_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(defaults.timeout_secs),
            max_retries: std::env::var("MPESA_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(defaults.max_retries),
            consumer_key,
            consumer_secret,
            passkey,
            callback_url,
        })
    }

    /// Longest one status refresh can take: an OAuth call and the query, each with
    /// every retry timing out and the backoff sleeps between them.
    pub fn worst_case_status_refresh(&self) -> Duration {
        let tries = self.max_retries + 1;
        let per_call = Duration::from_secs(self.timeout_secs) * tries
            + Duration::from_secs((1u64 << self.max_retries.min(16)) - 1);
        per_call * 2
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

pub struct MpesaGateway {
    config: MpesaConfig,
    http: PaymentHttpClient,
    token: RwLock<Option<CachedToken>>,
}

impl MpesaGateway {
    pub fn new(config: MpesaConfig) -> PaymentResult<Self> {
        let http = PaymentHttpClient::new(
            PROVIDER,
            Duration::from_secs(config.timeout_secs),
            config.max_retries,
        )?;
        Ok(Self {
            config,
            http,
            token: RwLock::new(None),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn access_token(&self) -> PaymentResult<String> {
        if let Some(token) = self.token.read().await.as_ref() {
            if token.refresh_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let mut slot = self.token.write().await;
        if let Some(token) = slot.as_ref() {
            if token.refresh_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let raw: OAuthResponse = self
            .http
            .request_json(
                reqwest::Method::GET,
                &self.endpoint("/oauth/v1/generate?grant_type=client_credentials"),
                HttpAuth::Basic {
                    username: &self.config.consumer_key,
                    password: &self.config.consumer_secret,
                },
                None,
                RetryPolicy::Transient,
            )
            .await
            .map_err(|e| match e {
                PaymentError::AuthenticationError { .. } => e,
                other => PaymentError::AuthenticationError {
                    message: other.to_string(),
                },
            })?;

        let lifetime = raw
            .expires_in
            .as_ref()
            .and_then(|v| match v {
                JsonValue::String(s) => s.parse::<u64>().ok(),
                JsonValue::Number(n) => n.as_u64(),
                _ => None,
            })
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(3599));

        debug!(lifetime_secs = lifetime.as_secs(), "mpesa access token refreshed");
        *slot = Some(CachedToken {
            value: raw.access_token.clone(),
            refresh_at: Instant::now() + lifetime.saturating_sub(TOKEN_REFRESH_MARGIN),
        });
        Ok(raw.access_token)
    }

    fn timestamp() -> String {
        let now = Utc::now();
        match FixedOffset::east_opt(EAT_OFFSET_SECS) {
            Some(offset) => now.with_timezone(&offset).format("%Y%m%d%H%M%S").to_string(),
            None => now.format("%Y%m%d%H%M%S").to_string(),
        }
    }

    fn password(&self, timestamp: &str) -> String {
        STANDARD.encode(format!(
            "{}{}{}",
            self.config.shortcode, self.config.passkey, timestamp
        ))
    }
}

#[async_trait]
impl MobileMoneyGateway for MpesaGateway {
    async fn initiate_push(&self, request: StkPushRequest) -> PaymentResult<StkPushResponse> {
        if request.amount <= 0 {
            return Err(PaymentError::ValidationError {
                message: "amount must be greater than zero".to_string(),
                field: Some("amount".to_string()),
            });
        }

        let token = self.access_token().await?;
        let timestamp = Self::timestamp();
        let payload = serde_json::json!({
            "BusinessShortCode": self.config.shortcode,
            "Password": self.password(&timestamp),
            "Timestamp": timestamp,
            "TransactionType": self.config.transaction_type,
            "Amount": request.amount,
            "PartyA": request.phone,
            "PartyB": self.config.shortcode,
            "PhoneNumber": request.phone,
            "CallBackURL": self.config.callback_url,
            "AccountReference": request.account_reference,
            "TransactionDesc": request.description,
        });

        let raw: StkPushApiResponse = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint("/mpesa/stkpush/v1/processrequest"),
                HttpAuth::Bearer(&token),
                Some(&payload),
                // A resent push is a second PIN prompt with its own checkout id.
                RetryPolicy::ConnectOnly,
            )
            .await?;

        if raw.response_code.trim() != SUCCESS_CODE {
            let classification = taxonomy::classify(&raw.response_code);
            return Err(PaymentError::ProviderError {
                provider: PROVIDER.to_string(),
                message: raw
                    .response_description
                    .unwrap_or_else(|| classification.message.clone()),
                provider_code: Some(raw.response_code),
                retryable: classification.is_retryable,
            });
        }

        info!(
            checkout_request_id = %raw.checkout_request_id,
            phone = %mask_phone(&request.phone),
            amount = request.amount,
            "mpesa push payment initiated"
        );

        Ok(StkPushResponse {
            checkout_request_id: raw.checkout_request_id,
            merchant_request_id: raw.merchant_request_id,
            customer_message: raw.customer_message,
        })
    }

    async fn query_status(&self, checkout_request_id: &str) -> PaymentResult<GatewayStatus> {
        let token = self.access_token().await?;
        let timestamp = Self::timestamp();
        let payload = serde_json::json!({
            "BusinessShortCode": self.config.shortcode,
            "Password": self.password(&timestamp),
            "Timestamp": timestamp,
            "CheckoutRequestID": checkout_request_id,
        });

        let raw: JsonValue = match self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint("/mpesa/stkpushquery/v1/query"),
                HttpAuth::Bearer(&token),
                Some(&payload),
                RetryPolicy::Transient,
            )
            .await
        {
            Ok(raw) => raw,
            Err(e) if e.provider_code() == Some(STILL_PROCESSING_CODE) => {
                debug!(checkout_request_id, "mpesa reports payment still processing");
                return Ok(GatewayStatus::Processing);
            }
            Err(e) => return Err(e),
        };

        let result_code = match extract_error_code(&raw) {
            Some(code) => code,
            None => {
                warn!(checkout_request_id, "mpesa status query returned no result code");
                return Ok(GatewayStatus::Processing);
            }
        };
        if result_code == QUERY_PROCESSING_CODE {
            debug!(checkout_request_id, "mpesa reports transaction still under processing");
            return Ok(GatewayStatus::Processing);
        }
        let result_desc = raw
            .get("ResultDesc")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        Ok(GatewayStatus::Resolved(PaymentOutcome::from_result_code(
            &result_code,
            result_desc,
            None,
        )))
    }

    fn name(&self) -> &'static str {
        PROVIDER
    }
}

#[derive(Debug, Deserialize)]
struct OAuthResponse {
    access_token: String,
    expires_in: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct StkPushApiResponse {
    #[serde(rename = "MerchantRequestID", default)]
    merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID", default)]
    checkout_request_id: String,
    #[serde(rename = "ResponseCode")]
    response_code: String,
    #[serde(rename = "ResponseDescription")]
    response_description: Option<String>,
    #[serde(rename = "CustomerMessage")]
    customer_message: Option<String>,
}

// ---------------------------------------------------------------------------
// Callback payload
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct MpesaCallbackRequest {
    #[serde(rename = "Body")]
    pub body: MpesaCallbackBody,
}

#[derive(Debug, Deserialize)]
pub struct MpesaCallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: MpesaStkCallback,
}

#[derive(Debug, Deserialize)]
pub struct MpesaStkCallback {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResultCode")]
    pub result_code: JsonValue,
    #[serde(rename = "ResultDesc")]
    pub result_desc: Option<String>,
    #[serde(rename = "CallbackMetadata")]
    pub callback_metadata: Option<MpesaCallbackMetadata>,
}

#[derive(Debug, Deserialize)]
pub struct MpesaCallbackMetadata {
    #[serde(rename = "Item", default)]
    pub item: Vec<MpesaCallbackItem>,
}

#[derive(Debug, Deserialize)]
pub struct MpesaCallbackItem {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value", default)]
    pub value: JsonValue,
}

/// Callback reduced to what the engine needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCallback {
    pub checkout_request_id: String,
    pub merchant_request_id: String,
    pub outcome: PaymentOutcome,
    pub amount: Option<i64>,
    pub phone: Option<String>,
}

impl MpesaStkCallback {
    fn metadata_value(&self, name: &str) -> Option<&JsonValue> {
        self.callback_metadata
            .as_ref()?
            .item
            .iter()
            .find(|item| item.name == name)
            .map(|item| &item.value)
    }
}

/// Decode an STK callback body.
pub fn parse_callback(payload: &[u8]) -> PaymentResult<ParsedCallback> {
    let request: MpesaCallbackRequest =
        serde_json::from_slice(payload).map_err(|e| PaymentError::CallbackVerificationError {
            message: format!("malformed mpesa callback: {}", e),
        })?;
    let callback = request.body.stk_callback;

    let result_code = match &callback.result_code {
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) => s.trim().to_string(),
        _ => {
            return Err(PaymentError::CallbackVerificationError {
                message: "mpesa callback has no ResultCode".to_string(),
            })
        }
    };

    let receipt = callback
        .metadata_value("MpesaReceiptNumber")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let amount = callback.metadata_value("Amount").and_then(|v| match v {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        JsonValue::String(s) => s.parse::<i64>().ok(),
        _ => None,
    });
    let phone = callback.metadata_value("PhoneNumber").and_then(|v| match v {
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::String(s) => Some(s.clone()),
        _ => None,
    });

    Ok(ParsedCallback {
        outcome: PaymentOutcome::from_result_code(&result_code, callback.result_desc.clone(), receipt),
        checkout_request_id: callback.checkout_request_id,
        merchant_request_id: callback.merchant_request_id,
        amount,
        phone,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::PaymentStatus;
    use mockito::{Matcher, Server};

    fn test_config(base_url: String) -> MpesaConfig {
        MpesaConfig {
            base_url,
            consumer_key: "key".to_string(),
            consumer_secret: "secret".to_string(),
            passkey: "passkey".to_string(),
            callback_url: "https://example.com/webhooks/mpesa/token".to_string(),
            max_retries: 0,
            ..Default::default()
        }
    }

    async fn mock_token(server: &mut Server) -> mockito::Mock {
        server
            .mock("GET", "/oauth/v1/generate")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"tok123","expires_in":"3599"}"#)
            .create_async()
            .await
    }

    #[tokio::test]
    async fn push_returns_correlation_ids() {
        let mut server = Server::new_async().await;
        let token = mock_token(&mut server).await;
        let push = server
            .mock("POST", "/mpesa/stkpush/v1/processrequest")
            .match_header("authorization", "Bearer tok123")
            .with_status(200)
            .with_body(
                r#"{"MerchantRequestID":"29115-34620561-1","CheckoutRequestID":"ws_CO_191220191020363925","ResponseCode":"0","ResponseDescription":"Success. Request accepted for processing","CustomerMessage":"Success. Request accepted for processing"}"#,
            )
            .create_async()
            .await;

        let gateway = MpesaGateway::new(test_config(server.url())).unwrap();
        let response = gateway
            .initiate_push(StkPushRequest {
                amount: 1048,
                phone: "254712345678".to_string(),
                account_reference: "BIMA-1".to_string(),
                description: "Deposit".to_string(),
            })
            .await
            .expect("push should succeed");

        assert_eq!(response.checkout_request_id, "ws_CO_191220191020363925");
        assert_eq!(response.merchant_request_id, "29115-34620561-1");
        token.assert_async().await;
        push.assert_async().await;
    }

    #[tokio::test]
    async fn token_is_cached_between_calls() {
        let mut server = Server::new_async().await;
        let token = server
            .mock("GET", "/oauth/v1/generate")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"access_token":"tok123","expires_in":"3599"}"#)
            .expect(1)
            .create_async()
            .await;
        let _query = server
            .mock("POST", "/mpesa/stkpushquery/v1/query")
            .with_status(200)
            .with_body(r#"{"ResponseCode":"0","ResultCode":"0","ResultDesc":"The service request is processed successfully."}"#)
            .expect(2)
            .create_async()
            .await;

        let gateway = MpesaGateway::new(test_config(server.url())).unwrap();
        gateway.query_status("ws_CO_1").await.unwrap();
        gateway.query_status("ws_CO_1").await.unwrap();
        token.assert_async().await;
    }

    #[tokio::test]
    async fn query_maps_still_processing_to_pending() {
        let mut server = Server::new_async().await;
        let _token = mock_token(&mut server).await;
        let _query = server
            .mock("POST", "/mpesa/stkpushquery/v1/query")
            .with_status(500)
            .with_body(r#"{"requestId":"1","errorCode":"500.001.1001","errorMessage":"The transaction is being processed"}"#)
            .create_async()
            .await;

        let gateway = MpesaGateway::new(test_config(server.url())).unwrap();
        let status = gateway.query_status("ws_CO_1").await.unwrap();
        assert_eq!(status, GatewayStatus::Processing);
    }

    #[tokio::test]
    async fn query_maps_result_codes_to_outcomes() {
        let mut server = Server::new_async().await;
        let _token = mock_token(&mut server).await;
        let _query = server
            .mock("POST", "/mpesa/stkpushquery/v1/query")
            .with_status(200)
            .with_body(r#"{"ResponseCode":"0","ResultCode":"1032","ResultDesc":"Request cancelled by user"}"#)
            .create_async()
            .await;

        let gateway = MpesaGateway::new(test_config(server.url())).unwrap();
        match gateway.query_status("ws_CO_1").await.unwrap() {
            GatewayStatus::Resolved(outcome) => {
                assert_eq!(outcome.status, PaymentStatus::Cancelled);
                assert_eq!(outcome.result_code.as_deref(), Some("1032"));
            }
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[tokio::test]
    async fn query_surfaces_other_provider_errors() {
        let mut server = Server::new_async().await;
        let _token = mock_token(&mut server).await;
        let _query = server
            .mock("POST", "/mpesa/stkpushquery/v1/query")
            .with_status(400)
            .with_body(r#"{"requestId":"1","errorCode":"400.002.02","errorMessage":"Bad Request - Invalid CheckoutRequestID"}"#)
            .create_async()
            .await;

        let gateway = MpesaGateway::new(test_config(server.url())).unwrap();
        let err = gateway.query_status("bogus").await.unwrap_err();
        assert_eq!(err.provider_code(), Some("400.002.02"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn rejected_push_is_an_error() {
        let mut server = Server::new_async().await;
        let _token = mock_token(&mut server).await;
        let _push = server
            .mock("POST", "/mpesa/stkpush/v1/processrequest")
            .with_status(400)
            .with_body(r#"{"requestId":"1","errorCode":"400.002.02","errorMessage":"Bad Request - Invalid PhoneNumber"}"#)
            .create_async()
            .await;

        let gateway = MpesaGateway::new(test_config(server.url())).unwrap();
        let err = gateway
            .initiate_push(StkPushRequest {
                amount: 87,
                phone: "254712345678".to_string(),
                account_reference: "BIMA-2".to_string(),
                description: "Daily payment".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::ProviderError { .. }));
    }

    #[test]
    fn worst_case_refresh_covers_token_and_query_retries() {
        let config = MpesaConfig::default();
        // (30s x 3 tries + 1s + 2s backoff) for each of the two calls.
        assert_eq!(config.worst_case_status_refresh(), Duration::from_secs(186));
        let no_retries = MpesaConfig {
            max_retries: 0,
            timeout_secs: 10,
            ..MpesaConfig::default()
        };
        assert_eq!(no_retries.worst_case_status_refresh(), Duration::from_secs(20));
    }

    #[tokio::test]
    async fn push_is_sent_once_when_gateway_times_out() {
        let mut server = Server::new_async().await;
        let _token = mock_token(&mut server).await;
        let push = server
            .mock("POST", "/mpesa/stkpush/v1/processrequest")
            .with_status(504)
            .expect(1)
            .create_async()
            .await;

        let gateway = MpesaGateway::new(MpesaConfig {
            max_retries: 2,
            ..test_config(server.url())
        })
        .unwrap();
        let err = gateway
            .initiate_push(StkPushRequest {
                amount: 1048,
                phone: "254712345678".to_string(),
                account_reference: "BIMA-3".to_string(),
                description: "Deposit".to_string(),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, PaymentError::ProviderError { .. }));
        push.assert_async().await;
    }

    #[tokio::test]
    async fn query_reporting_still_under_processing_is_pending() {
        let mut server = Server::new_async().await;
        let _token = mock_token(&mut server).await;
        let _query = server
            .mock("POST", "/mpesa/stkpushquery/v1/query")
            .with_status(200)
            .with_body(r#"{"ResponseCode":"0","ResultCode":"4999","ResultDesc":"The transaction is still under processing"}"#)
            .create_async()
            .await;

        let gateway = MpesaGateway::new(test_config(server.url())).unwrap();
        assert_eq!(
            gateway.query_status("ws_CO_1").await.unwrap(),
            GatewayStatus::Processing
        );
    }

    #[test]
    fn successful_callback_is_parsed() {
        let payload = serde_json::json!({
            "Body": {"stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": "ws_CO_191220191020363925",
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "CallbackMetadata": {"Item": [
                    {"Name": "Amount", "Value": 1048.00},
                    {"Name": "MpesaReceiptNumber", "Value": "ABC123"},
                    {"Name": "TransactionDate", "Value": 20191219102115u64},
                    {"Name": "PhoneNumber", "Value": 254712345678u64}
                ]}
            }}
        });
        let parsed = parse_callback(payload.to_string().as_bytes()).unwrap();
        assert_eq!(parsed.checkout_request_id, "ws_CO_191220191020363925");
        assert_eq!(parsed.outcome.status, PaymentStatus::Completed);
        assert_eq!(parsed.outcome.receipt_number.as_deref(), Some("ABC123"));
        assert_eq!(parsed.amount, Some(1048));
        assert_eq!(parsed.phone.as_deref(), Some("254712345678"));
    }

    #[test]
    fn failed_callback_has_no_receipt() {
        let payload = serde_json::json!({
            "Body": {"stkCallback": {
                "MerchantRequestID": "m1",
                "CheckoutRequestID": "c1",
                "ResultCode": 2001,
                "ResultDesc": "The initiator information is invalid."
            }}
        });
        let parsed = parse_callback(payload.to_string().as_bytes()).unwrap();
        assert_eq!(parsed.outcome.status, PaymentStatus::Failed);
        assert_eq!(parsed.outcome.result_code.as_deref(), Some("2001"));
        assert!(parsed.outcome.receipt_number.is_none());
    }

    #[test]
    fn malformed_callback_is_rejected() {
        assert!(parse_callback(b"{\"Body\":{}}").is_err());
    }

    #[test]
    fn password_is_base64_of_shortcode_passkey_timestamp() {
        let gateway = MpesaGateway::new(test_config("http://localhost".to_string())).unwrap();
        let expected = STANDARD.encode("174379passkey20240101120000");
        assert_eq!(gateway.password("20240101120000"), expected);
    }
}
