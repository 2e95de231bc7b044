//! Shared harness: in-memory stores, a manual clock and a scripted gateway.
#![allow(dead_code)]

use async_trait::async_trait;
use bima_backend::clock::{Clock, ManualClock};
use bima_backend::database::memory::{
    MemoryLedger, MemoryPaymentRequestStore, MemoryResolutionJobStore,
};
use bima_backend::payments::error::{PaymentError, PaymentResult};
use bima_backend::payments::gateway::MobileMoneyGateway;
use bima_backend::payments::types::{
    GatewayStatus, PaymentType, StkPushRequest, StkPushResponse,
};
use bima_backend::services::notification::{Notifier, NotifyError, OutcomeNotice};
use bima_backend::services::payment_orchestrator::{
    InitiatePayment, OrchestratorConfig, PaymentOrchestrator,
};
use chrono::{TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

pub const PHONE: &str = "0712345678";

/// Gateway whose answers are queued up front. An empty query script answers
/// "still processing".
#[derive(Default)]
pub struct ScriptedGateway {
    pushes: AtomicUsize,
    queries: AtomicUsize,
    push_failure: Mutex<Option<PaymentError>>,
    push_delay: Mutex<Option<Duration>>,
    query_script: Mutex<VecDeque<PaymentResult<GatewayStatus>>>,
    last_push: Mutex<Option<StkPushRequest>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_pushes_with(&self, error: PaymentError) {
        *self.push_failure.lock().unwrap() = Some(error);
    }

    pub fn delay_pushes(&self, delay: Duration) {
        *self.push_delay.lock().unwrap() = Some(delay);
    }

    pub fn script_query(&self, answer: PaymentResult<GatewayStatus>) {
        self.query_script.lock().unwrap().push_back(answer);
    }

    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn last_push(&self) -> Option<StkPushRequest> {
        self.last_push.lock().unwrap().clone()
    }
}

#[async_trait]
impl MobileMoneyGateway for ScriptedGateway {
    async fn initiate_push(&self, request: StkPushRequest) -> PaymentResult<StkPushResponse> {
        let delay = *self.push_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.push_failure.lock().unwrap().clone() {
            return Err(error);
        }
        let n = self.pushes.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_push.lock().unwrap() = Some(request);
        Ok(StkPushResponse {
            checkout_request_id: format!("ws_CO_{:04}", n),
            merchant_request_id: format!("29115-{:04}", n),
            customer_message: Some("Success. Request accepted for processing".to_string()),
        })
    }

    async fn query_status(&self, _checkout_request_id: &str) -> PaymentResult<GatewayStatus> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.query_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(GatewayStatus::Processing))
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

#[derive(Debug, Clone)]
pub struct SentNotice {
    pub user_id: Uuid,
    pub payment_request_id: Uuid,
    pub notice: OutcomeNotice,
}

/// Notices are delivered on spawned tasks; `delivered` waits for them.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentNotice>>,
    failing: Mutex<bool>,
    stalled: Mutex<bool>,
    arrived: Notify,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<SentNotice> {
        self.sent.lock().unwrap().clone()
    }

    /// Wait until at least `count` notices arrived, then give a moment for any
    /// unexpected extra one to land.
    pub async fn delivered(&self, count: usize) -> Vec<SentNotice> {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.sent.lock().unwrap().len() < count {
                self.arrived.notified().await;
            }
        })
        .await
        .expect("notices were not delivered");
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        self.sent()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    /// Record notices but never finish delivering them.
    pub fn set_stalled(&self, stalled: bool) {
        *self.stalled.lock().unwrap() = stalled;
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_outcome(
        &self,
        user_id: Uuid,
        payment_request_id: Uuid,
        notice: &OutcomeNotice,
    ) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(SentNotice {
            user_id,
            payment_request_id,
            notice: notice.clone(),
        });
        self.arrived.notify_one();
        let stalled = *self.stalled.lock().unwrap();
        if stalled {
            std::future::pending::<()>().await;
        }
        if *self.failing.lock().unwrap() {
            return Err(NotifyError::Unavailable("sms gateway down".to_string()));
        }
        Ok(())
    }
}

pub struct Harness {
    pub orchestrator: Arc<PaymentOrchestrator>,
    pub store: Arc<MemoryPaymentRequestStore>,
    pub jobs: Arc<MemoryResolutionJobStore>,
    pub ledger: Arc<MemoryLedger>,
    pub gateway: Arc<ScriptedGateway>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: Arc<ManualClock>,
    pub user_id: Uuid,
    pub wallet_id: Uuid,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(OrchestratorConfig::default())
    }

    pub fn with_config(config: OrchestratorConfig) -> Self {
        let store = Arc::new(MemoryPaymentRequestStore::new());
        let jobs = Arc::new(MemoryResolutionJobStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        let gateway = Arc::new(ScriptedGateway::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap(),
        ));

        let user_id = Uuid::new_v4();
        let wallet_id = Uuid::new_v4();
        ledger.add_wallet(wallet_id, user_id);

        let orchestrator = Arc::new(PaymentOrchestrator::new(
            store.clone(),
            jobs.clone(),
            gateway.clone(),
            ledger.clone(),
            notifier.clone(),
            clock.clone() as Arc<dyn Clock>,
            config,
        ));

        Self {
            orchestrator,
            store,
            jobs,
            ledger,
            gateway,
            notifier,
            clock,
            user_id,
            wallet_id,
        }
    }

    pub fn deposit(&self, key: &str) -> InitiatePayment {
        InitiatePayment {
            user_id: self.user_id,
            wallet_id: self.wallet_id,
            payment_type: PaymentType::Deposit,
            amount: 1048,
            phone: PHONE.to_string(),
            idempotency_key: key.to_string(),
            days_count: 1,
        }
    }

    pub fn daily(&self, key: &str, days: i32) -> InitiatePayment {
        InitiatePayment {
            user_id: self.user_id,
            wallet_id: self.wallet_id,
            payment_type: PaymentType::Daily,
            amount: 87 * days as i64,
            phone: PHONE.to_string(),
            idempotency_key: key.to_string(),
            days_count: days,
        }
    }

    pub fn advance_secs(&self, secs: i64) {
        self.clock.advance(chrono::Duration::seconds(secs));
    }
}

/// Daraja STK callback body.
pub fn callback_body(checkout_request_id: &str, result_code: i64, receipt: Option<&str>, amount: i64) -> serde_json::Value {
    let mut callback = serde_json::json!({
        "MerchantRequestID": "29115-0001",
        "CheckoutRequestID": checkout_request_id,
        "ResultCode": result_code,
        "ResultDesc": match result_code {
            0 => "The service request is processed successfully.",
            1032 => "Request cancelled by user",
            2001 => "The initiator information is invalid.",
            _ => "Failed",
        },
    });
    if let Some(receipt) = receipt {
        callback["CallbackMetadata"] = serde_json::json!({
            "Item": [
                {"Name": "Amount", "Value": amount},
                {"Name": "MpesaReceiptNumber", "Value": receipt},
                {"Name": "TransactionDate", "Value": 20260302080105u64},
                {"Name": "PhoneNumber", "Value": 254712345678u64}
            ]
        });
    }
    serde_json::json!({ "Body": { "stkCallback": callback } })
}
