use crate::payments::error::PaymentResult;
use crate::payments::types::{GatewayStatus, StkPushRequest, StkPushResponse};
use async_trait::async_trait;

/// Push-payment gateway seam used by the orchestrator.
#[async_trait]
pub trait MobileMoneyGateway: Send + Sync {
    /// Send a push prompt to the payer's phone.
    async fn initiate_push(&self, request: StkPushRequest) -> PaymentResult<StkPushResponse>;

    /// Ask the provider directly for the state of an earlier push.
    async fn query_status(&self, checkout_request_id: &str) -> PaymentResult<GatewayStatus>;

    fn name(&self) -> &'static str;
}
