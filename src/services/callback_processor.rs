use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::payments::error::PaymentError;
use crate::payments::providers::{parse_callback, ParsedCallback};
use crate::payments::types::ResolutionSource;
use crate::payments::utils::mask_phone;
use crate::services::payment_orchestrator::{
    OrchestratorError, PaymentOrchestrator, ResolutionKind, ResolutionResult,
};

#[derive(Debug, Error)]
pub enum CallbackProcessorError {
    #[error("Malformed callback: {0}")]
    Malformed(#[from] PaymentError),
    #[error("Processing error: {0}")]
    Processing(#[from] OrchestratorError),
}

/// What happened to one inbound callback. The webhook acknowledges every case, and
/// also a processing failure: the request stays pending and background resolution
/// picks it up. Only a malformed body is rejected.
#[derive(Debug)]
pub enum CallbackDisposition {
    Resolved(ResolutionResult),
    Duplicate(ResolutionResult),
    /// No request carries this checkout id.
    Unknown { checkout_request_id: String },
}

pub struct CallbackProcessor {
    orchestrator: Arc<PaymentOrchestrator>,
}

impl CallbackProcessor {
    pub fn new(orchestrator: Arc<PaymentOrchestrator>) -> Self {
        Self { orchestrator }
    }

    pub async fn process_callback(
        &self,
        payload: &[u8],
    ) -> Result<CallbackDisposition, CallbackProcessorError> {
        let callback = parse_callback(payload)?;
        self.process_parsed(callback).await
    }

    pub async fn process_parsed(
        &self,
        callback: ParsedCallback,
    ) -> Result<CallbackDisposition, CallbackProcessorError> {
        let Some(request) = self
            .orchestrator
            .find_by_checkout_request_id(&callback.checkout_request_id)
            .await?
        else {
            warn!(
                checkout_request_id = %callback.checkout_request_id,
                merchant_request_id = %callback.merchant_request_id,
                "callback for unknown checkout request"
            );
            return Ok(CallbackDisposition::Unknown {
                checkout_request_id: callback.checkout_request_id,
            });
        };

        if let Some(amount) = callback.amount {
            if amount != request.amount {
                warn!(
                    payment_request_id = %request.id,
                    expected = request.amount,
                    reported = amount,
                    "callback amount differs from requested amount"
                );
            }
        }

        info!(
            payment_request_id = %request.id,
            checkout_request_id = %callback.checkout_request_id,
            result_code = ?callback.outcome.result_code,
            phone = %callback.phone.as_deref().map(mask_phone).unwrap_or_default(),
            "mpesa callback received"
        );

        let result = self
            .orchestrator
            .apply_outcome(request.id, callback.outcome, ResolutionSource::Callback)
            .await?;

        Ok(match result.kind {
            ResolutionKind::Applied => CallbackDisposition::Resolved(result),
            _ => CallbackDisposition::Duplicate(result),
        })
    }
}
