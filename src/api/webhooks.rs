use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use tracing::{error, info, warn};

use crate::api::AppState;
use crate::error::{AppError, AppErrorKind, DomainError};
use crate::payments::utils::secure_eq;
use crate::services::callback_processor::{CallbackDisposition, CallbackProcessorError};

fn accepted() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({"ResultCode": 0, "ResultDesc": "Accepted"})),
    )
}

/// POST /webhooks/mpesa/{token}
///
/// Daraja does not sign callbacks, so the URL carries a secret token.
pub async fn handle_mpesa_callback(
    State(state): State<AppState>,
    Path(token): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    if !secure_eq(token.as_bytes(), state.callback_token.as_bytes()) {
        warn!("Rejected mpesa callback with invalid token");
        return AppError::new(AppErrorKind::Domain(DomainError::Unauthorized {
            reason: "invalid callback token".to_string(),
        }))
        .into_response();
    }

    match state.callbacks.process_callback(&body).await {
        Ok(CallbackDisposition::Resolved(result)) => {
            info!(
                payment_request_id = %result.request.id,
                status = %result.status(),
                "Callback resolved payment"
            );
            accepted().into_response()
        }
        Ok(CallbackDisposition::Duplicate(result)) => {
            info!(payment_request_id = %result.request.id, "Callback for already resolved payment");
            accepted().into_response()
        }
        Ok(CallbackDisposition::Unknown { .. }) => accepted().into_response(),
        Err(CallbackProcessorError::Malformed(e)) => {
            warn!(error = %e, "Malformed mpesa callback");
            (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"ResultCode": 1, "ResultDesc": "Rejected"})),
            )
                .into_response()
        }
        Err(e) => {
            // Acknowledged anyway: the pending request is picked up by background
            // resolution.
            error!(error = %e, "Mpesa callback processing failed");
            accepted().into_response()
        }
    }
}
