//! Client payment endpoints

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::api::AppState;
use crate::error::{AppError, AppErrorKind, ValidationError};
use crate::middleware::error::{get_request_id_from_headers, success_response, success_response_with_meta};
use crate::payments::taxonomy::ErrorClassification;
use crate::payments::types::PaymentType;
use crate::services::payment_orchestrator::{
    InitiatePayment, PaymentRequestView, ResolutionKind, ResolutionResult,
};

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

#[derive(Debug, Deserialize)]
pub struct InitiatePaymentBody {
    pub user_id: Uuid,
    pub wallet_id: Uuid,
    pub payment_type: PaymentType,
    pub amount: i64,
    pub phone: String,
    #[serde(default = "default_days_count")]
    pub days_count: i32,
    /// Used when the `Idempotency-Key` header is absent.
    pub idempotency_key: Option<String>,
}

fn default_days_count() -> i32 {
    1
}

#[derive(Debug, Serialize)]
pub struct InitiateMeta {
    pub created: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshOutcome {
    Applied,
    AlreadyResolved,
    StillPending,
    GatewayError,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub payment: PaymentRequestView,
    pub outcome: RefreshOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_error: Option<GatewayErrorBody>,
}

#[derive(Debug, Serialize)]
pub struct GatewayErrorBody {
    pub message: String,
    pub provider_code: Option<String>,
    pub retryable: bool,
}

impl From<ResolutionResult> for RefreshResponse {
    fn from(result: ResolutionResult) -> Self {
        let payment = PaymentRequestView::from(&result.request);
        let (outcome, gateway_error) = match result.kind {
            ResolutionKind::Applied => (RefreshOutcome::Applied, None),
            ResolutionKind::AlreadyResolved => (RefreshOutcome::AlreadyResolved, None),
            ResolutionKind::StillPending => (RefreshOutcome::StillPending, None),
            ResolutionKind::GatewayError {
                message,
                provider_code,
                retryable,
            } => (
                RefreshOutcome::GatewayError,
                Some(GatewayErrorBody {
                    message,
                    provider_code,
                    retryable,
                }),
            ),
        };
        Self {
            payment,
            outcome,
            gateway_error,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DeferResponse {
    pub payment: PaymentRequestView,
    pub delayed: bool,
    pub classification: ErrorClassification,
    pub next_attempt_at: DateTime<Utc>,
}

fn tagged(error: impl Into<AppError>, headers: &HeaderMap) -> AppError {
    let error = error.into();
    match get_request_id_from_headers(headers) {
        Some(id) => error.with_request_id(id),
        None => error,
    }
}

/// POST /api/payments
pub async fn initiate_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<InitiatePaymentBody>,
) -> Result<Response, AppError> {
    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(body.idempotency_key)
        .ok_or_else(|| {
            tagged(
                AppError::new(AppErrorKind::Validation(ValidationError::MissingField {
                    field: "idempotency_key".to_string(),
                })),
                &headers,
            )
        })?;

    let initiation = state
        .orchestrator
        .initiate(InitiatePayment {
            user_id: body.user_id,
            wallet_id: body.wallet_id,
            payment_type: body.payment_type,
            amount: body.amount,
            phone: body.phone,
            idempotency_key,
            days_count: body.days_count,
        })
        .await
        .map_err(|e| tagged(e, &headers))?;

    let status = if initiation.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    let view = PaymentRequestView::from(&initiation.request);
    Ok((
        status,
        success_response_with_meta(
            view,
            InitiateMeta {
                created: initiation.created,
            },
        ),
    )
        .into_response())
}

/// GET /api/payments/{id}
pub async fn get_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let view = state
        .orchestrator
        .get_status(id)
        .await
        .map_err(|e| tagged(e, &headers))?;
    Ok(success_response(view).into_response())
}

/// POST /api/payments/{id}/refresh
pub async fn refresh_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let result = state
        .orchestrator
        .refresh_from_gateway(id)
        .await
        .map_err(|e| tagged(e, &headers))?;
    Ok(success_response(RefreshResponse::from(result)).into_response())
}

/// POST /api/payments/{id}/defer
pub async fn defer_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let deferred = state
        .orchestrator
        .defer_resolution(id)
        .await
        .map_err(|e| tagged(e, &headers))?;

    info!(payment_request_id = %id, "client handed payment to background resolution");
    let body = DeferResponse {
        payment: PaymentRequestView::from(&deferred.request),
        delayed: true,
        classification: deferred.classification,
        next_attempt_at: deferred.job.next_attempt_at,
    };
    Ok((StatusCode::ACCEPTED, success_response(body)).into_response())
}
