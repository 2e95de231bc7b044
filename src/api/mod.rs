//! HTTP surface: client payment API, provider callbacks, back-office and health.

pub mod admin;
pub mod payments;
pub mod webhooks;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};

use crate::health::{HealthChecker, HealthState, HealthStatus};
use crate::middleware::logging::{request_logging_middleware, UuidRequestId};
use crate::services::callback_processor::CallbackProcessor;
use crate::services::payment_orchestrator::PaymentOrchestrator;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<PaymentOrchestrator>,
    pub callbacks: Arc<CallbackProcessor>,
    pub health_checker: HealthChecker,
    /// Secret path segment of the provider callback URL.
    pub callback_token: Arc<str>,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<PaymentOrchestrator>,
        health_checker: HealthChecker,
        callback_token: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            callbacks: Arc::new(CallbackProcessor::new(orchestrator.clone())),
            orchestrator,
            health_checker,
            callback_token: callback_token.into(),
        }
    }
}

/// Application router with request id and request logging layers.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/health/live", get(liveness))
        .route("/api/payments", post(payments::initiate_payment))
        .route("/api/payments/{id}", get(payments::get_payment))
        .route("/api/payments/{id}/refresh", post(payments::refresh_payment))
        .route("/api/payments/{id}/defer", post(payments::defer_payment))
        .route(
            "/api/admin/reconciliation",
            get(admin::list_reconciliation),
        )
        .route(
            "/webhooks/mpesa/{token}",
            post(webhooks::handle_mpesa_callback),
        )
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
                .layer(axum::middleware::from_fn(request_logging_middleware))
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
}

async fn root() -> &'static str {
    "Bima payment engine"
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthStatus>) {
    let status = state.health_checker.check_health().await;
    let code = match status.status {
        HealthState::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthState::Healthy | HealthState::Degraded => StatusCode::OK,
    };
    (code, Json(status))
}

async fn liveness() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "alive" }))
}
