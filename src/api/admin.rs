//! Back-office endpoints

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::api::AppState;
use crate::error::AppError;
use crate::middleware::error::{get_request_id_from_headers, success_response_with_meta};

const MAX_LIMIT: i64 = 500;

#[derive(Debug, Deserialize)]
pub struct ReconciliationQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

#[derive(Debug, Serialize)]
pub struct ReconciliationMeta {
    pub count: usize,
    pub limit: i64,
}

/// GET /api/admin/reconciliation
///
/// Pending payments the background queue gave up on. They are never failed
/// automatically; an operator settles them against the provider statement.
pub async fn list_reconciliation(
    State(state): State<AppState>,
    Query(query): Query<ReconciliationQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let limit = query.limit.clamp(1, MAX_LIMIT);
    let flagged = state
        .orchestrator
        .list_reconciliation(limit)
        .await
        .map_err(|e| {
            let error = AppError::from(e);
            match get_request_id_from_headers(&headers) {
                Some(id) => error.with_request_id(id),
                None => error,
            }
        })?;

    let meta = ReconciliationMeta {
        count: flagged.len(),
        limit,
    };
    Ok(success_response_with_meta(flagged, meta).into_response())
}
