use axum::extract::{Path, Query, State};
use axum::Json;

use crate::api::ApiResponse;
use crate::errors::AppError;
use crate::models::Alert;
use crate::store::AlertQuery;
use crate::AppState;

/// GET /api/alerts
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<AlertQuery>,
) -> Json<ApiResponse<Vec<Alert>>> {
    Json(ApiResponse::ok(state.store.alerts(&query)))
}

/// GET /api/alerts/:id
pub async fn detail(
    State(state): State<AppState>,
    Path(alert_id): Path<String>,
) -> Result<Json<ApiResponse<Alert>>, AppError> {
    state
        .store
        .alert(&alert_id)
        .map(|a| Json(ApiResponse::ok(a)))
        .ok_or_else(|| AppError::NotFound(format!("alert {alert_id}")))
}

/// POST /api/alerts/:id/acknowledge
pub async fn acknowledge(
    State(state): State<AppState>,
    Path(alert_id): Path<String>,
) -> Result<Json<ApiResponse<Alert>>, AppError> {
    if !state.store.acknowledge_alert(&alert_id) {
        return Err(AppError::NotFound(format!("alert {alert_id}")));
    }
    tracing::info!(alert_id = %alert_id, "Alert acknowledged");
    detail(State(state), Path(alert_id)).await
}
