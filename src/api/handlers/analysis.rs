use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::api::ApiResponse;
use crate::detection::AnalysisReport;
use crate::errors::AppError;
use crate::AppState;

/// POST /api/analysis/run: full batch analysis over the current store.
/// Answers 409 while another run is in progress.
pub async fn run(State(state): State<AppState>) -> Result<Json<ApiResponse<AnalysisReport>>, AppError> {
    let report = state.analysis.run().await?;
    Ok(Json(ApiResponse::ok(report)))
}

/// POST /api/analysis/cancel
pub async fn cancel(State(state): State<AppState>) -> Json<ApiResponse<Value>> {
    let cancelled = state.analysis.cancel();
    if cancelled {
        tracing::warn!("Full analysis cancellation requested");
    }
    Json(ApiResponse::ok(json!({ "cancelled": cancelled })))
}

/// GET /api/analysis: the last completed report, if any.
pub async fn last(State(state): State<AppState>) -> Json<ApiResponse<Value>> {
    Json(ApiResponse::ok(json!({
        "running": state.analysis.is_running(),
        "last_report": state.analysis.last_report(),
    })))
}
