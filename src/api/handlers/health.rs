use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::db;
use crate::ingestion::poller::IngestState;
use crate::AppState;

/// GET /health: ingestion state, chain head and database reachability.
/// Only an unreachable configured database makes this a 503.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let ingest = state.ingest.borrow().clone();

    let db_status = match &state.db {
        Some(pool) if db::ping(pool).await => "connected",
        Some(_) => "disconnected",
        None => "disabled",
    };

    let status = if db_status == "disconnected" {
        "unhealthy"
    } else if ingest.state == IngestState::Disconnected {
        "degraded"
    } else {
        "healthy"
    };
    let code = if status == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        code,
        Json(json!({
            "status": status,
            "db": db_status,
            "ingest": ingest,
            "stored_trades": state.store.len(),
        })),
    )
}
