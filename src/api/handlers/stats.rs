use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::api::ApiResponse;
use crate::ingestion::poller::IngestStatus;
use crate::models::StoreStats;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct StatsView {
    #[serde(flatten)]
    pub store: StoreStats,
    pub pending_trades: usize,
    pub pending_alerts: usize,
    pub markets_cached: usize,
    pub ingest: IngestStatus,
}

/// GET /api/stats
pub async fn get(State(state): State<AppState>) -> Json<ApiResponse<StatsView>> {
    let (pending_trades, pending_alerts) = state.store.pending_len();
    Json(ApiResponse::ok(StatsView {
        store: state.store.stats(),
        pending_trades,
        pending_alerts,
        markets_cached: state.markets.len(),
        ingest: state.ingest.borrow().clone(),
    }))
}
