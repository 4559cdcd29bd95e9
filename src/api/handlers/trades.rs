use axum::extract::{Path, Query, State};
use axum::Json;

use crate::api::ApiResponse;
use crate::errors::AppError;
use crate::models::Trade;
use crate::store::TradeQuery;
use crate::AppState;

/// GET /api/trades: newest first, filtered by the query string.
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<TradeQuery>,
) -> Result<Json<ApiResponse<Vec<Trade>>>, AppError> {
    if let (Some(since), Some(until)) = (query.since, query.until) {
        if since > until {
            return Err(AppError::BadRequest("since must not be after until".into()));
        }
    }
    Ok(Json(ApiResponse::ok(state.store.query(&query))))
}

/// GET /api/trades/by-hash/:tx: every fill of one transaction.
pub async fn by_hash(
    State(state): State<AppState>,
    Path(tx_hash): Path<String>,
) -> Result<Json<ApiResponse<Vec<Trade>>>, AppError> {
    let trades = state.store.trades_by_tx(&tx_hash);
    if trades.is_empty() {
        return Err(AppError::NotFound(format!("no trades for transaction {tx_hash}")));
    }
    Ok(Json(ApiResponse::ok(trades)))
}
