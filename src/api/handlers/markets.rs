use axum::extract::{Path, State};
use axum::Json;

use crate::api::ApiResponse;
use crate::errors::AppError;
use crate::models::MarketHealthView;
use crate::AppState;

/// GET /api/markets/health: worst score first.
pub async fn health_all(State(state): State<AppState>) -> Json<ApiResponse<Vec<MarketHealthView>>> {
    let views = state
        .store
        .market_health_all()
        .iter()
        .map(|m| m.view(state.markets.display_name(&m.asset_id)))
        .collect();
    Json(ApiResponse::ok(views))
}

/// GET /api/markets/:asset_id/health
pub async fn health(
    State(state): State<AppState>,
    Path(asset_id): Path<String>,
) -> Result<Json<ApiResponse<MarketHealthView>>, AppError> {
    let health = state
        .store
        .market_health(&asset_id)
        .ok_or_else(|| AppError::NotFound(format!("no trades seen for market {asset_id}")))?;
    let name = state.markets.display_name(&asset_id);
    Ok(Json(ApiResponse::ok(health.view(name))))
}
