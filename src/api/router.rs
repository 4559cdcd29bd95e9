use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::AppState;
use super::handlers;

pub fn create_router(state: AppState) -> Router {
    let ops = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::metrics::render));

    let api = Router::new()
        .route("/api/stats", get(handlers::stats::get))
        // Trades
        .route("/api/trades", get(handlers::trades::list))
        .route("/api/trades/by-hash/:tx", get(handlers::trades::by_hash))
        // Alerts
        .route("/api/alerts", get(handlers::alerts::list))
        .route("/api/alerts/:id", get(handlers::alerts::detail))
        .route("/api/alerts/:id/acknowledge", post(handlers::alerts::acknowledge))
        // Markets
        .route("/api/markets/health", get(handlers::markets::health_all))
        .route("/api/markets/:asset_id/health", get(handlers::markets::health))
        // Analysis
        .route("/api/analysis", get(handlers::analysis::last))
        .route("/api/analysis/run", post(handlers::analysis::run))
        .route("/api/analysis/cancel", post(handlers::analysis::cancel))
        // WebSocket
        .route("/ws", get(handlers::ws::handler));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    ops.merge(api)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
