pub mod api;
pub mod chain;
pub mod config;
pub mod db;
pub mod detection;
pub mod errors;
pub mod health;
pub mod ingestion;
pub mod metrics;
pub mod models;
pub mod polymarket;
pub mod services;
pub mod store;

use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use crate::config::AppConfig;
use crate::detection::DetectorSet;
use crate::ingestion::poller::IngestStatus;
use crate::models::StoreEvent;
use crate::services::analysis::AnalysisRunner;
use crate::store::{MarketDirectory, TradeStore};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<TradeStore>,
    pub detectors: Arc<DetectorSet>,
    pub analysis: Arc<AnalysisRunner>,
    pub markets: Arc<MarketDirectory>,
    pub ingest: watch::Receiver<IngestStatus>,
    pub ws_tx: broadcast::Sender<StoreEvent>,
    pub metrics_handle: PrometheusHandle,
    /// `None` when persistence is disabled.
    pub db: Option<sqlx::PgPool>,
}
