use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use washwatch::api::router::create_router;
use washwatch::chain::{LedgerNode, RpcClient};
use washwatch::config::AppConfig;
use washwatch::db::{self, PgSink};
use washwatch::detection::DetectorSet;
use washwatch::ingestion::poller::Poller;
use washwatch::metrics::init_metrics;
use washwatch::models::StoreEvent;
use washwatch::polymarket::GammaClient;
use washwatch::services::analysis::{run_analysis_worker, AnalysisRunner};
use washwatch::services::fanout;
use washwatch::services::notifier::Notifier;
use washwatch::services::persistence::run_sync_worker;
use washwatch::store::{MarketDirectory, TradeStore};
use washwatch::AppState;

/// Pending market lookups the refresh worker will queue.
const MARKET_REFRESH_QUEUE: usize = 1_000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    let addr = format!("{}:{}", config.host, config.port);
    let metrics_handle = init_metrics()?;

    // --- Persistence (optional) ---
    let db = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to database...");
            let pool = db::init_pool(url).await?;
            tracing::info!("Database connected");
            Some(pool)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, running in-memory only, persistence disabled");
            None
        }
    };

    // --- Store and notification fan-out ---
    let (publisher, fanout_worker) = fanout::channel(config.event_queue_capacity);
    let (ws_tx, _) = broadcast::channel::<StoreEvent>(256);
    let mut fanout_worker = fanout_worker.with_broadcast(ws_tx.clone());
    if let Some((token, chat_id)) = config.telegram() {
        tracing::info!("Telegram notifications enabled");
        fanout_worker = fanout_worker.with_notifier(Arc::new(Notifier::new(token, chat_id)));
    }
    tokio::spawn(fanout_worker.run());

    let store = Arc::new(TradeStore::new(config.store_config(), publisher));
    let detectors = Arc::new(DetectorSet::new(config.detector_config()));

    // --- Market metadata ---
    let gamma = Arc::new(GammaClient::new(
        config.gamma_api_url.clone(),
        Duration::from_secs(config.market_lookup_timeout_secs),
    ));
    let (markets, refresh_worker) = MarketDirectory::new(
        gamma.clone(),
        Duration::from_secs(config.market_lookup_timeout_secs),
        MARKET_REFRESH_QUEUE,
    );
    tokio::spawn(refresh_worker.run());
    {
        let markets = markets.clone();
        let limit = config.market_preload_limit;
        tokio::spawn(async move {
            markets.preload(gamma.as_ref(), limit).await;
        });
    }

    // --- Ingestion ---
    let node: Arc<dyn LedgerNode> = Arc::new(RpcClient::new(
        config.polygon_rpc_url.clone(),
        Duration::from_secs(config.rpc_timeout_secs),
    ));
    let (poller, ingest) = Poller::new(node, store.clone(), detectors.clone(), config.poller_config());
    let poller = poller.with_markets(markets.clone());
    tracing::info!(
        rpc = %config.polygon_rpc_url,
        blocks_per_poll = config.blocks_per_poll,
        poll_interval_secs = config.poll_interval_secs,
        "Starting ledger poller"
    );
    tokio::spawn(poller.run());

    // --- Background workers ---
    let analysis = Arc::new(AnalysisRunner::new(store.clone(), detectors.clone()));
    tokio::spawn(run_analysis_worker(analysis.clone(), config.analysis_interval_secs));

    if let Some(pool) = &db {
        let sink = Arc::new(PgSink::new(pool.clone()));
        tokio::spawn(run_sync_worker(store.clone(), sink, config.sync_interval_secs));
    }

    let state = AppState {
        config,
        store,
        detectors,
        analysis,
        markets,
        ingest,
        ws_tx,
        metrics_handle,
        db,
    };
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {addr}");
    axum::serve(listener, router).await?;

    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(EnvFilter::from_default_env());

    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}
