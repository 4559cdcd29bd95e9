use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use washwatch::chain::{LedgerNode, LogFilter, RawLog, RpcError, ORDER_FILLED_TOPIC};
use washwatch::config::AppConfig;
use washwatch::detection::{DetectorConfig, DetectorSet};
use washwatch::ingestion::poller::IngestStatus;
use washwatch::models::{Alert, MarketInfo, Side, StoreEvent, Trade};
use washwatch::services::analysis::AnalysisRunner;
use washwatch::services::fanout::EventPublisher;
use washwatch::services::persistence::PersistenceSink;
use washwatch::store::market_cache::MarketLookup;
use washwatch::store::{MarketDirectory, StoreConfig, TradeStore};
use washwatch::AppState;

pub const GENESIS_SECS: i64 = 1_700_000_000;

/// Deterministic 20-byte address.
#[allow(dead_code)]
pub fn wallet(n: u64) -> String {
    format!("0x{n:040x}")
}

#[allow(dead_code)]
pub fn tx_hash(seq: u64) -> String {
    format!("0x{seq:064x}")
}

#[allow(dead_code)]
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(GENESIS_SECS + secs, 0).unwrap()
}

/// Trade `seq` in block `1000 + seq`, `secs` after genesis.
#[allow(dead_code)]
pub fn trade(seq: u64, secs: i64, maker: &str, taker: &str, side: Side, price: &str, size: &str) -> Trade {
    Trade {
        tx_hash: tx_hash(seq),
        log_index: seq,
        block_number: 1_000 + seq,
        timestamp: at(secs),
        contract: "0x4bfb41d5b3570defd03c39a9a4d8de6bd8b8982e".into(),
        order_hash: format!("0xorder{seq}"),
        maker: maker.into(),
        taker: taker.into(),
        asset_id: "asset-x".into(),
        side,
        price: Decimal::from_str(price).unwrap(),
        size: Decimal::from_str(size).unwrap(),
        fee: Decimal::ZERO,
        is_wash: false,
        wash_type: None,
        wash_confidence: 0.0,
    }
}

#[allow(dead_code)]
pub fn store() -> Arc<TradeStore> {
    Arc::new(TradeStore::new(StoreConfig::default(), EventPublisher::disabled()))
}

#[allow(dead_code)]
pub fn detectors() -> Arc<DetectorSet> {
    Arc::new(DetectorSet::new(DetectorConfig::default()))
}

// ---------------------------------------------------------------------------
// Raw ledger logs
// ---------------------------------------------------------------------------

fn word(value: u128) -> String {
    format!("{value:064x}")
}

fn topic_addr(addr: &str) -> String {
    format!("0x000000000000000000000000{}", addr.trim_start_matches("0x"))
}

/// `OrderFilled` log where the maker buys `tokens` of `asset` for `cash`
/// (both in whole units).
#[allow(dead_code)]
pub fn fill_log(block: u64, log_index: u64, maker: &str, taker: &str, asset: u128, cash: u128, tokens: u128) -> RawLog {
    RawLog {
        address: "0x4bfb41d5b3570defd03c39a9a4d8de6bd8b8982e".into(),
        topics: vec![
            ORDER_FILLED_TOPIC.into(),
            format!("0x{:064x}", block * 1_000 + log_index),
            topic_addr(maker),
            topic_addr(taker),
        ],
        data: format!(
            "0x{}{}{}{}{}",
            word(0),
            word(asset),
            word(cash * 1_000_000),
            word(tokens * 1_000_000),
            word(0)
        ),
        block_number: block,
        transaction_hash: tx_hash(block),
        log_index,
        removed: false,
    }
}

// ---------------------------------------------------------------------------
// In-memory ledger node
// ---------------------------------------------------------------------------

/// Scripted node: a fixed set of logs, a movable head, chunks that fail
/// once on request and blocks no range request can ever cover.
#[derive(Default)]
pub struct MockNode {
    pub head: AtomicU64,
    logs: Mutex<Vec<RawLog>>,
    fail_once_from: Mutex<HashSet<u64>>,
    broken_blocks: Mutex<HashSet<u64>>,
    pub get_logs_calls: AtomicU64,
}

#[allow(dead_code)]
impl MockNode {
    pub fn new(head: u64, logs: Vec<RawLog>) -> Arc<Self> {
        let node = Self::default();
        node.head.store(head, Ordering::SeqCst);
        *node.logs.lock() = logs;
        Arc::new(node)
    }

    /// The next `eth_getLogs` for a range starting at `from_block` fails.
    pub fn fail_chunk_once(&self, from_block: u64) {
        self.fail_once_from.lock().insert(from_block);
    }

    /// Every `eth_getLogs` whose range contains `block` fails.
    pub fn break_block(&self, block: u64) {
        self.broken_blocks.lock().insert(block);
    }
}

#[async_trait]
impl LedgerNode for MockNode {
    async fn latest_block_number(&self) -> Result<u64, RpcError> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, RpcError> {
        self.get_logs_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_once_from.lock().remove(&filter.from_block) {
            return Err(RpcError::Timeout);
        }
        if self
            .broken_blocks
            .lock()
            .iter()
            .any(|b| (filter.from_block..=filter.to_block).contains(b))
        {
            return Err(RpcError::Rpc {
                code: -32000,
                message: "range unavailable".into(),
            });
        }
        let logs = self.logs.lock();
        Ok(logs
            .iter()
            .filter(|l| l.block_number >= filter.from_block && l.block_number <= filter.to_block)
            .filter(|l| filter.addresses.iter().any(|a| a.eq_ignore_ascii_case(&l.address)))
            .filter(|l| l.topics.first().is_some_and(|t| filter.topics.contains(t)))
            .cloned()
            .collect())
    }

    async fn block_timestamp(&self, block: u64) -> Result<DateTime<Utc>, RpcError> {
        Ok(at(block as i64 * 2))
    }
}

// ---------------------------------------------------------------------------
// In-memory persistence sink
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemorySink {
    pub trades: Mutex<HashMap<String, Trade>>,
    pub alerts: Mutex<HashMap<String, Alert>>,
}

#[async_trait]
impl PersistenceSink for MemorySink {
    async fn append_trade_if_absent(&self, trade: &Trade) -> anyhow::Result<bool> {
        let mut trades = self.trades.lock();
        let key = trade.key().to_string();
        if trades.contains_key(&key) {
            return Ok(false);
        }
        trades.insert(key, trade.clone());
        Ok(true)
    }

    async fn append_alert_if_absent(&self, alert: &Alert) -> anyhow::Result<bool> {
        let mut alerts = self.alerts.lock();
        if alerts.contains_key(&alert.alert_id) {
            return Ok(false);
        }
        alerts.insert(alert.alert_id.clone(), alert.clone());
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// App state without network or database
// ---------------------------------------------------------------------------

/// Market lookup that knows nothing.
pub struct NoMarkets;

#[async_trait]
impl MarketLookup for NoMarkets {
    async fn lookup_market(&self, _asset_id: &str) -> anyhow::Result<Option<MarketInfo>> {
        Ok(None)
    }
}

#[allow(dead_code)]
pub fn test_config() -> AppConfig {
    AppConfig {
        host: "127.0.0.1".into(),
        port: 0,
        database_url: None,
        polygon_rpc_url: "http://localhost:8545".into(),
        rpc_timeout_secs: 1,
        poll_interval_secs: 1,
        blocks_per_poll: 20,
        logs_chunk_blocks: 5,
        start_block: None,
        max_trades_in_memory: 1_000,
        max_alerts_in_memory: 100,
        sync_interval_secs: 1,
        analysis_interval_secs: 60,
        event_queue_capacity: 64,
        gamma_api_url: "http://localhost:1".into(),
        market_lookup_timeout_secs: 1,
        market_preload_limit: 0,
        known_event_times: vec![],
        telegram_bot_token: None,
        telegram_chat_id: None,
        notifications_enabled: false,
    }
}

#[allow(dead_code)]
pub fn test_state(store: Arc<TradeStore>) -> AppState {
    let detectors = detectors();
    let (markets, _worker) = MarketDirectory::new(Arc::new(NoMarkets), Duration::from_secs(1), 16);
    let (ws_tx, _) = tokio::sync::broadcast::channel::<StoreEvent>(16);
    let (_, ingest) = tokio::sync::watch::channel(IngestStatus::default());
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .build_recorder()
        .handle();

    AppState {
        config: test_config(),
        analysis: Arc::new(AnalysisRunner::new(store.clone(), detectors.clone())),
        store,
        detectors,
        markets,
        ingest,
        ws_tx,
        metrics_handle,
        db: None,
    }
}
