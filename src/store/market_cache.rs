use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};

use crate::models::MarketInfo;

/// Delay before each retry of a failed lookup. After the last one the asset
/// is given up on until someone asks for it again.
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(30),
    Duration::from_secs(120),
    Duration::from_secs(300),
];

/// Metadata service mapping an outcome token to its market.
#[async_trait]
pub trait MarketLookup: Send + Sync {
    /// `Ok(None)` when the service does not know the asset.
    async fn lookup_market(&self, asset_id: &str) -> anyhow::Result<Option<MarketInfo>>;

    /// Bulk listing used to warm the cache at startup.
    async fn active_markets(&self, _limit: u32) -> anyhow::Result<Vec<MarketInfo>> {
        Ok(Vec::new())
    }
}

/// Best-effort asset → market cache. Reads never wait on the network: a miss
/// returns a placeholder and queues a background refresh.
pub struct MarketDirectory {
    cache: RwLock<HashMap<String, MarketInfo>>,
    in_flight: Mutex<HashSet<String>>,
    refresh_tx: mpsc::Sender<String>,
}

impl MarketDirectory {
    pub fn new(
        lookup: Arc<dyn MarketLookup>,
        lookup_timeout: Duration,
        queue_capacity: usize,
    ) -> (Arc<Self>, RefreshWorker) {
        let (refresh_tx, rx) = mpsc::channel(queue_capacity.max(1));
        let directory = Arc::new(Self {
            cache: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            refresh_tx,
        });
        let worker = RefreshWorker {
            rx,
            directory: directory.clone(),
            lookup,
            lookup_timeout,
        };
        (directory, worker)
    }

    pub fn get(&self, asset_id: &str) -> Option<MarketInfo> {
        self.cache.read().get(asset_id).cloned()
    }

    pub fn insert(&self, info: MarketInfo) {
        self.in_flight.lock().remove(&info.asset_id);
        self.cache.write().insert(info.asset_id.clone(), info);
    }

    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Display name for an asset. Never blocks; a miss schedules a refresh.
    pub fn display_name(&self, asset_id: &str) -> String {
        if let Some(info) = self.cache.read().get(asset_id) {
            return info.display_name();
        }
        self.request_refresh(asset_id);
        placeholder_name(asset_id)
    }

    /// Queue a background lookup unless one is already pending.
    pub fn request_refresh(&self, asset_id: &str) {
        if !self.in_flight.lock().insert(asset_id.to_string()) {
            return;
        }
        if self.refresh_tx.try_send(asset_id.to_string()).is_err() {
            self.in_flight.lock().remove(asset_id);
            tracing::debug!(asset_id, "Market refresh queue full, will retry on next miss");
        }
    }

    /// Warm the cache from the active-markets listing.
    pub async fn preload(&self, lookup: &dyn MarketLookup, limit: u32) -> usize {
        match lookup.active_markets(limit).await {
            Ok(markets) => {
                let n = markets.len();
                for info in markets {
                    self.insert(info);
                }
                tracing::info!(markets = n, "Market metadata preloaded");
                n
            }
            Err(e) => {
                tracing::warn!(error = %e, "Market metadata preload failed");
                0
            }
        }
    }
}

pub fn placeholder_name(asset_id: &str) -> String {
    format!("Token {}...", &asset_id[..16.min(asset_id.len())])
}

// ---------------------------------------------------------------------------
// Refresh worker
// ---------------------------------------------------------------------------

struct Retry {
    due: Instant,
    asset_id: String,
    attempt: usize,
}

pub struct RefreshWorker {
    rx: mpsc::Receiver<String>,
    directory: Arc<MarketDirectory>,
    lookup: Arc<dyn MarketLookup>,
    lookup_timeout: Duration,
}

impl RefreshWorker {
    pub async fn run(mut self) {
        let mut retries: Vec<Retry> = Vec::new();

        loop {
            let next_due = retries.iter().map(|r| r.due).min();

            tokio::select! {
                msg = self.rx.recv() => {
                    match msg {
                        Some(asset_id) => self.refresh(asset_id, 0, &mut retries).await,
                        None => break,
                    }
                }
                _ = sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                    let now = Instant::now();
                    let (due, later): (Vec<Retry>, Vec<Retry>) =
                        retries.drain(..).partition(|r| r.due <= now);
                    retries = later;
                    for retry in due {
                        self.refresh(retry.asset_id, retry.attempt, &mut retries).await;
                    }
                }
            }
        }

        tracing::debug!("Market refresh worker stopped");
    }

    async fn refresh(&self, asset_id: String, attempt: usize, retries: &mut Vec<Retry>) {
        let result = timeout(self.lookup_timeout, self.lookup.lookup_market(&asset_id)).await;

        let reason = match result {
            Ok(Ok(Some(info))) => {
                tracing::debug!(asset_id = %asset_id, question = %info.question, "Market metadata cached");
                self.directory.insert(info);
                return;
            }
            Ok(Ok(None)) => "not found".to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(_) => "timed out".to_string(),
        };

        match RETRY_DELAYS.get(attempt) {
            Some(delay) => {
                tracing::debug!(asset_id = %asset_id, attempt, reason = %reason, "Market lookup failed, retry scheduled");
                retries.push(Retry {
                    due: Instant::now() + *delay,
                    asset_id,
                    attempt: attempt + 1,
                });
            }
            None => {
                tracing::debug!(asset_id = %asset_id, reason = %reason, "Market lookup abandoned");
                self.directory.in_flight.lock().remove(&asset_id);
            }
        }
    }
}
