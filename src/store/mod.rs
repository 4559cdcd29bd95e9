//! Bounded, indexed, thread-safe home of every trade, alert and market
//! aggregate.
//!
//! One coarse `parking_lot::Mutex` guards all collections and indices.
//! Operations never fail: duplicates are ignored and capacity pressure
//! evicts the oldest records.

pub mod market_cache;
pub mod query;

pub use market_cache::MarketDirectory;
pub use query::{AlertQuery, TradeQuery};

use metrics::{counter, gauge};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::health::HealthAggregator;
use crate::models::{
    Alert, MarketHealth, StoreEvent, StoreStats, Trade, TradeKey, WashMarked, WashType,
};
use crate::services::fanout::{EventCallback, EventPublisher, SubscriptionId};

/// Remember this many alert ids per alert slot, so re-runs of a batch
/// detector stay deduplicated after the alert itself was evicted.
const ALERT_ID_MEMORY_FACTOR: usize = 10;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub max_trades: usize,
    pub max_alerts: usize,
    /// Upper bound on records waiting for the persistence worker.
    pub max_pending: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_trades: 50_000,
            max_alerts: 1_000,
            max_pending: 100_000,
        }
    }
}

/// Result of a `mark_wash` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// Trade went from organic to wash.
    Flagged,
    /// Trade was already wash; confidence went up.
    Raised,
    /// Already wash with equal or higher confidence.
    Unchanged,
    NotFound,
}

impl MarkOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, MarkOutcome::Flagged | MarkOutcome::Raised)
    }
}

#[derive(Debug, Default)]
struct Counters {
    total_trades: u64,
    total_alerts: u64,
    wash_trades: u64,
    total_volume: Decimal,
    wash_volume: Decimal,
    last_block: u64,
}

/// FIFO-bounded set of keys.
#[derive(Debug)]
struct BoundedSet<K> {
    set: HashSet<K>,
    order: VecDeque<K>,
    cap: usize,
}

impl<K: std::hash::Hash + Eq + Clone> BoundedSet<K> {
    fn new(cap: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    fn contains(&self, key: &K) -> bool {
        self.set.contains(key)
    }

    fn insert(&mut self, key: K) {
        if self.set.insert(key.clone()) {
            self.order.push_back(key);
            while self.order.len() > self.cap {
                if let Some(old) = self.order.pop_front() {
                    self.set.remove(&old);
                }
            }
        }
    }
}

struct StoreInner {
    trades: HashMap<TradeKey, Trade>,
    /// Insertion order, oldest first. Drives eviction and newest-first scans.
    order: VecDeque<TradeKey>,
    /// Keys that were evicted, so a late duplicate is still recognized.
    evicted: BoundedSet<TradeKey>,
    by_tx: HashMap<String, Vec<u64>>,
    by_address: HashMap<String, VecDeque<TradeKey>>,
    by_asset: HashMap<String, VecDeque<TradeKey>>,
    markets: HashMap<String, MarketHealth>,
    alerts: VecDeque<Alert>,
    alert_ids: BoundedSet<String>,
    counters: Counters,
    pending_trades: VecDeque<Trade>,
    pending_alerts: VecDeque<Alert>,
}

impl StoreInner {
    fn new(config: &StoreConfig) -> Self {
        Self {
            trades: HashMap::new(),
            order: VecDeque::new(),
            evicted: BoundedSet::new(config.max_trades),
            by_tx: HashMap::new(),
            by_address: HashMap::new(),
            by_asset: HashMap::new(),
            markets: HashMap::new(),
            alerts: VecDeque::new(),
            alert_ids: BoundedSet::new(config.max_alerts * ALERT_ID_MEMORY_FACTOR),
            counters: Counters::default(),
            pending_trades: VecDeque::new(),
            pending_alerts: VecDeque::new(),
        }
    }

    fn index(&mut self, key: &TradeKey, trade: &Trade) {
        self.by_tx
            .entry(key.tx_hash.clone())
            .or_default()
            .push(key.log_index);
        self.by_address
            .entry(trade.maker.clone())
            .or_default()
            .push_back(key.clone());
        if trade.taker != trade.maker {
            self.by_address
                .entry(trade.taker.clone())
                .or_default()
                .push_back(key.clone());
        }
        self.by_asset
            .entry(trade.asset_id.clone())
            .or_default()
            .push_back(key.clone());
    }

    /// Drop the oldest trade. Index lists share the global insertion order,
    /// so the evicted key sits at the front of each list it appears in.
    fn evict_oldest(&mut self) {
        let Some(key) = self.order.pop_front() else {
            return;
        };
        let Some(trade) = self.trades.remove(&key) else {
            return;
        };

        if let Some(indexes) = self.by_tx.get_mut(&key.tx_hash) {
            indexes.retain(|i| *i != key.log_index);
            if indexes.is_empty() {
                self.by_tx.remove(&key.tx_hash);
            }
        }
        for address in [&trade.maker, &trade.taker] {
            pop_front_key(&mut self.by_address, address, &key);
        }
        pop_front_key(&mut self.by_asset, &trade.asset_id, &key);

        self.evicted.insert(key);
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            total_trades: self.counters.total_trades,
            stored_trades: self.trades.len(),
            total_alerts: self.counters.total_alerts,
            stored_alerts: self.alerts.len(),
            wash_trade_count: self.counters.wash_trades,
            total_volume: self.counters.total_volume,
            wash_volume: self.counters.wash_volume,
            unique_markets: self.markets.len(),
            unique_traders: self.by_address.len(),
            last_block: self.counters.last_block,
        }
    }

    fn keys_newest_first<'a>(&'a self, query: &TradeQuery) -> Box<dyn Iterator<Item = &'a TradeKey> + 'a> {
        if let Some(address) = &query.address {
            match self.by_address.get(&address.to_lowercase()) {
                Some(keys) => Box::new(keys.iter().rev()),
                None => Box::new(std::iter::empty()),
            }
        } else if let Some(asset) = &query.asset_id {
            match self.by_asset.get(asset) {
                Some(keys) => Box::new(keys.iter().rev()),
                None => Box::new(std::iter::empty()),
            }
        } else {
            Box::new(self.order.iter().rev())
        }
    }
}

fn pop_front_key(index: &mut HashMap<String, VecDeque<TradeKey>>, bucket: &str, key: &TradeKey) {
    if let Some(keys) = index.get_mut(bucket) {
        if keys.front() == Some(key) {
            keys.pop_front();
        } else {
            keys.retain(|k| k != key);
        }
        if keys.is_empty() {
            index.remove(bucket);
        }
    }
}

// ---------------------------------------------------------------------------
// TradeStore
// ---------------------------------------------------------------------------

pub struct TradeStore {
    inner: Mutex<StoreInner>,
    config: StoreConfig,
    health: HealthAggregator,
    publisher: EventPublisher,
}

impl TradeStore {
    pub fn new(config: StoreConfig, publisher: EventPublisher) -> Self {
        Self {
            inner: Mutex::new(StoreInner::new(&config)),
            config,
            health: HealthAggregator::new(),
            publisher,
        }
    }

    /// Insert a trade. Returns false (and changes nothing) for a duplicate
    /// (tx hash, log index).
    pub fn insert(&self, trade: Trade) -> bool {
        let key = trade.key();
        {
            let mut inner = self.inner.lock();
            if inner.trades.contains_key(&key) || inner.evicted.contains(&key) {
                counter!("trades_duplicate_total").increment(1);
                return false;
            }

            let volume = trade.notional();
            inner.counters.total_trades += 1;
            inner.counters.total_volume += volume;
            if trade.block_number > inner.counters.last_block {
                inner.counters.last_block = trade.block_number;
            }
            if trade.is_wash {
                inner.counters.wash_trades += 1;
                inner.counters.wash_volume += volume;
            }

            let market = inner
                .markets
                .entry(trade.asset_id.clone())
                .or_insert_with(|| MarketHealth::new(trade.asset_id.clone()));
            self.health.record_trade(market, &trade);

            inner.index(&key, &trade);
            inner.order.push_back(key.clone());
            inner.trades.insert(key, trade.clone());

            while inner.trades.len() > self.config.max_trades {
                inner.evict_oldest();
            }

            if inner.pending_trades.len() >= self.config.max_pending {
                inner.pending_trades.pop_front();
                counter!("persistence_dropped_total").increment(1);
            }
            inner.pending_trades.push_back(trade.clone());

            gauge!("store_trades").set(inner.trades.len() as f64);
        }

        counter!("trades_ingested_total").increment(1);
        self.publisher.publish(StoreEvent::Trade(trade));
        true
    }

    /// Flag a trade as wash. The first call flips `is_wash` and moves its
    /// volume into the wash aggregates; later calls can only raise the
    /// confidence.
    pub fn mark_wash(&self, key: &TradeKey, wash_type: WashType, confidence: f64) -> MarkOutcome {
        let confidence = confidence.clamp(0.0, 1.0);
        let (outcome, event) = {
            let mut inner = self.inner.lock();
            let inner = &mut *inner;
            let Some(trade) = inner.trades.get_mut(key) else {
                return MarkOutcome::NotFound;
            };

            let outcome = if !trade.is_wash {
                trade.is_wash = true;
                trade.wash_type = Some(wash_type);
                trade.wash_confidence = confidence;
                MarkOutcome::Flagged
            } else if confidence > trade.wash_confidence {
                trade.wash_type = Some(wash_type);
                trade.wash_confidence = confidence;
                MarkOutcome::Raised
            } else {
                MarkOutcome::Unchanged
            };

            if outcome == MarkOutcome::Flagged {
                let volume = trade.notional();
                inner.counters.wash_trades += 1;
                inner.counters.wash_volume += volume;
                if let Some(market) = inner.markets.get_mut(&trade.asset_id) {
                    self.health.record_wash(market, trade, true);
                }
            }

            if !outcome.changed() {
                return outcome;
            }

            // Keep a not-yet-synced copy in step with the live trade.
            if let Some(pending) = inner.pending_trades.iter_mut().rev().find(|t| t.key() == *key) {
                pending.is_wash = trade.is_wash;
                pending.wash_type = trade.wash_type;
                pending.wash_confidence = trade.wash_confidence;
            }

            let event = WashMarked {
                tx_hash: key.tx_hash.clone(),
                log_index: key.log_index,
                asset_id: trade.asset_id.clone(),
                wash_type,
                confidence,
            };
            (outcome, event)
        };

        if outcome == MarkOutcome::Flagged {
            counter!("wash_trades_flagged_total").increment(1);
        }
        self.publisher.publish(StoreEvent::WashMarked(event));
        outcome
    }

    /// Append an alert. Returns false for an alert id seen before.
    pub fn append_alert(&self, alert: Alert) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.alert_ids.contains(&alert.alert_id) {
                return false;
            }
            inner.alert_ids.insert(alert.alert_id.clone());
            inner.counters.total_alerts += 1;

            for asset in alert.markets() {
                let market = inner
                    .markets
                    .entry(asset.clone())
                    .or_insert_with(|| MarketHealth::new(asset));
                self.health.record_alert(market, &alert);
            }

            inner.alerts.push_back(alert.clone());
            while inner.alerts.len() > self.config.max_alerts {
                inner.alerts.pop_front();
            }

            if inner.pending_alerts.len() >= self.config.max_pending {
                inner.pending_alerts.pop_front();
                counter!("persistence_dropped_total").increment(1);
            }
            inner.pending_alerts.push_back(alert.clone());
        }

        counter!("alerts_emitted_total", "type" => alert.alert_type.as_str()).increment(1);
        tracing::info!(
            alert_id = %alert.alert_id,
            alert_type = %alert.alert_type,
            severity = %alert.severity,
            confidence = alert.confidence,
            trades = alert.trade_count,
            "Alert raised"
        );
        self.publisher.publish(StoreEvent::Alert(alert));
        true
    }

    /// Mark an alert as seen by an operator. Returns false if it is unknown
    /// or already evicted.
    pub fn acknowledge_alert(&self, alert_id: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.alerts.iter_mut().find(|a| a.alert_id == alert_id) {
            Some(alert) => {
                alert.acknowledged = true;
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> StoreStats {
        self.inner.lock().stats()
    }

    /// Push the current counters to subscribers.
    ///
    /// Inserts and marks do not publish stats themselves. The poller calls
    /// this once per cycle, so subscribers see one coalesced `stats` event
    /// per poll rather than one per store change.
    pub fn publish_stats(&self) {
        let stats = self.stats();
        self.publisher.publish(StoreEvent::Stats(stats));
    }

    /// Newest-first page of trades matching `query`.
    pub fn query(&self, query: &TradeQuery) -> Vec<Trade> {
        let inner = self.inner.lock();
        inner
            .keys_newest_first(query)
            .filter_map(|k| inner.trades.get(k))
            .filter(|t| query.matches(t))
            .skip(query.offset())
            .take(query.limit())
            .cloned()
            .collect()
    }

    pub fn get(&self, key: &TradeKey) -> Option<Trade> {
        self.inner.lock().trades.get(key).cloned()
    }

    pub fn trades_by_tx(&self, tx_hash: &str) -> Vec<Trade> {
        let tx_hash = tx_hash.to_lowercase();
        let inner = self.inner.lock();
        let mut trades: Vec<Trade> = inner
            .by_tx
            .get(&tx_hash)
            .into_iter()
            .flatten()
            .filter_map(|i| inner.trades.get(&TradeKey::new(tx_hash.clone(), *i)))
            .cloned()
            .collect();
        trades.sort_by_key(|t| t.log_index);
        trades
    }

    /// Newest-first alerts matching `query`.
    pub fn alerts(&self, query: &AlertQuery) -> Vec<Alert> {
        let inner = self.inner.lock();
        inner
            .alerts
            .iter()
            .rev()
            .filter(|a| query.matches(a))
            .take(query.limit())
            .cloned()
            .collect()
    }

    pub fn alert(&self, alert_id: &str) -> Option<Alert> {
        let inner = self.inner.lock();
        inner.alerts.iter().find(|a| a.alert_id == alert_id).cloned()
    }

    pub fn market_health(&self, asset_id: &str) -> Option<MarketHealth> {
        self.inner.lock().markets.get(asset_id).cloned()
    }

    /// Every market with at least one trade, worst score first.
    pub fn market_health_all(&self) -> Vec<MarketHealth> {
        let inner = self.inner.lock();
        let mut markets: Vec<MarketHealth> = inner
            .markets
            .values()
            .filter(|m| m.total_trades > 0)
            .cloned()
            .collect();
        markets.sort_by(|a, b| a.score().total_cmp(&b.score()));
        markets
    }

    /// Copy of every stored trade in chain order, taken under the lock.
    pub fn snapshot(&self) -> Vec<Trade> {
        let mut trades: Vec<Trade> = {
            let inner = self.inner.lock();
            inner.trades.values().cloned().collect()
        };
        trades.sort_by_key(Trade::chain_order);
        trades
    }

    pub fn len(&self) -> usize {
        self.inner.lock().trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -- persistence hand-off ----------------------------------------------

    /// Take up to `max` trades and alerts waiting to be persisted.
    pub fn drain_pending(&self, max: usize) -> (Vec<Trade>, Vec<Alert>) {
        let mut inner = self.inner.lock();
        let n = max.min(inner.pending_trades.len());
        let trades: Vec<Trade> = inner.pending_trades.drain(..n).collect();
        let n = max.min(inner.pending_alerts.len());
        let alerts: Vec<Alert> = inner.pending_alerts.drain(..n).collect();
        (trades, alerts)
    }

    /// Put records back at the head of the queue after a failed sync.
    pub fn requeue(&self, trades: Vec<Trade>, alerts: Vec<Alert>) {
        let mut inner = self.inner.lock();
        for trade in trades.into_iter().rev() {
            inner.pending_trades.push_front(trade);
        }
        for alert in alerts.into_iter().rev() {
            inner.pending_alerts.push_front(alert);
        }
    }

    pub fn pending_len(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.pending_trades.len(), inner.pending_alerts.len())
    }

    // -- subscriptions -----------------------------------------------------

    pub fn subscribe(&self, callback: EventCallback) -> SubscriptionId {
        self.publisher.registry().subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.publisher.registry().unsubscribe(id)
    }
}
