//! Wash-trading detectors and the set that runs them.
//!
//! Incremental detectors see each stored trade once, in chain order, and
//! keep a bounded window of recent history. Batch detectors get a
//! [`Snapshot`] copied out of the store and may use heavier algorithms.
//! Both produce [`Evidence`], which [`DetectorSet::apply`] turns into wash
//! marks and alerts. Every detector call is isolated: an error or panic in
//! one is logged and counted, and the others still run.

pub mod atomic;
pub mod circular;
pub mod gas;
pub mod new_wallet;
pub mod self_trade;
pub mod sybil;
pub mod volume_spike;
pub mod win_rate;

use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use crate::models::alert::alert_id;
use crate::models::{Alert, AlertType, PositionEvent, Severity, Trade};
use crate::store::{MarkOutcome, TradeStore};

pub use atomic::{AtomicConfig, AtomicHeuristicDetector, AtomicExactDetector};
pub use circular::{CircularConfig, CircularPairDetector, CycleDetector};
pub use gas::{GasAnomalyDetector, GasConfig};
pub use new_wallet::{NewWalletConfig, NewWalletDetector};
pub use self_trade::{CoordinatedConfig, CoordinatedSelfTradeDetector, SelfTradeDetector};
pub use sybil::{SybilBatchDetector, SybilConfig, SybilWindowDetector};
pub use volume_spike::{VolumeSpikeConfig, VolumeSpikeDetector};
pub use win_rate::{WinRateConfig, WinRateDetector};

/// Position events remembered for the exact atomic-wash pass.
const POSITION_LEDGER_CAP: usize = 20_000;

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("malformed window: {0}")]
    MalformedWindow(String),
}

// ---------------------------------------------------------------------------
// Evidence
// ---------------------------------------------------------------------------

/// One detector finding, before it becomes an alert.
#[derive(Debug, Clone)]
pub struct Evidence {
    pub kind: AlertType,
    pub trades: Vec<Trade>,
    pub addresses: Vec<String>,
    pub asset_id: Option<String>,
    pub tx_hash: Option<String>,
    pub confidence: f64,
    pub volume: Decimal,
    pub timestamp: DateTime<Utc>,
    pub details: serde_json::Map<String, serde_json::Value>,
    dedup_key: String,
}

impl Evidence {
    /// Evidence over a set of matched trades. Addresses, volume, time and
    /// the dedup key are derived from the trades; asset and tx hash are set
    /// when every trade agrees on them.
    pub fn new(kind: AlertType, trades: Vec<Trade>, confidence: f64) -> Self {
        let addresses: BTreeSet<String> = trades
            .iter()
            .flat_map(|t| [t.maker.clone(), t.taker.clone()])
            .collect();
        let volume = trades.iter().map(Trade::notional).sum();
        let timestamp = trades.iter().map(|t| t.timestamp).min().unwrap_or_else(Utc::now);

        let mut keys: Vec<String> = trades.iter().map(|t| t.key().to_string()).collect();
        keys.sort();

        Self {
            kind,
            asset_id: single_value(trades.iter().map(|t| t.asset_id.as_str())),
            tx_hash: single_value(trades.iter().map(|t| t.tx_hash.as_str())),
            addresses: addresses.into_iter().collect(),
            confidence: confidence.clamp(0.0, 1.0),
            volume,
            timestamp,
            details: serde_json::Map::new(),
            dedup_key: keys.join("|"),
            trades,
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    /// Replace the trade-derived dedup key, for findings about something
    /// other than an exact trade set (a cluster, a time bin, a wallet).
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = key.into();
        self
    }

    pub fn with_addresses(mut self, addresses: Vec<String>) -> Self {
        self.addresses = addresses;
        self
    }

    pub fn dedup_key(&self) -> &str {
        &self.dedup_key
    }

    pub fn alert_id(&self) -> String {
        alert_id(self.kind, &self.dedup_key)
    }

    pub fn into_alert(self) -> Alert {
        Alert {
            alert_id: self.alert_id(),
            timestamp: self.timestamp,
            alert_type: self.kind,
            severity: Severity::from_confidence(self.confidence),
            tx_hash: self.tx_hash,
            asset_id: self.asset_id,
            trade_count: self.trades.len(),
            volume: self.volume,
            confidence: self.confidence,
            addresses: self.addresses,
            details: self.details,
            trades: self.trades,
            acknowledged: false,
        }
    }
}

fn single_value<'a>(mut values: impl Iterator<Item = &'a str>) -> Option<String> {
    let first = values.next()?;
    values.all(|v| v == first).then(|| first.to_string())
}

// ---------------------------------------------------------------------------
// Detector traits
// ---------------------------------------------------------------------------

/// Per-call facts about the store that incremental detectors may need.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetectContext {
    /// Trades the store had accepted before this one.
    pub prior_trades: u64,
}

/// Runs inline on ingestion, once per newly stored trade, in chain order.
pub trait IncrementalDetector: Send {
    fn name(&self) -> &'static str;

    fn on_trade(&mut self, trade: &Trade, ctx: &DetectContext) -> Result<Vec<Evidence>, DetectorError>;

    /// Drop state older than the detector's retention horizon.
    fn trim(&mut self, _now: DateTime<Utc>) {}
}

/// Runs over a read-only snapshot.
pub trait BatchDetector: Send + Sync {
    fn name(&self) -> &'static str;

    fn detect(&self, snapshot: &Snapshot) -> Result<Vec<Evidence>, DetectorError>;
}

/// Read-only copy of the trades (chain order) and position events a batch
/// run looks at.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub trades: Vec<Trade>,
    pub positions: Vec<PositionEvent>,
}

impl Snapshot {
    pub fn new(mut trades: Vec<Trade>, positions: Vec<PositionEvent>) -> Self {
        trades.sort_by_key(Trade::chain_order);
        Self { trades, positions }
    }

    pub fn is_chain_ordered(&self) -> bool {
        self.trades
            .windows(2)
            .all(|w| w[0].chain_order() <= w[1].chain_order())
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct DetectorConfig {
    pub coordinated: CoordinatedConfig,
    pub circular: CircularConfig,
    pub atomic: AtomicConfig,
    pub volume_spike: VolumeSpikeConfig,
    pub sybil: SybilConfig,
    pub new_wallet: NewWalletConfig,
    pub win_rate: WinRateConfig,
    pub gas: GasConfig,
}

// ---------------------------------------------------------------------------
// DetectorSet
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub alert_appended: bool,
    pub trades_flagged: usize,
}

/// Tally of one pass of detectors over some trades.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnalysisReport {
    pub trades_analyzed: usize,
    pub evidence: BTreeMap<AlertType, usize>,
    pub alerts_appended: usize,
    pub trades_flagged: usize,
    pub duration_ms: u64,
    pub cancelled: bool,
}

impl AnalysisReport {
    fn tally(&mut self, evidence: &Evidence, outcome: ApplyOutcome) {
        *self.evidence.entry(evidence.kind).or_default() += 1;
        if outcome.alert_appended {
            self.alerts_appended += 1;
        }
        self.trades_flagged += outcome.trades_flagged;
    }
}

pub struct DetectorSet {
    incremental: Mutex<Vec<Box<dyn IncrementalDetector>>>,
    chunk: Vec<Box<dyn BatchDetector>>,
    batch: Vec<Box<dyn BatchDetector>>,
    positions: Mutex<VecDeque<PositionEvent>>,
}

impl DetectorSet {
    pub fn new(config: DetectorConfig) -> Self {
        let incremental: Vec<Box<dyn IncrementalDetector>> = vec![
            Box::new(SelfTradeDetector),
            Box::new(CircularPairDetector::new(config.circular.clone())),
            Box::new(SybilWindowDetector::new(config.sybil.clone())),
            Box::new(NewWalletDetector::new(config.new_wallet.clone())),
        ];
        let chunk: Vec<Box<dyn BatchDetector>> =
            vec![Box::new(AtomicHeuristicDetector::new(config.atomic.clone()))];
        let batch: Vec<Box<dyn BatchDetector>> = vec![
            Box::new(CoordinatedSelfTradeDetector::new(config.coordinated.clone())),
            Box::new(CycleDetector::new(config.circular.clone())),
            Box::new(AtomicHeuristicDetector::new(config.atomic.clone())),
            Box::new(AtomicExactDetector::new(config.atomic.clone())),
            Box::new(VolumeSpikeDetector::new(config.volume_spike.clone())),
            Box::new(SybilBatchDetector::new(config.sybil.clone())),
            Box::new(WinRateDetector::new(config.win_rate.clone())),
            Box::new(GasAnomalyDetector::new(config.gas.clone())),
        ];

        Self {
            incremental: Mutex::new(incremental),
            chunk,
            batch,
            positions: Mutex::new(VecDeque::new()),
        }
    }

    /// Remember split/merge events for the exact atomic-wash pass.
    pub fn record_positions(&self, events: &[PositionEvent]) {
        let mut positions = self.positions.lock();
        positions.extend(events.iter().cloned());
        while positions.len() > POSITION_LEDGER_CAP {
            positions.pop_front();
        }
    }

    /// Copy the store's trades and the position ledger for a batch run.
    pub fn snapshot(&self, store: &TradeStore) -> Snapshot {
        let positions: Vec<PositionEvent> = self.positions.lock().iter().cloned().collect();
        Snapshot::new(store.snapshot(), positions)
    }

    /// Run incremental detectors over freshly stored trades, then the
    /// bounded same-block heuristics over the whole chunk. `trades` must be
    /// the trades this chunk actually inserted, in chain order.
    pub fn on_trades(&self, store: &TradeStore, trades: &[Trade]) -> AnalysisReport {
        let started = Instant::now();
        let mut report = AnalysisReport {
            trades_analyzed: trades.len(),
            ..Default::default()
        };
        if trades.is_empty() {
            return report;
        }

        let seen_before = store.stats().total_trades.saturating_sub(trades.len() as u64);
        let mut found = Vec::new();
        {
            let mut detectors = self.incremental.lock();
            for (i, trade) in trades.iter().enumerate() {
                let ctx = DetectContext {
                    prior_trades: seen_before + i as u64,
                };
                for detector in detectors.iter_mut() {
                    let name = detector.name();
                    if let Some(evidence) = isolate(name, || detector.on_trade(trade, &ctx)) {
                        found.extend(evidence);
                    }
                }
            }
            if let Some(latest) = trades.iter().map(|t| t.timestamp).max() {
                for detector in detectors.iter_mut() {
                    detector.trim(latest);
                }
            }
        }

        let chunk = Snapshot::new(trades.to_vec(), Vec::new());
        for detector in &self.chunk {
            if let Some(evidence) = isolate(detector.name(), || detector.detect(&chunk)) {
                found.extend(evidence);
            }
        }

        for evidence in found {
            let outcome = self.apply(store, evidence.clone());
            report.tally(&evidence, outcome);
        }
        report.duration_ms = started.elapsed().as_millis() as u64;
        report
    }

    /// Run every batch detector over `snapshot`. Returns `None` if `cancel`
    /// was raised between detectors.
    pub fn run_batch(&self, snapshot: &Snapshot, cancel: &AtomicBool) -> Option<Vec<Evidence>> {
        let mut found = Vec::new();
        for detector in &self.batch {
            if cancel.load(Ordering::Relaxed) {
                tracing::info!(detector = detector.name(), "Analysis cancelled");
                return None;
            }
            let started = Instant::now();
            if let Some(evidence) = isolate(detector.name(), || detector.detect(snapshot)) {
                tracing::debug!(
                    detector = detector.name(),
                    evidence = evidence.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Batch detector finished"
                );
                found.extend(evidence);
            }
        }
        Some(found)
    }

    /// Write one finding back into the store: mark its trades (for kinds
    /// that tag trades) and append the alert with post-mark trade copies.
    pub fn apply(&self, store: &TradeStore, mut evidence: Evidence) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();

        if let Some(wash_type) = evidence.kind.wash_type() {
            for trade in evidence.trades.iter_mut() {
                let key = trade.key();
                if store.mark_wash(&key, wash_type, evidence.confidence) == MarkOutcome::Flagged {
                    outcome.trades_flagged += 1;
                }
                if let Some(current) = store.get(&key) {
                    *trade = current;
                }
            }
        }

        outcome.alert_appended = store.append_alert(evidence.into_alert());
        outcome
    }
}

/// Run one detector call, turning errors and panics into a logged skip.
fn isolate<F>(name: &'static str, call: F) -> Option<Vec<Evidence>>
where
    F: FnOnce() -> Result<Vec<Evidence>, DetectorError>,
{
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(evidence)) => Some(evidence),
        Ok(Err(e)) => {
            counter!("detector_failures_total", "detector" => name).increment(1);
            tracing::warn!(detector = name, error = %e, "Detector failed");
            None
        }
        Err(_) => {
            counter!("detector_failures_total", "detector" => name).increment(1);
            tracing::error!(detector = name, "Detector panicked");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// On-demand analysis
// ---------------------------------------------------------------------------

/// Run every batch detector over a snapshot of the store.
///
/// The snapshot is copied under the store lock, then the detectors run on
/// a blocking thread without it. A run cancelled through `cancel` applies
/// nothing.
pub async fn run_full_analysis(
    store: Arc<TradeStore>,
    detectors: Arc<DetectorSet>,
    cancel: Arc<AtomicBool>,
) -> anyhow::Result<AnalysisReport> {
    let started = Instant::now();
    let snapshot = detectors.snapshot(&store);
    let mut report = AnalysisReport {
        trades_analyzed: snapshot.trades.len(),
        ..Default::default()
    };

    let set = detectors.clone();
    let flag = cancel.clone();
    let found = tokio::task::spawn_blocking(move || set.run_batch(&snapshot, &flag)).await?;

    match found {
        Some(found) if !cancel.load(Ordering::Relaxed) => {
            for evidence in found {
                let outcome = detectors.apply(&store, evidence.clone());
                report.tally(&evidence, outcome);
            }
        }
        _ => report.cancelled = true,
    }

    report.duration_ms = started.elapsed().as_millis() as u64;
    tracing::info!(
        trades = report.trades_analyzed,
        alerts = report.alerts_appended,
        flagged = report.trades_flagged,
        duration_ms = report.duration_ms,
        cancelled = report.cancelled,
        "Full analysis finished"
    );
    Ok(report)
}
