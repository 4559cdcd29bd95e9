//! Circular fund flows.
//!
//! The incremental pass pairs a trade with an earlier one in the same market
//! where maker and taker swapped roles inside a short window. The batch pass
//! builds a payer → receiver graph per market and hour and enumerates simple
//! cycles of length 2 to 4.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use super::{BatchDetector, DetectContext, DetectorError, Evidence, IncrementalDetector, Snapshot};
use crate::models::{AlertType, Trade};

/// Cycle volume at which the volume bonus is fully earned.
const FULL_BONUS_VOLUME: f64 = 10_000.0;

#[derive(Debug, Clone)]
pub struct CircularConfig {
    /// Pairing window for the incremental pass.
    pub window: Duration,
    /// Graph bucket for the batch pass.
    pub bucket: Duration,
    pub min_bucket_trades: usize,
    pub max_cycle_len: usize,
    pub min_cycle_volume: Decimal,
    pub incremental_base: f64,
    pub batch_base: f64,
    pub ring_capacity: usize,
    /// Stop enumerating a bucket after this many cycles.
    pub max_cycles_per_bucket: usize,
}

impl Default for CircularConfig {
    fn default() -> Self {
        Self {
            window: Duration::seconds(60),
            bucket: Duration::minutes(60),
            min_bucket_trades: 3,
            max_cycle_len: 4,
            min_cycle_volume: Decimal::from(100),
            incremental_base: 0.75,
            batch_base: 0.6,
            ring_capacity: 10_000,
            max_cycles_per_bucket: 1_000,
        }
    }
}

/// `base` plus up to 0.1 for volume, capped at 0.95; two-hop cycles get a
/// further 0.1, capped at 0.98.
pub fn cycle_confidence(base: f64, cycle_len: usize, volume: Decimal) -> f64 {
    let volume = volume.to_f64().unwrap_or(0.0).max(0.0);
    let confidence = (base + 0.1 * (volume / FULL_BONUS_VOLUME).min(1.0)).min(0.95);
    if cycle_len == 2 {
        (confidence + 0.1).min(0.98)
    } else {
        confidence
    }
}

// ---------------------------------------------------------------------------
// Incremental pairs
// ---------------------------------------------------------------------------

pub struct CircularPairDetector {
    config: CircularConfig,
    recent: VecDeque<Trade>,
}

impl CircularPairDetector {
    pub fn new(config: CircularConfig) -> Self {
        Self {
            config,
            recent: VecDeque::new(),
        }
    }

    fn evict_before(&mut self, cutoff: DateTime<Utc>) {
        while self.recent.front().is_some_and(|t| t.timestamp < cutoff) {
            self.recent.pop_front();
        }
    }
}

impl IncrementalDetector for CircularPairDetector {
    fn name(&self) -> &'static str {
        "circular_pair"
    }

    fn on_trade(&mut self, trade: &Trade, _ctx: &DetectContext) -> Result<Vec<Evidence>, DetectorError> {
        if trade.is_self_trade() {
            return Ok(Vec::new());
        }
        self.evict_before(trade.timestamp - self.config.window);

        let found = self
            .recent
            .iter()
            .filter(|prior| {
                prior.asset_id == trade.asset_id
                    && prior.maker == trade.taker
                    && prior.taker == trade.maker
                    && (trade.timestamp - prior.timestamp).abs() <= self.config.window
            })
            .map(|prior| {
                let volume = prior.notional() + trade.notional();
                let confidence = cycle_confidence(self.config.incremental_base, 2, volume);
                let gap = (trade.timestamp - prior.timestamp).num_seconds().abs();
                Evidence::new(AlertType::Circular, vec![prior.clone(), trade.clone()], confidence)
                    .with_detail("pattern", "reciprocal_pair")
                    .with_detail("cycle_length", 2)
                    .with_detail("cycle_path", vec![trade.maker.clone(), trade.taker.clone(), trade.maker.clone()])
                    .with_detail("time_gap_seconds", gap)
            })
            .collect();

        self.recent.push_back(trade.clone());
        while self.recent.len() > self.config.ring_capacity {
            self.recent.pop_front();
        }
        Ok(found)
    }

    fn trim(&mut self, now: DateTime<Utc>) {
        self.evict_before(now - self.config.window);
    }
}

// ---------------------------------------------------------------------------
// Batch cycle search
// ---------------------------------------------------------------------------

pub struct CycleDetector {
    config: CircularConfig,
}

impl CycleDetector {
    pub fn new(config: CircularConfig) -> Self {
        Self { config }
    }

    fn bucket_cycles(&self, trades: &[&Trade]) -> Vec<Evidence> {
        let mut edges: BTreeMap<(&str, &str), Vec<&Trade>> = BTreeMap::new();
        let mut graph: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for trade in trades {
            let (from, to) = (trade.cash_payer(), trade.cash_receiver());
            edges.entry((from, to)).or_default().push(trade);
            graph.entry(from).or_default().insert(to);
        }

        let mut cycles = Vec::new();
        for &start in graph.keys() {
            let mut path = vec![start];
            self.walk(&graph, start, &mut path, &mut cycles);
            if cycles.len() >= self.config.max_cycles_per_bucket {
                tracing::debug!(limit = self.config.max_cycles_per_bucket, "Cycle enumeration truncated");
                break;
            }
        }

        let mut seen: HashSet<Vec<&str>> = HashSet::new();
        let mut found = Vec::new();
        for cycle in cycles {
            let mut members = cycle.clone();
            members.sort_unstable();
            if !seen.insert(members) {
                continue;
            }

            let hops: Vec<(&str, &str)> = (0..cycle.len())
                .map(|i| (cycle[i], cycle[(i + 1) % cycle.len()]))
                .collect();
            let matched: Vec<Trade> = hops
                .iter()
                .flat_map(|hop| edges.get(hop).into_iter().flatten())
                .map(|t| (*t).clone())
                .collect();
            let volume: Decimal = matched.iter().map(Trade::notional).sum();
            if volume < self.config.min_cycle_volume {
                continue;
            }

            let first = matched.iter().map(|t| t.timestamp).min();
            let last = matched.iter().map(|t| t.timestamp).max();
            let span_minutes = match (first, last) {
                (Some(a), Some(b)) => (b - a).num_seconds() as f64 / 60.0,
                _ => 0.0,
            };
            let mut path: Vec<String> = cycle.iter().map(|a| a.to_string()).collect();
            path.push(cycle[0].to_string());

            let confidence = cycle_confidence(self.config.batch_base, cycle.len(), volume);
            let tx_hashes: BTreeSet<&str> = matched.iter().map(|t| t.tx_hash.as_str()).collect();
            let tx_hashes: Vec<String> = tx_hashes.into_iter().map(str::to_string).collect();
            found.push(
                Evidence::new(AlertType::Circular, matched, confidence)
                    .with_detail("pattern", "fund_flow_cycle")
                    .with_detail("cycle_path", path)
                    .with_detail("cycle_length", cycle.len())
                    .with_detail("all_tx_hashes", tx_hashes)
                    .with_detail("time_span_minutes", span_minutes),
            );
        }
        found
    }

    /// Depth-first search for simple cycles that start at `path[0]` and only
    /// visit larger nodes, so each cycle is found once from its smallest
    /// member.
    fn walk<'a>(
        &self,
        graph: &BTreeMap<&'a str, BTreeSet<&'a str>>,
        node: &'a str,
        path: &mut Vec<&'a str>,
        cycles: &mut Vec<Vec<&'a str>>,
    ) {
        if cycles.len() >= self.config.max_cycles_per_bucket {
            return;
        }
        let start = path[0];
        let Some(next) = graph.get(node) else {
            return;
        };
        for &to in next {
            if to == start && path.len() >= 2 {
                cycles.push(path.clone());
            } else if to > start && !path.contains(&to) && path.len() < self.config.max_cycle_len {
                path.push(to);
                self.walk(graph, to, path, cycles);
                path.pop();
            }
        }
    }
}

impl BatchDetector for CycleDetector {
    fn name(&self) -> &'static str {
        "circular_cycle"
    }

    fn detect(&self, snapshot: &Snapshot) -> Result<Vec<Evidence>, DetectorError> {
        let bucket_secs = self.config.bucket.num_seconds();
        if bucket_secs <= 0 {
            return Err(DetectorError::MalformedWindow(format!(
                "cycle bucket must be positive, got {bucket_secs}s"
            )));
        }

        let mut buckets: BTreeMap<(&str, i64), Vec<&Trade>> = BTreeMap::new();
        for trade in snapshot.trades.iter().filter(|t| !t.is_self_trade()) {
            let bucket = trade.timestamp.timestamp().div_euclid(bucket_secs);
            buckets.entry((trade.asset_id.as_str(), bucket)).or_default().push(trade);
        }

        Ok(buckets
            .values()
            .filter(|trades| trades.len() >= self.config.min_bucket_trades)
            .flat_map(|trades| self.bucket_cycles(trades))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::test_support::trade;
    use crate::models::Side;
    use approx::assert_relative_eq;

    #[test]
    fn test_reciprocal_pair_inside_window() {
        let mut detector = CircularPairDetector::new(CircularConfig::default());
        let ctx = DetectContext::default();
        let t1 = trade(1, 0, "0xa", "0xb", Side::Buy, "0.5", "100");
        let t2 = trade(2, 30, "0xb", "0xa", Side::Buy, "0.5", "100");

        assert!(detector.on_trade(&t1, &ctx).unwrap().is_empty());
        let found = detector.on_trade(&t2, &ctx).unwrap();
        assert_eq!(found.len(), 1);
        let keys: Vec<_> = found[0].trades.iter().map(Trade::key).collect();
        assert_eq!(keys, vec![t1.key(), t2.key()]);
        assert_relative_eq!(found[0].confidence, 0.851, epsilon = 1e-9);
    }

    #[test]
    fn test_pair_outside_window_is_ignored() {
        let mut detector = CircularPairDetector::new(CircularConfig::default());
        let ctx = DetectContext::default();
        detector.on_trade(&trade(1, 0, "0xa", "0xb", Side::Buy, "0.5", "100"), &ctx).unwrap();
        let late = trade(2, 61, "0xb", "0xa", Side::Buy, "0.5", "100");
        assert!(detector.on_trade(&late, &ctx).unwrap().is_empty());
    }

    #[test]
    fn test_other_market_is_not_a_pair() {
        let mut detector = CircularPairDetector::new(CircularConfig::default());
        let ctx = DetectContext::default();
        detector.on_trade(&trade(1, 0, "0xa", "0xb", Side::Buy, "0.5", "100"), &ctx).unwrap();
        let mut other = trade(2, 10, "0xb", "0xa", Side::Buy, "0.5", "100");
        other.asset_id = "asset-y".into();
        assert!(detector.on_trade(&other, &ctx).unwrap().is_empty());
    }

    #[test]
    fn test_confidence_bonuses() {
        assert_relative_eq!(cycle_confidence(0.6, 3, Decimal::from(100_000)), 0.7);
        assert_relative_eq!(cycle_confidence(0.85, 2, Decimal::from(10_000)), 0.98);
        assert_relative_eq!(cycle_confidence(0.6, 4, Decimal::ZERO), 0.6);
    }

    #[test]
    fn test_three_hop_cycle_found_once() {
        let detector = CycleDetector::new(CircularConfig::default());
        let snapshot = Snapshot::new(
            vec![
                trade(1, 0, "0xa", "0xb", Side::Buy, "0.5", "200"),
                trade(2, 60, "0xb", "0xc", Side::Buy, "0.5", "200"),
                trade(3, 120, "0xc", "0xa", Side::Buy, "0.5", "200"),
                trade(4, 180, "0xd", "0xe", Side::Buy, "0.5", "200"),
            ],
            vec![],
        );
        let found = detector.detect(&snapshot).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].trades.len(), 3);
        assert_eq!(found[0].details["cycle_length"], 3);
        assert_eq!(found[0].volume, Decimal::from(300));
    }

    #[test]
    fn test_small_cycle_below_volume_floor() {
        let detector = CycleDetector::new(CircularConfig::default());
        let snapshot = Snapshot::new(
            vec![
                trade(1, 0, "0xa", "0xb", Side::Buy, "0.5", "10"),
                trade(2, 60, "0xb", "0xc", Side::Buy, "0.5", "10"),
                trade(3, 120, "0xc", "0xa", Side::Buy, "0.5", "10"),
            ],
            vec![],
        );
        assert!(detector.detect(&snapshot).unwrap().is_empty());
    }
}
