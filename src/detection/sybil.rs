//! Sybil clusters: several distinct makers piling into the same market and
//! side within seconds, with near-identical sizes.
//!
//! Cluster ids are `<asset>:<side>:<10s bucket of the first trade>` on both
//! paths, so the incremental and batch passes usually report the same
//! cluster under the same alert id.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use super::{BatchDetector, DetectContext, DetectorError, Evidence, IncrementalDetector, Snapshot};
use crate::models::{AlertType, Side, Trade};

#[derive(Debug, Clone)]
pub struct SybilConfig {
    pub window: Duration,
    pub batch_min_makers: usize,
    pub batch_tolerance: f64,
    /// Share of trades in a bucket that must be within tolerance of the mean.
    pub min_similar_share: f64,
    pub incremental_min_makers: usize,
    pub incremental_tolerance: f64,
    pub volume_floor: Decimal,
    /// Clusters sharing more than this share of addresses are merged.
    pub merge_overlap: f64,
    pub ring_capacity: usize,
}

impl Default for SybilConfig {
    fn default() -> Self {
        Self {
            window: Duration::seconds(10),
            batch_min_makers: 3,
            batch_tolerance: 0.2,
            min_similar_share: 0.6,
            incremental_min_makers: 5,
            incremental_tolerance: 0.15,
            volume_floor: Decimal::from(100),
            merge_overlap: 0.5,
            ring_capacity: 10_000,
        }
    }
}

fn cluster_confidence(makers: usize, similar_share: f64) -> f64 {
    (0.5 + 0.05 * makers as f64 + 0.2 * similar_share).min(0.95)
}

/// |a ∩ b| / max(|a|, |b|)
fn overlap(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let larger = a.len().max(b.len());
    if larger == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / larger as f64
}

/// Share of `sizes` within `tolerance` of their mean, and the mask of which
/// ones are.
fn similar_sizes(sizes: &[Decimal], tolerance: f64) -> (f64, Vec<bool>) {
    if sizes.is_empty() {
        return (0.0, Vec::new());
    }
    let mean = sizes.iter().sum::<Decimal>() / Decimal::from(sizes.len());
    let Some(mean) = mean.to_f64().filter(|m| *m > 0.0) else {
        return (0.0, vec![false; sizes.len()]);
    };
    let mask: Vec<bool> = sizes
        .iter()
        .map(|s| ((s.to_f64().unwrap_or(0.0) - mean).abs() / mean) < tolerance)
        .collect();
    let share = mask.iter().filter(|m| **m).count() as f64 / sizes.len() as f64;
    (share, mask)
}

fn cluster_id(asset_id: &str, side: Side, first: DateTime<Utc>, window: Duration) -> String {
    let bucket = first.timestamp().div_euclid(window.num_seconds().max(1));
    format!("{asset_id}:{side}:{bucket}")
}

#[derive(Clone)]
struct Cluster {
    id: String,
    asset_id: String,
    side: Side,
    makers: BTreeSet<String>,
    trades: Vec<Trade>,
    first_bucket: i64,
    last_bucket: i64,
    last_seen: DateTime<Utc>,
    confidence: f64,
}

impl Cluster {
    fn absorb(&mut self, other: Cluster) {
        let known: HashSet<_> = self.trades.iter().map(Trade::key).collect();
        self.trades
            .extend(other.trades.into_iter().filter(|t| !known.contains(&t.key())));
        self.makers.extend(other.makers);
        self.first_bucket = self.first_bucket.min(other.first_bucket);
        self.last_bucket = self.last_bucket.max(other.last_bucket);
        self.last_seen = self.last_seen.max(other.last_seen);
        self.confidence = self.confidence.max(other.confidence);
    }

    fn into_evidence(self, pattern: &str) -> Evidence {
        let volume: Decimal = self.trades.iter().map(Trade::notional).sum();
        Evidence::new(AlertType::SybilCluster, self.trades, self.confidence)
            .with_key(self.id.clone())
            .with_addresses(self.makers.iter().cloned().collect())
            .with_detail("pattern", pattern)
            .with_detail("cluster_id", self.id)
            .with_detail("cluster_size", self.makers.len())
            .with_detail("market_id", self.asset_id)
            .with_detail("side", self.side.as_str())
            .with_detail("cluster_volume", volume.to_string())
    }
}

// ---------------------------------------------------------------------------
// Incremental window
// ---------------------------------------------------------------------------

pub struct SybilWindowDetector {
    config: SybilConfig,
    recent: VecDeque<Trade>,
    clusters: Vec<Cluster>,
}

impl SybilWindowDetector {
    pub fn new(config: SybilConfig) -> Self {
        Self {
            config,
            recent: VecDeque::new(),
            clusters: Vec::new(),
        }
    }

    fn evict_before(&mut self, cutoff: DateTime<Utc>) {
        while self.recent.front().is_some_and(|t| t.timestamp < cutoff) {
            self.recent.pop_front();
        }
        self.clusters.retain(|c| c.last_seen >= cutoff);
    }
}

impl IncrementalDetector for SybilWindowDetector {
    fn name(&self) -> &'static str {
        "sybil_window"
    }

    fn on_trade(&mut self, trade: &Trade, _ctx: &DetectContext) -> Result<Vec<Evidence>, DetectorError> {
        let window = self.config.window;
        self.evict_before(trade.timestamp - window);
        self.recent.push_back(trade.clone());
        while self.recent.len() > self.config.ring_capacity {
            self.recent.pop_front();
        }

        let candidates: Vec<&Trade> = self
            .recent
            .iter()
            .filter(|t| {
                t.asset_id == trade.asset_id
                    && t.side == trade.side
                    && (trade.timestamp - t.timestamp).abs() <= window
            })
            .collect();
        let sizes: Vec<Decimal> = candidates.iter().map(|t| t.size).collect();
        let (share, mask) = similar_sizes(&sizes, self.config.incremental_tolerance);

        let similar: Vec<&Trade> = candidates
            .into_iter()
            .zip(mask)
            .filter_map(|(t, ok)| ok.then_some(t))
            .collect();
        let makers: BTreeSet<String> = similar.iter().map(|t| t.maker.clone()).collect();
        if makers.len() < self.config.incremental_min_makers {
            return Ok(Vec::new());
        }
        let volume: Decimal = similar.iter().map(|t| t.notional()).sum();
        if volume < self.config.volume_floor {
            return Ok(Vec::new());
        }

        let first = similar.iter().map(|t| t.timestamp).min().unwrap_or(trade.timestamp);
        let bucket = first.timestamp().div_euclid(window.num_seconds().max(1));
        let candidate = Cluster {
            id: cluster_id(&trade.asset_id, trade.side, first, window),
            asset_id: trade.asset_id.clone(),
            side: trade.side,
            makers,
            trades: similar.into_iter().cloned().collect(),
            first_bucket: bucket,
            last_bucket: bucket,
            last_seen: trade.timestamp,
            confidence: 0.0,
        };

        let existing = self.clusters.iter().position(|c| {
            c.asset_id == candidate.asset_id
                && c.side == candidate.side
                && overlap(&c.makers, &candidate.makers) > self.config.merge_overlap
        });
        let cluster = match existing {
            Some(i) => {
                let cluster = &mut self.clusters[i];
                cluster.absorb(candidate);
                cluster
            }
            None => {
                self.clusters.push(candidate);
                let last = self.clusters.len() - 1;
                &mut self.clusters[last]
            }
        };
        cluster.confidence = cluster.confidence.max(cluster_confidence(cluster.makers.len(), share));

        Ok(vec![cluster.clone().into_evidence("incremental_window")])
    }

    fn trim(&mut self, now: DateTime<Utc>) {
        self.evict_before(now - self.config.window);
    }
}

// ---------------------------------------------------------------------------
// Batch buckets + merge
// ---------------------------------------------------------------------------

pub struct SybilBatchDetector {
    config: SybilConfig,
}

impl SybilBatchDetector {
    pub fn new(config: SybilConfig) -> Self {
        Self { config }
    }

    /// Merge clusters of the same market and side whose buckets touch and
    /// whose makers overlap by more than the configured share.
    fn merge(&self, clusters: Vec<Cluster>) -> Vec<Cluster> {
        let mut by_market: BTreeMap<(String, Side), Vec<Cluster>> = BTreeMap::new();
        for cluster in clusters {
            by_market
                .entry((cluster.asset_id.clone(), cluster.side))
                .or_default()
                .push(cluster);
        }

        let mut merged = Vec::new();
        for (_, mut group) in by_market {
            group.sort_by_key(|c| c.first_bucket);
            loop {
                let mut changed = false;
                let mut i = 0;
                while i < group.len() {
                    let mut j = i + 1;
                    while j < group.len() {
                        let adjacent = group[j].first_bucket <= group[i].last_bucket + 1
                            && group[i].first_bucket <= group[j].last_bucket + 1;
                        if adjacent && overlap(&group[i].makers, &group[j].makers) > self.config.merge_overlap {
                            let other = group.remove(j);
                            group[i].absorb(other);
                            changed = true;
                        } else {
                            j += 1;
                        }
                    }
                    i += 1;
                }
                if !changed {
                    break;
                }
            }
            merged.extend(group);
        }
        merged
    }
}

impl BatchDetector for SybilBatchDetector {
    fn name(&self) -> &'static str {
        "sybil_batch"
    }

    fn detect(&self, snapshot: &Snapshot) -> Result<Vec<Evidence>, DetectorError> {
        let window_secs = self.config.window.num_seconds();
        if window_secs <= 0 {
            return Err(DetectorError::MalformedWindow(format!(
                "sybil window must be positive, got {window_secs}s"
            )));
        }

        let mut buckets: BTreeMap<(&str, Side, i64), Vec<&Trade>> = BTreeMap::new();
        for trade in &snapshot.trades {
            let bucket = trade.timestamp.timestamp().div_euclid(window_secs);
            buckets
                .entry((trade.asset_id.as_str(), trade.side, bucket))
                .or_default()
                .push(trade);
        }

        let mut clusters = Vec::new();
        for ((asset_id, side, bucket), trades) in buckets {
            let makers: BTreeSet<String> = trades.iter().map(|t| t.maker.clone()).collect();
            if makers.len() < self.config.batch_min_makers {
                continue;
            }
            let sizes: Vec<Decimal> = trades.iter().map(|t| t.size).collect();
            let (share, _) = similar_sizes(&sizes, self.config.batch_tolerance);
            if share < self.config.min_similar_share {
                continue;
            }
            let volume: Decimal = trades.iter().map(|t| t.notional()).sum();
            if volume < self.config.volume_floor {
                continue;
            }

            let first = trades.iter().map(|t| t.timestamp).min().unwrap_or_default();
            let last_seen = trades.iter().map(|t| t.timestamp).max().unwrap_or_default();
            clusters.push(Cluster {
                id: cluster_id(asset_id, side, first, self.config.window),
                asset_id: asset_id.to_string(),
                side,
                confidence: cluster_confidence(makers.len(), share),
                makers,
                trades: trades.into_iter().cloned().collect(),
                first_bucket: bucket,
                last_bucket: bucket,
                last_seen,
            });
        }

        Ok(self
            .merge(clusters)
            .into_iter()
            .map(|c| c.into_evidence("bucketed_batch"))
            .collect())
    }
}
