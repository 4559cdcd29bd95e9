//! Atomic wash: exposure opened and closed inside one block or one
//! transaction.
//!
//! Two paths with different strength. The heuristic looks for a maker
//! that bought and sold roughly the same volume in one block. The exact
//! pass needs the conditional-token side channel and looks for a split, a
//! fill and a merge in the same transaction.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};

use super::{BatchDetector, DetectorError, Evidence, Snapshot};
use crate::models::{AlertType, PositionKind, Side, Trade};

#[derive(Debug, Clone)]
pub struct AtomicConfig {
    /// Buy/sell volume ratio above which a same-block hedge is suspicious.
    pub min_volume_ratio: f64,
    pub exact_confidence: f64,
    /// Exact pattern where the same wallet both split and merged.
    pub exact_same_stakeholder_confidence: f64,
}

impl Default for AtomicConfig {
    fn default() -> Self {
        Self {
            min_volume_ratio: 0.8,
            exact_confidence: 0.99,
            exact_same_stakeholder_confidence: 0.995,
        }
    }
}

pub struct AtomicHeuristicDetector {
    config: AtomicConfig,
}

impl AtomicHeuristicDetector {
    pub fn new(config: AtomicConfig) -> Self {
        Self { config }
    }
}

impl BatchDetector for AtomicHeuristicDetector {
    fn name(&self) -> &'static str {
        "atomic_heuristic"
    }

    fn detect(&self, snapshot: &Snapshot) -> Result<Vec<Evidence>, DetectorError> {
        let mut groups: BTreeMap<(u64, &str), Vec<&Trade>> = BTreeMap::new();
        for trade in snapshot.trades.iter().filter(|t| !t.is_self_trade()) {
            groups
                .entry((trade.block_number, trade.maker.as_str()))
                .or_default()
                .push(trade);
        }

        let mut found = Vec::new();
        for ((block, maker), group) in groups {
            if group.len() < 2 {
                continue;
            }
            let volume_on = |side: Side| -> Decimal {
                group.iter().filter(|t| t.side == side).map(|t| t.notional()).sum()
            };
            let (buy_volume, sell_volume) = (volume_on(Side::Buy), volume_on(Side::Sell));
            let larger = buy_volume.max(sell_volume);
            if buy_volume.is_zero() || sell_volume.is_zero() {
                continue;
            }

            let ratio = (buy_volume.min(sell_volume) / larger).to_f64().unwrap_or(0.0);
            if ratio <= self.config.min_volume_ratio {
                continue;
            }

            let confidence = (0.7 + 0.2 * ratio).min(0.9);
            let count = group.len();
            found.push(
                Evidence::new(AlertType::AtomicWash, group.into_iter().cloned().collect(), confidence)
                    .with_addresses(vec![maker.to_string()])
                    .with_detail("pattern", "buy_sell_hedge")
                    .with_detail("buy_volume", buy_volume.to_string())
                    .with_detail("sell_volume", sell_volume.to_string())
                    .with_detail("volume_ratio", ratio)
                    .with_detail("block_number", block)
                    .with_detail("trade_count", count),
            );
        }
        Ok(found)
    }
}

// ---------------------------------------------------------------------------
// Exact split → fill → merge
// ---------------------------------------------------------------------------

pub struct AtomicExactDetector {
    config: AtomicConfig,
}

impl AtomicExactDetector {
    pub fn new(config: AtomicConfig) -> Self {
        Self { config }
    }
}

#[derive(Default)]
struct TxPositions<'a> {
    splitters: BTreeSet<&'a str>,
    mergers: BTreeSet<&'a str>,
}

impl BatchDetector for AtomicExactDetector {
    fn name(&self) -> &'static str {
        "atomic_exact"
    }

    fn detect(&self, snapshot: &Snapshot) -> Result<Vec<Evidence>, DetectorError> {
        if snapshot.positions.is_empty() {
            return Ok(Vec::new());
        }

        let mut by_tx: BTreeMap<&str, TxPositions> = BTreeMap::new();
        for event in &snapshot.positions {
            let entry = by_tx.entry(event.tx_hash.as_str()).or_default();
            match event.kind {
                PositionKind::Split => entry.splitters.insert(event.stakeholder.as_str()),
                PositionKind::Merge => entry.mergers.insert(event.stakeholder.as_str()),
            };
        }

        let mut fills: BTreeMap<&str, Vec<&Trade>> = BTreeMap::new();
        for trade in &snapshot.trades {
            if by_tx.contains_key(trade.tx_hash.as_str()) {
                fills.entry(trade.tx_hash.as_str()).or_default().push(trade);
            }
        }

        let mut found = Vec::new();
        for (tx_hash, trades) in fills {
            let Some(positions) = by_tx.get(tx_hash) else {
                continue;
            };
            if positions.splitters.is_empty() || positions.mergers.is_empty() {
                continue;
            }

            let same_stakeholder = positions.splitters.intersection(&positions.mergers).next().is_some();
            let confidence = if same_stakeholder {
                self.config.exact_same_stakeholder_confidence
            } else {
                self.config.exact_confidence
            };

            let trades: Vec<Trade> = trades.into_iter().cloned().collect();
            let mut addresses: BTreeSet<String> = trades
                .iter()
                .flat_map(|t| [t.maker.clone(), t.taker.clone()])
                .collect();
            addresses.extend(positions.splitters.iter().map(|s| s.to_string()));
            addresses.extend(positions.mergers.iter().map(|s| s.to_string()));

            found.push(
                Evidence::new(AlertType::AtomicWash, trades, confidence)
                    .with_key(format!("split_trade_merge:{tx_hash}"))
                    .with_addresses(addresses.into_iter().collect())
                    .with_detail("pattern", "split_trade_merge")
                    .with_detail("split_count", positions.splitters.len())
                    .with_detail("merge_count", positions.mergers.len())
                    .with_detail("same_stakeholder", same_stakeholder),
            );
        }
        Ok(found)
    }
}
