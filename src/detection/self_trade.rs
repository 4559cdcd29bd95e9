use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};

use super::{BatchDetector, DetectContext, DetectorError, Evidence, IncrementalDetector, Snapshot};
use crate::models::{AlertType, Trade};

/// Maker and taker are the same wallet. Always certain.
pub struct SelfTradeDetector;

impl IncrementalDetector for SelfTradeDetector {
    fn name(&self) -> &'static str {
        "self_trade"
    }

    fn on_trade(&mut self, trade: &Trade, _ctx: &DetectContext) -> Result<Vec<Evidence>, DetectorError> {
        if !trade.is_self_trade() {
            return Ok(Vec::new());
        }
        Ok(vec![Evidence::new(AlertType::SelfTrade, vec![trade.clone()], 1.0)
            .with_detail("address", trade.maker.clone())])
    }
}

// ---------------------------------------------------------------------------
// Coordinated self-trade
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CoordinatedConfig {
    /// Group size at which a repeated (size, price, minute) fill is reported.
    pub min_trades: usize,
    /// More distinct wallets than this and the group looks like a real book.
    pub max_addresses: usize,
}

impl Default for CoordinatedConfig {
    fn default() -> Self {
        Self {
            min_trades: 2,
            max_addresses: 4,
        }
    }
}

/// Identical fills (same market, size and price within one minute) passed
/// between a handful of wallets. Alert only; trades are not marked.
pub struct CoordinatedSelfTradeDetector {
    config: CoordinatedConfig,
}

impl CoordinatedSelfTradeDetector {
    pub fn new(config: CoordinatedConfig) -> Self {
        Self { config }
    }
}

impl BatchDetector for CoordinatedSelfTradeDetector {
    fn name(&self) -> &'static str {
        "coordinated_self_trade"
    }

    fn detect(&self, snapshot: &Snapshot) -> Result<Vec<Evidence>, DetectorError> {
        let mut groups: BTreeMap<(&str, Decimal, Decimal, i64), Vec<&Trade>> = BTreeMap::new();
        for trade in &snapshot.trades {
            let minute = trade.timestamp.timestamp().div_euclid(60);
            groups
                .entry((trade.asset_id.as_str(), trade.size.normalize(), trade.price.normalize(), minute))
                .or_default()
                .push(trade);
        }

        let mut found = Vec::new();
        for ((_, size, price, minute), group) in groups {
            if group.len() < self.config.min_trades {
                continue;
            }
            let addresses: BTreeSet<&str> = group
                .iter()
                .flat_map(|t| [t.maker.as_str(), t.taker.as_str()])
                .collect();
            if addresses.len() > self.config.max_addresses {
                continue;
            }

            let n = group.len();
            let confidence = (0.5 + 0.1 * n as f64).min(0.8);
            found.push(
                Evidence::new(
                    AlertType::CoordinatedSelfTrade,
                    group.into_iter().cloned().collect(),
                    confidence,
                )
                .with_detail("size", size.to_string())
                .with_detail("price", price.to_string())
                .with_detail("minute", minute * 60)
                .with_detail("address_count", addresses.len()),
            );
        }
        Ok(found)
    }
}
