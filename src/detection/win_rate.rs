use std::collections::{BTreeMap, HashMap};

use super::{BatchDetector, DetectorError, Evidence, Snapshot};
use crate::models::{AlertType, Side, Trade};

#[derive(Debug, Clone)]
pub struct WinRateConfig {
    pub min_judged: usize,
    pub min_win_rate: f64,
}

impl Default for WinRateConfig {
    fn default() -> Self {
        Self {
            min_judged: 10,
            min_win_rate: 0.9,
        }
    }
}

/// Wallets that are almost always on the right side of the next price move.
///
/// A trade counts as a win when the following trade in the same market moved
/// the price in the trade's favor: up after a BUY, down after a SELL. The
/// judgement is credited to both counterparties. The last trade of each
/// market cannot be judged.
pub struct WinRateDetector {
    config: WinRateConfig,
}

#[derive(Default)]
struct Record<'a> {
    wins: usize,
    judged: usize,
    trades: Vec<&'a Trade>,
}

impl WinRateDetector {
    pub fn new(config: WinRateConfig) -> Self {
        Self { config }
    }
}

impl BatchDetector for WinRateDetector {
    fn name(&self) -> &'static str {
        "win_rate"
    }

    fn detect(&self, snapshot: &Snapshot) -> Result<Vec<Evidence>, DetectorError> {
        if !snapshot.is_chain_ordered() {
            return Err(DetectorError::MalformedWindow("snapshot not in chain order".into()));
        }

        let mut markets: HashMap<&str, Vec<&Trade>> = HashMap::new();
        for trade in &snapshot.trades {
            markets.entry(trade.asset_id.as_str()).or_default().push(trade);
        }

        let mut wallets: BTreeMap<&str, Record> = BTreeMap::new();
        for series in markets.values() {
            for pair in series.windows(2) {
                let (trade, next) = (pair[0], pair[1]);
                let won = match trade.side {
                    Side::Buy => next.price > trade.price,
                    Side::Sell => next.price < trade.price,
                };
                let mut parties = vec![trade.maker.as_str(), trade.taker.as_str()];
                parties.dedup();
                for wallet in parties {
                    let record = wallets.entry(wallet).or_default();
                    record.judged += 1;
                    if won {
                        record.wins += 1;
                    }
                    record.trades.push(trade);
                }
            }
        }

        let mut found = Vec::new();
        for (wallet, record) in wallets {
            if record.judged < self.config.min_judged {
                continue;
            }
            let win_rate = record.wins as f64 / record.judged as f64;
            if win_rate < self.config.min_win_rate {
                continue;
            }

            let mut evidence = Evidence::new(
                AlertType::HighWinRate,
                record.trades.into_iter().cloned().collect(),
                win_rate.min(0.95),
            )
            .with_key(wallet.to_string())
            .with_addresses(vec![wallet.to_string()])
            .with_detail("win_rate", win_rate)
            .with_detail("successful_trades", record.wins)
            .with_detail("total_judged_trades", record.judged);
            evidence.asset_id = None;
            found.push(evidence);
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::test_support::trade;
    use approx::assert_relative_eq;

    /// The insider buys before every uptick; a rotating crowd takes the
    /// other side.
    fn rising_series(n: u64) -> Vec<Trade> {
        (0..n)
            .map(|i| {
                let price = format!("0.{}", 10 + i);
                trade(i, i as i64 * 10, "0xinsider", &format!("0xcrowd{i}"), Side::Buy, &price, "10")
            })
            .collect()
    }

    #[test]
    fn test_consistent_winner_is_flagged() {
        let detector = WinRateDetector::new(WinRateConfig::default());
        let found = detector.detect(&Snapshot::new(rising_series(12), vec![])).unwrap();

        let insider: Vec<_> = found.iter().filter(|e| e.addresses == ["0xinsider"]).collect();
        assert_eq!(insider.len(), 1);
        assert_relative_eq!(insider[0].confidence, 0.95);
        assert_eq!(insider[0].details["total_judged_trades"], 11);
        assert!(insider[0].asset_id.is_none());
    }

    #[test]
    fn test_too_few_judged_trades() {
        let detector = WinRateDetector::new(WinRateConfig::default());
        let found = detector.detect(&Snapshot::new(rising_series(10), vec![])).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_unordered_snapshot_is_rejected() {
        let detector = WinRateDetector::new(WinRateConfig::default());
        let mut snapshot = Snapshot::new(rising_series(3), vec![]);
        snapshot.trades.reverse();
        assert!(detector.detect(&snapshot).is_err());
    }
}
