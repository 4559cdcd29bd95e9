use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

use super::{BatchDetector, DetectorError, Evidence, Snapshot};
use crate::models::{AlertType, Trade};

#[derive(Debug, Clone)]
pub struct GasConfig {
    pub block_window: u64,
    pub multiplier: f64,
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            block_window: 10,
            multiplier: 2.0,
        }
    }
}

/// Fills paying far more fee than their neighbours, a front-running tell.
/// The fee stands in for the priority fee since logs do not carry gas.
pub struct GasAnomalyDetector {
    config: GasConfig,
}

impl GasAnomalyDetector {
    pub fn new(config: GasConfig) -> Self {
        Self { config }
    }
}

fn median(values: &mut [Decimal]) -> Decimal {
    if values.is_empty() {
        return Decimal::ZERO;
    }
    values.sort_unstable();
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / Decimal::TWO
    } else {
        values[mid]
    }
}

impl BatchDetector for GasAnomalyDetector {
    fn name(&self) -> &'static str {
        "gas_anomaly"
    }

    fn detect(&self, snapshot: &Snapshot) -> Result<Vec<Evidence>, DetectorError> {
        if self.config.block_window == 0 {
            return Err(DetectorError::MalformedWindow("gas block window is zero".into()));
        }

        let mut windows: BTreeMap<u64, Vec<&Trade>> = BTreeMap::new();
        for trade in &snapshot.trades {
            windows
                .entry(trade.block_number / self.config.block_window * self.config.block_window)
                .or_default()
                .push(trade);
        }

        let mut found = Vec::new();
        for (window_start, trades) in windows {
            let mut fees: Vec<Decimal> = trades.iter().map(|t| t.fee).collect();
            let median_fee = median(&mut fees);
            if median_fee <= Decimal::ZERO {
                continue;
            }

            for trade in trades {
                let ratio = (trade.fee / median_fee).to_f64().unwrap_or(0.0);
                if ratio <= self.config.multiplier {
                    continue;
                }
                let confidence = (0.5 + 0.1 * (ratio - self.config.multiplier)).min(0.95);
                found.push(
                    Evidence::new(AlertType::GasAnomaly, vec![trade.clone()], confidence)
                        .with_detail("fee", trade.fee.to_string())
                        .with_detail("median_fee", median_fee.to_string())
                        .with_detail("fee_ratio", ratio)
                        .with_detail("block_number", trade.block_number)
                        .with_detail("block_window", window_start),
                );
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::test_support::trade;
    use crate::models::Side;
    use approx::assert_relative_eq;

    fn with_fee(seq: u64, fee: i64) -> Trade {
        let mut t = trade(seq, seq as i64, "0xa", "0xb", Side::Buy, "0.5", "10");
        t.block_number = 2_000 + seq;
        t.fee = Decimal::from(fee);
        t
    }

    #[test]
    fn test_fee_far_above_median() {
        let detector = GasAnomalyDetector::new(GasConfig::default());
        let snapshot = Snapshot::new(vec![with_fee(1, 1), with_fee(2, 1), with_fee(3, 5)], vec![]);
        let found = detector.detect(&snapshot).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].trades[0].log_index, 3);
        assert_relative_eq!(found[0].confidence, 0.8, epsilon = 1e-9);
    }

    #[test]
    fn test_zero_fee_windows_are_skipped() {
        let detector = GasAnomalyDetector::new(GasConfig::default());
        let snapshot = Snapshot::new(vec![with_fee(1, 0), with_fee(2, 0), with_fee(3, 7)], vec![]);
        assert!(detector.detect(&snapshot).unwrap().is_empty());
    }

    #[test]
    fn test_median_of_even_count() {
        let mut values = vec![Decimal::from(4), Decimal::from(1), Decimal::from(3), Decimal::from(2)];
        assert_eq!(median(&mut values), Decimal::new(25, 1));
    }
}
