//! Per-market health scoring.
//!
//! Every market starts at 100. Each alert touching the market subtracts a
//! penalty of `weight × confidence`, scaled up by
//! `1 + 2 × (alert volume in market / market volume)`. The score is clamped
//! to [0, 100].

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::models::{Alert, AlertType, MarketHealth, Trade};

/// Flat penalty for a volume spike that lines up with a known external event.
const CORRELATED_SPIKE_PENALTY: f64 = 0.5;

#[derive(Debug, Clone, Default)]
pub struct HealthAggregator;

impl HealthAggregator {
    pub fn new() -> Self {
        Self
    }

    /// Base penalty weight per alert kind, heaviest first.
    pub fn weight(alert_type: AlertType) -> f64 {
        match alert_type {
            AlertType::SelfTrade => 6.0,
            AlertType::AtomicWash | AlertType::SybilCluster => 5.0,
            AlertType::Circular => 4.0,
            AlertType::CoordinatedSelfTrade | AlertType::NewWalletInsider => 3.0,
            AlertType::VolumeSpike | AlertType::HighWinRate => 2.0,
            AlertType::GasAnomaly => 1.0,
        }
    }

    /// Penalty this alert applies to one market.
    pub fn penalty(&self, alert: &Alert, volume_in_market: Decimal, market_volume: Decimal) -> f64 {
        let correlated = alert
            .details
            .get("is_correlated_with_event")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let mut penalty = if alert.alert_type == AlertType::VolumeSpike && correlated {
            CORRELATED_SPIKE_PENALTY
        } else {
            Self::weight(alert.alert_type) * alert.confidence.clamp(0.0, 1.0)
        };

        if market_volume > Decimal::ZERO && volume_in_market > Decimal::ZERO {
            let ratio = (volume_in_market / market_volume).to_f64().unwrap_or(0.0);
            penalty *= 1.0 + ratio.clamp(0.0, 1.0) * 2.0;
        }
        penalty
    }

    /// Fold a newly stored trade into its market.
    pub fn record_trade(&self, health: &mut MarketHealth, trade: &Trade) {
        let volume = trade.notional();
        health.total_trades += 1;
        health.total_volume += volume;
        health.unique_traders.insert(trade.maker.clone());
        health.unique_traders.insert(trade.taker.clone());

        if trade.is_wash {
            self.record_wash(health, trade, false);
        } else {
            health.organic_volume += volume;
        }
    }

    /// Move a trade's volume from organic to wash. `was_organic` is false when
    /// the trade arrived already flagged and was never counted as organic.
    pub fn record_wash(&self, health: &mut MarketHealth, trade: &Trade, was_organic: bool) {
        let volume = trade.notional();
        health.wash_trades += 1;
        health.wash_volume += volume;
        if was_organic {
            health.organic_volume -= volume;
        }
        health.suspicious_addresses.insert(trade.maker.clone());
        health.suspicious_addresses.insert(trade.taker.clone());
    }

    /// Apply an alert's penalty to one of the markets it touches.
    pub fn record_alert(&self, health: &mut MarketHealth, alert: &Alert) {
        let volume = alert.volume_in_market(&health.asset_id);
        health.penalty += self.penalty(alert, volume, health.total_volume);
        health.alert_count += 1;
        health
            .suspicious_addresses
            .extend(alert.addresses.iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Severity, Side};
    use approx::assert_relative_eq;
    use chrono::Utc;

    fn make_alert(alert_type: AlertType, confidence: f64, volume: i64) -> Alert {
        Alert {
            alert_id: "X".into(),
            timestamp: Utc::now(),
            alert_type,
            severity: Severity::from_confidence(confidence),
            tx_hash: None,
            asset_id: Some("m1".into()),
            trade_count: 0,
            volume: Decimal::from(volume),
            confidence,
            addresses: vec!["0xa".into()],
            details: serde_json::Map::new(),
            trades: vec![],
            acknowledged: false,
        }
    }

    fn make_trade(size: i64) -> Trade {
        Trade {
            tx_hash: "0x1".into(),
            log_index: 0,
            block_number: 1,
            timestamp: Utc::now(),
            contract: String::new(),
            order_hash: String::new(),
            maker: "0xa".into(),
            taker: "0xb".into(),
            asset_id: "m1".into(),
            side: Side::Buy,
            price: Decimal::ONE,
            size: Decimal::from(size),
            fee: Decimal::ZERO,
            is_wash: false,
            wash_type: None,
            wash_confidence: 0.0,
        }
    }

    #[test]
    fn test_weights_are_ordered() {
        let w = HealthAggregator::weight;
        assert!(w(AlertType::SelfTrade) > w(AlertType::AtomicWash));
        assert_eq!(w(AlertType::AtomicWash), w(AlertType::SybilCluster));
        assert!(w(AlertType::SybilCluster) > w(AlertType::Circular));
        assert!(w(AlertType::Circular) > w(AlertType::VolumeSpike));
        assert!(w(AlertType::HighWinRate) > w(AlertType::GasAnomaly));
    }

    #[test]
    fn test_penalty_scales_with_volume_share() {
        let agg = HealthAggregator::new();
        let alert = make_alert(AlertType::Circular, 0.5, 0);

        let no_volume = agg.penalty(&alert, Decimal::ZERO, Decimal::from(1000));
        assert_relative_eq!(no_volume, 2.0);

        let half = agg.penalty(&alert, Decimal::from(500), Decimal::from(1000));
        assert_relative_eq!(half, 4.0);
    }

    #[test]
    fn test_correlated_spike_is_flat() {
        let agg = HealthAggregator::new();
        let mut alert = make_alert(AlertType::VolumeSpike, 0.9, 0);
        alert
            .details
            .insert("is_correlated_with_event".into(), serde_json::Value::Bool(true));
        assert_relative_eq!(agg.penalty(&alert, Decimal::ZERO, Decimal::ZERO), 0.5);
    }

    #[test]
    fn test_record_trade_then_wash_keeps_volumes_consistent() {
        let agg = HealthAggregator::new();
        let mut health = MarketHealth::new("m1");
        let trade = make_trade(100);

        agg.record_trade(&mut health, &trade);
        agg.record_wash(&mut health, &trade, true);

        assert_eq!(health.total_volume, Decimal::from(100));
        assert_eq!(health.wash_volume, Decimal::from(100));
        assert_eq!(health.organic_volume, Decimal::ZERO);
        assert_eq!(health.unique_traders.len(), 2);
        assert!(health.wash_volume <= health.total_volume);
    }

    #[test]
    fn test_alerts_lower_score_and_clamp() {
        let agg = HealthAggregator::new();
        let mut health = MarketHealth::new("m1");
        agg.record_trade(&mut health, &make_trade(100));

        let alert = make_alert(AlertType::SelfTrade, 1.0, 100);
        agg.record_alert(&mut health, &alert);
        // 6 × 1.0 × (1 + 2 × 1.0)
        assert_relative_eq!(health.score(), 82.0);

        for _ in 0..20 {
            agg.record_alert(&mut health, &alert);
        }
        assert_eq!(health.score(), 0.0);
        assert_eq!(health.alert_count, 21);
    }
}
