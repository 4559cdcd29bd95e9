use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

use super::{BatchDetector, DetectorError, Evidence, Snapshot};
use crate::models::{AlertType, Trade};

#[derive(Debug, Clone)]
pub struct VolumeSpikeConfig {
    pub bin: Duration,
    /// Preceding non-empty bins averaged into the baseline (one hour of 5-minute bins).
    pub baseline_bins: usize,
    /// Markets with fewer populated bins are skipped.
    pub min_bins: usize,
    pub threshold: f64,
    /// A known external event this close to the bin discounts the spike.
    pub event_window: Duration,
    pub known_events: Vec<DateTime<Utc>>,
}

impl Default for VolumeSpikeConfig {
    fn default() -> Self {
        Self {
            bin: Duration::minutes(5),
            baseline_bins: 12,
            min_bins: 3,
            threshold: 10.0,
            event_window: Duration::hours(1),
            known_events: Vec::new(),
        }
    }
}

pub struct VolumeSpikeDetector {
    config: VolumeSpikeConfig,
}

impl VolumeSpikeDetector {
    pub fn new(config: VolumeSpikeConfig) -> Self {
        Self { config }
    }

    fn correlated_event(&self, bin_start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.config
            .known_events
            .iter()
            .copied()
            .find(|event| (bin_start - *event).abs() < self.config.event_window)
    }
}

struct Bin<'a> {
    index: i64,
    volume: Decimal,
    trades: Vec<&'a Trade>,
}

impl BatchDetector for VolumeSpikeDetector {
    fn name(&self) -> &'static str {
        "volume_spike"
    }

    fn detect(&self, snapshot: &Snapshot) -> Result<Vec<Evidence>, DetectorError> {
        let bin_secs = self.config.bin.num_seconds();
        if bin_secs <= 0 {
            return Err(DetectorError::MalformedWindow(format!(
                "volume bin must be positive, got {bin_secs}s"
            )));
        }

        let mut markets: BTreeMap<&str, BTreeMap<i64, Bin>> = BTreeMap::new();
        for trade in &snapshot.trades {
            let index = trade.timestamp.timestamp().div_euclid(bin_secs);
            let bin = markets
                .entry(trade.asset_id.as_str())
                .or_default()
                .entry(index)
                .or_insert_with(|| Bin {
                    index,
                    volume: Decimal::ZERO,
                    trades: Vec::new(),
                });
            bin.volume += trade.notional();
            bin.trades.push(trade);
        }

        let mut found = Vec::new();
        for (asset_id, bins) in markets {
            if bins.len() < self.config.min_bins {
                continue;
            }
            let bins: Vec<Bin> = bins.into_values().collect();

            for i in 1..bins.len() {
                let baseline_from = i.saturating_sub(self.config.baseline_bins);
                let preceding = &bins[baseline_from..i];
                let baseline: Decimal =
                    preceding.iter().map(|b| b.volume).sum::<Decimal>() / Decimal::from(preceding.len());
                if baseline.is_zero() {
                    continue;
                }

                let bin = &bins[i];
                let ratio = (bin.volume / baseline).to_f64().unwrap_or(0.0);
                if ratio <= self.config.threshold {
                    continue;
                }

                let bin_start = Utc
                    .timestamp_opt(bin.index * bin_secs, 0)
                    .single()
                    .ok_or_else(|| DetectorError::MalformedWindow(format!("bin {} out of range", bin.index)))?;
                let event = self.correlated_event(bin_start);
                let base = if event.is_some() { 0.7 } else { 0.85 };
                let confidence = (base + 0.01 * (ratio - self.config.threshold)).min(0.95);

                let mut evidence = Evidence::new(
                    AlertType::VolumeSpike,
                    bin.trades.iter().map(|t| (*t).clone()).collect(),
                    confidence,
                )
                .with_key(format!("{asset_id}:{}", bin.index))
                .with_detail("spike_ratio", ratio)
                .with_detail("baseline_volume", baseline.round_dp(6).to_string())
                .with_detail("spike_volume", bin.volume.round_dp(6).to_string())
                .with_detail("trade_count", bin.trades.len())
                .with_detail("bin_start", bin_start.to_rfc3339())
                .with_detail("is_correlated_with_event", event.is_some());
                if let Some(event) = event {
                    evidence = evidence.with_detail("event_time", event.to_rfc3339());
                }
                evidence.timestamp = bin_start;
                found.push(evidence);
            }
        }
        Ok(found)
    }
}
