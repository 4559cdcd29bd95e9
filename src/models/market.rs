use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Best-effort market metadata for one outcome token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketInfo {
    pub asset_id: String,
    pub question: String,
    pub slug: Option<String>,
    pub outcome: Option<String>,
    /// Condition id grouping the outcome tokens of one market.
    pub group_id: Option<String>,
}

impl MarketInfo {
    /// Human-readable name, e.g. `Will X happen? (Yes)`.
    pub fn display_name(&self) -> String {
        match &self.outcome {
            Some(outcome) if !outcome.is_empty() => format!("{} ({outcome})", self.question),
            _ => self.question.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// RiskLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            RiskLevel::Low
        } else if score >= 60.0 {
            RiskLevel::Medium
        } else if score >= 40.0 {
            RiskLevel::High
        } else {
            RiskLevel::Critical
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// MarketHealth
// ---------------------------------------------------------------------------

/// Running per-market aggregates. Only the store writes these, driven by
/// trade inserts, wash marks and alerts.
#[derive(Debug, Clone, Default)]
pub struct MarketHealth {
    pub asset_id: String,
    pub total_trades: u64,
    pub wash_trades: u64,
    pub total_volume: Decimal,
    pub organic_volume: Decimal,
    pub wash_volume: Decimal,
    pub unique_traders: HashSet<String>,
    pub suspicious_addresses: HashSet<String>,
    pub alert_count: u64,
    /// Accumulated alert penalty; the score is `100 - penalty`, clamped.
    pub penalty: f64,
}

impl MarketHealth {
    pub fn new(asset_id: impl Into<String>) -> Self {
        Self {
            asset_id: asset_id.into(),
            ..Default::default()
        }
    }

    pub fn score(&self) -> f64 {
        (100.0 - self.penalty).clamp(0.0, 100.0)
    }

    pub fn wash_ratio(&self) -> f64 {
        if self.total_trades == 0 {
            0.0
        } else {
            self.wash_trades as f64 / self.total_trades as f64
        }
    }

    pub fn view(&self, name: String) -> MarketHealthView {
        let score = self.score();
        MarketHealthView {
            asset_id: self.asset_id.clone(),
            name,
            total_trades: self.total_trades,
            wash_trades: self.wash_trades,
            total_volume: self.total_volume,
            organic_volume: self.organic_volume,
            wash_volume: self.wash_volume,
            wash_ratio: self.wash_ratio(),
            unique_traders: self.unique_traders.len(),
            suspicious_addresses: self.suspicious_addresses.len(),
            alert_count: self.alert_count,
            health_score: score,
            risk_level: RiskLevel::from_score(score),
        }
    }
}

/// Serializable snapshot of a market's health.
#[derive(Debug, Clone, Serialize)]
pub struct MarketHealthView {
    pub asset_id: String,
    pub name: String,
    pub total_trades: u64,
    pub wash_trades: u64,
    pub total_volume: Decimal,
    pub organic_volume: Decimal,
    pub wash_volume: Decimal,
    pub wash_ratio: f64,
    pub unique_traders: usize,
    pub suspicious_addresses: usize,
    pub alert_count: u64,
    pub health_score: f64,
    pub risk_level: RiskLevel,
}
