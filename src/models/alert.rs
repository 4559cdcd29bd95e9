use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use super::{Trade, WashType};

// ---------------------------------------------------------------------------
// AlertType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    SelfTrade,
    CoordinatedSelfTrade,
    #[serde(rename = "CIRCULAR_TRADE")]
    Circular,
    AtomicWash,
    VolumeSpike,
    SybilCluster,
    NewWalletInsider,
    HighWinRate,
    GasAnomaly,
}

impl AlertType {
    pub const ALL: [AlertType; 9] = [
        AlertType::SelfTrade,
        AlertType::CoordinatedSelfTrade,
        AlertType::Circular,
        AlertType::AtomicWash,
        AlertType::VolumeSpike,
        AlertType::SybilCluster,
        AlertType::NewWalletInsider,
        AlertType::HighWinRate,
        AlertType::GasAnomaly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::SelfTrade => "SELF_TRADE",
            AlertType::CoordinatedSelfTrade => "COORDINATED_SELF_TRADE",
            AlertType::Circular => "CIRCULAR_TRADE",
            AlertType::AtomicWash => "ATOMIC_WASH",
            AlertType::VolumeSpike => "VOLUME_SPIKE",
            AlertType::SybilCluster => "SYBIL_CLUSTER",
            AlertType::NewWalletInsider => "NEW_WALLET_INSIDER",
            AlertType::HighWinRate => "HIGH_WIN_RATE",
            AlertType::GasAnomaly => "GAS_ANOMALY",
        }
    }

    pub fn from_api_str(s: &str) -> Option<Self> {
        let upper = s.to_uppercase();
        Self::ALL.into_iter().find(|t| t.as_str() == upper)
    }

    /// Short prefix used in alert ids.
    fn id_prefix(&self) -> &'static str {
        match self {
            AlertType::SelfTrade => "SELF",
            AlertType::CoordinatedSelfTrade => "COORD",
            AlertType::Circular => "CIRC",
            AlertType::AtomicWash => "ATOM",
            AlertType::VolumeSpike => "SPIKE",
            AlertType::SybilCluster => "SYBIL",
            AlertType::NewWalletInsider => "NEWW",
            AlertType::HighWinRate => "WINR",
            AlertType::GasAnomaly => "GAS",
        }
    }

    /// Wash tag written onto matched trades, for the kinds that mark trades at all.
    pub fn wash_type(&self) -> Option<WashType> {
        match self {
            AlertType::SelfTrade => Some(WashType::SelfTrade),
            AlertType::Circular => Some(WashType::Circular),
            AlertType::AtomicWash => Some(WashType::Atomic),
            _ => None,
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.95 {
            Severity::Critical
        } else if confidence >= 0.8 {
            Severity::High
        } else if confidence >= 0.6 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }

    pub fn from_api_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "LOW" => Some(Severity::Low),
            "MEDIUM" => Some(Severity::Medium),
            "HIGH" => Some(Severity::High),
            "CRITICAL" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Alert
// ---------------------------------------------------------------------------

/// Append-only detector finding. Only `acknowledged` changes after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: String,
    pub timestamp: DateTime<Utc>,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub tx_hash: Option<String>,
    pub asset_id: Option<String>,
    pub trade_count: usize,
    pub volume: Decimal,
    pub confidence: f64,
    pub addresses: Vec<String>,
    pub details: serde_json::Map<String, serde_json::Value>,
    /// Copies of the matched trades as they looked when the alert fired.
    pub trades: Vec<Trade>,
    pub acknowledged: bool,
}

impl Alert {
    /// Notional of this alert's trade copies that fall in `asset_id`.
    /// Falls back to the alert volume for single-market alerts without copies.
    pub fn volume_in_market(&self, asset_id: &str) -> Decimal {
        if self.trades.is_empty() {
            return if self.asset_id.as_deref() == Some(asset_id) {
                self.volume
            } else {
                Decimal::ZERO
            };
        }
        self.trades
            .iter()
            .filter(|t| t.asset_id == asset_id)
            .map(Trade::notional)
            .sum()
    }

    /// Every market this alert touches.
    pub fn markets(&self) -> Vec<String> {
        let mut markets: Vec<String> = self.trades.iter().map(|t| t.asset_id.clone()).collect();
        if let Some(asset) = &self.asset_id {
            markets.push(asset.clone());
        }
        markets.sort();
        markets.dedup();
        markets
    }
}

/// Deterministic alert id: `<PREFIX>_<16 hex of sha256(dedup_key)>`.
pub fn alert_id(alert_type: AlertType, dedup_key: &str) -> String {
    let digest = Sha256::digest(dedup_key.as_bytes());
    let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("{}_{hex}", alert_type.id_prefix())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_thresholds() {
        assert_eq!(Severity::from_confidence(1.0), Severity::Critical);
        assert_eq!(Severity::from_confidence(0.85), Severity::High);
        assert_eq!(Severity::from_confidence(0.6), Severity::Medium);
        assert_eq!(Severity::from_confidence(0.59), Severity::Low);
    }

    #[test]
    fn test_alert_id_is_deterministic() {
        let a = alert_id(AlertType::Circular, "0xa:1|0xb:2");
        let b = alert_id(AlertType::Circular, "0xa:1|0xb:2");
        let c = alert_id(AlertType::Circular, "0xa:1|0xb:3");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("CIRC_"));
        assert_eq!(a.len(), "CIRC_".len() + 16);
    }

    #[test]
    fn test_alert_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&AlertType::Circular).unwrap(),
            "\"CIRCULAR_TRADE\""
        );
        assert_eq!(
            serde_json::to_string(&AlertType::NewWalletInsider).unwrap(),
            "\"NEW_WALLET_INSIDER\""
        );
        assert_eq!(AlertType::from_api_str("sybil_cluster"), Some(AlertType::SybilCluster));
    }

    #[test]
    fn test_only_trade_level_kinds_mark_trades() {
        assert_eq!(AlertType::SelfTrade.wash_type(), Some(WashType::SelfTrade));
        assert_eq!(AlertType::SybilCluster.wash_type(), None);
        assert_eq!(AlertType::VolumeSpike.wash_type(), None);
    }
}
