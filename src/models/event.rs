use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Alert, Trade, WashType};

/// Conditional-token side channel: the minting or redeeming half of an
/// atomic split-trade-merge cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionKind {
    Split,
    Merge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionEvent {
    pub kind: PositionKind,
    pub tx_hash: String,
    pub log_index: u64,
    pub block_number: u64,
    pub stakeholder: String,
    pub condition_id: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WashMarked {
    pub tx_hash: String,
    pub log_index: u64,
    pub asset_id: String,
    pub wash_type: WashType,
    pub confidence: f64,
}

/// Incrementally maintained store counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub total_trades: u64,
    pub stored_trades: usize,
    pub total_alerts: u64,
    pub stored_alerts: usize,
    pub wash_trade_count: u64,
    pub total_volume: Decimal,
    pub wash_volume: Decimal,
    pub unique_markets: usize,
    pub unique_traders: usize,
    pub last_block: u64,
}

/// Everything the store tells its subscribers about.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum StoreEvent {
    #[serde(rename = "trade")]
    Trade(Trade),

    #[serde(rename = "alert")]
    Alert(Alert),

    #[serde(rename = "wash_marked")]
    WashMarked(WashMarked),

    #[serde(rename = "stats")]
    Stats(StoreStats),
}

impl StoreEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreEvent::Trade(_) => "trade",
            StoreEvent::Alert(_) => "alert",
            StoreEvent::WashMarked(_) => "wash_marked",
            StoreEvent::Stats(_) => "stats",
        }
    }
}
