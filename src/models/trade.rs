use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::Side;

/// Identity of a trade: (transaction hash, log position). Globally unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TradeKey {
    pub tx_hash: String,
    pub log_index: u64,
}

impl TradeKey {
    pub fn new(tx_hash: impl Into<String>, log_index: u64) -> Self {
        Self {
            tx_hash: tx_hash.into(),
            log_index,
        }
    }
}

impl fmt::Display for TradeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_hash, self.log_index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WashType {
    SelfTrade,
    Circular,
    Atomic,
}

impl WashType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WashType::SelfTrade => "SELF_TRADE",
            WashType::Circular => "CIRCULAR",
            WashType::Atomic => "ATOMIC",
        }
    }
}

impl fmt::Display for WashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded `OrderFilled` event plus its forensic annotation.
///
/// Everything above `is_wash` is fixed at decode time. The annotation only
/// ever moves forward: `is_wash` goes false to true once and
/// `wash_confidence` never drops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub tx_hash: String,
    pub log_index: u64,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
    /// Exchange contract that emitted the log.
    pub contract: String,
    pub order_hash: String,
    pub maker: String,
    pub taker: String,
    pub asset_id: String,
    /// Side from the maker's perspective.
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub fee: Decimal,

    pub is_wash: bool,
    pub wash_type: Option<WashType>,
    pub wash_confidence: f64,
}

impl Trade {
    pub fn key(&self) -> TradeKey {
        TradeKey::new(self.tx_hash.clone(), self.log_index)
    }

    /// Cash value of the fill (price × size).
    pub fn notional(&self) -> Decimal {
        self.price * self.size
    }

    pub fn is_self_trade(&self) -> bool {
        self.maker == self.taker
    }

    /// Address that paid cash in this fill.
    pub fn cash_payer(&self) -> &str {
        match self.side {
            Side::Buy => &self.maker,
            Side::Sell => &self.taker,
        }
    }

    /// Address that received cash in this fill.
    pub fn cash_receiver(&self) -> &str {
        match self.side {
            Side::Buy => &self.taker,
            Side::Sell => &self.maker,
        }
    }

    /// Ordering used everywhere detection cares about time: block, then log position.
    pub fn chain_order(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }
}
