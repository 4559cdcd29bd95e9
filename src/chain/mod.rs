pub mod rpc_client;

pub use rpc_client::{RpcClient, RpcError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// CTF Exchange contract on Polygon.
pub const CTF_EXCHANGE: &str = "0x4bfb41d5b3570defd03c39a9a4d8de6bd8b8982e";

/// NegRisk CTF Exchange contract on Polygon.
pub const NEG_RISK_CTF_EXCHANGE: &str = "0xc5d563a36ae78145c45a50134d48a1215220f80a";

/// Gnosis Conditional Tokens contract (emits split/merge).
pub const CONDITIONAL_TOKENS: &str = "0x4d97dcd97ec945f40cf65f87097ace5ea0476045";

/// Keccak256 of OrderFilled(bytes32,address,address,uint256,uint256,uint256,uint256,uint256)
pub const ORDER_FILLED_TOPIC: &str =
    "0xd0a08e8c493f9c94f29311604c9de1b4e8c8d4c06bd0c789af57f2d65bfec0f6";

/// Keccak256 of PositionSplit(address,address,bytes32,bytes32,uint256[],uint256)
pub const POSITION_SPLIT_TOPIC: &str =
    "0x2e6bb91f8cbcda0c93623c54d0403a43514fabc40084ec96b6d5379a74786298";

/// Keccak256 of PositionsMerge(address,address,bytes32,bytes32,uint256[],uint256)
pub const POSITIONS_MERGE_TOPIC: &str =
    "0x6f13ca62553fcc2bcd2372180a43949c1e4cebba603901ede2f4e14f36b282ca";

/// One `eth_getLogs` entry as returned by the node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(deserialize_with = "de_hex_u64")]
    pub block_number: u64,
    pub transaction_hash: String,
    #[serde(deserialize_with = "de_hex_u64")]
    pub log_index: u64,
    #[serde(default)]
    pub removed: bool,
}

/// Address + topic0 filter over an inclusive block range.
#[derive(Debug, Clone, PartialEq)]
pub struct LogFilter {
    pub addresses: Vec<String>,
    pub topics: Vec<String>,
    pub from_block: u64,
    pub to_block: u64,
}

impl LogFilter {
    /// Exchange `OrderFilled` logs in a range.
    pub fn order_fills(from_block: u64, to_block: u64) -> Self {
        Self {
            addresses: vec![CTF_EXCHANGE.into(), NEG_RISK_CTF_EXCHANGE.into()],
            topics: vec![ORDER_FILLED_TOPIC.into()],
            from_block,
            to_block,
        }
    }

    /// Conditional-token split/merge logs in a range.
    pub fn position_changes(from_block: u64, to_block: u64) -> Self {
        Self {
            addresses: vec![CONDITIONAL_TOKENS.into()],
            topics: vec![POSITION_SPLIT_TOPIC.into(), POSITIONS_MERGE_TOPIC.into()],
            from_block,
            to_block,
        }
    }
}

/// Read-only view of the ledger. Every call must be safe to repeat with
/// overlapping ranges.
#[async_trait]
pub trait LedgerNode: Send + Sync {
    async fn latest_block_number(&self) -> Result<u64, RpcError>;

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, RpcError>;

    async fn block_timestamp(&self, block_number: u64) -> Result<DateTime<Utc>, RpcError>;
}

/// Parse a `0x`-prefixed hex quantity.
pub fn parse_hex_u64(s: &str) -> Result<u64, RpcError> {
    let hex = s.strip_prefix("0x").unwrap_or(s);
    if hex.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(hex, 16).map_err(|_| RpcError::Malformed(format!("bad hex quantity: {s}")))
}

fn de_hex_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Quantity {
        Hex(String),
        Num(u64),
    }

    match Quantity::deserialize(deserializer)? {
        Quantity::Num(n) => Ok(n),
        Quantity::Hex(s) => parse_hex_u64(&s).map_err(serde::de::Error::custom),
    }
}
