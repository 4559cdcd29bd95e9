use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

use super::{parse_hex_u64, LedgerNode, LogFilter, RawLog};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("request timed out")]
    Timeout,

    #[error("node returned error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct BlockHeader {
    timestamp: String,
}

/// JSON-RPC 2.0 client for a Polygon node over HTTP.
#[derive(Debug)]
pub struct RpcClient {
    http: Client,
    url: String,
    timeout: Duration,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: Client::new(),
            url: url.into(),
            timeout,
            next_id: AtomicU64::new(1),
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let resp = self
            .http
            .post(&self.url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(classify)?
            .error_for_status()
            .map_err(classify)?;

        let parsed: RpcResponse<T> = resp.json().await.map_err(classify)?;

        if let Some(err) = parsed.error {
            return Err(RpcError::Rpc {
                code: err.code,
                message: err.message,
            });
        }

        parsed
            .result
            .ok_or_else(|| RpcError::Malformed(format!("{method}: missing result")))
    }
}

fn classify(e: reqwest::Error) -> RpcError {
    if e.is_timeout() {
        RpcError::Timeout
    } else {
        RpcError::Http(e)
    }
}

#[async_trait]
impl LedgerNode for RpcClient {
    async fn latest_block_number(&self) -> Result<u64, RpcError> {
        let hex: String = self.call("eth_blockNumber", json!([])).await?;
        parse_hex_u64(&hex)
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, RpcError> {
        let params = json!([{
            "address": filter.addresses,
            "topics": [filter.topics],
            "fromBlock": format!("0x{:x}", filter.from_block),
            "toBlock": format!("0x{:x}", filter.to_block),
        }]);
        self.call("eth_getLogs", params).await
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<DateTime<Utc>, RpcError> {
        // A null result (unknown block) surfaces as a missing-result error.
        let header: BlockHeader = self
            .call(
                "eth_getBlockByNumber",
                json!([format!("0x{block_number:x}"), false]),
            )
            .await?;
        let secs = parse_hex_u64(&header.timestamp)?;

        Utc.timestamp_opt(secs as i64, 0)
            .single()
            .ok_or_else(|| RpcError::Malformed(format!("timestamp out of range: {secs}")))
    }
}
