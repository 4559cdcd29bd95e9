use chrono::{DateTime, Utc};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::detection::DetectorConfig;
use crate::ingestion::poller::PollerConfig;
use crate::store::StoreConfig;

const DEFAULT_RPC_URL: &str = "https://polygon-rpc.com";
const DEFAULT_GAMMA_URL: &str = "https://gamma-api.polymarket.com";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Persistence is disabled when unset.
    pub database_url: Option<String>,

    // Ledger node
    pub polygon_rpc_url: String,
    pub rpc_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub blocks_per_poll: u64,
    pub logs_chunk_blocks: u64,
    pub start_block: Option<u64>,

    // Store and workers
    pub max_trades_in_memory: usize,
    pub max_alerts_in_memory: usize,
    pub sync_interval_secs: u64,
    pub analysis_interval_secs: u64,
    pub event_queue_capacity: usize,

    // Market metadata
    pub gamma_api_url: String,
    pub market_lookup_timeout_secs: u64,
    pub market_preload_limit: u32,

    /// External event times the volume-spike detector correlates against.
    pub known_event_times: Vec<DateTime<Utc>>,

    // Notifications
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub notifications_enabled: bool,
}

/// Read `key`, falling back to `default` when unset or unparseable.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Parse a comma-separated list of RFC3339 timestamps. Bad entries are
/// skipped with a warning.
pub fn parse_event_times(raw: &str) -> Vec<DateTime<Utc>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match DateTime::parse_from_rfc3339(s) {
            Ok(t) => Some(t.with_timezone(&Utc)),
            Err(e) => {
                tracing::warn!(value = s, error = %e, "Ignoring malformed KNOWN_EVENT_TIMES entry");
                None
            }
        })
        .collect()
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let polygon_rpc_url = env::var("POLYGON_RPC_URL").unwrap_or_else(|_| DEFAULT_RPC_URL.into());
        if polygon_rpc_url.trim().is_empty() {
            anyhow::bail!("POLYGON_RPC_URL must not be empty");
        }

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_or("PORT", 8080),
            database_url: non_empty("DATABASE_URL"),

            polygon_rpc_url: polygon_rpc_url.trim().to_string(),
            rpc_timeout_secs: env_or("RPC_TIMEOUT_SECS", 10),
            poll_interval_secs: env_or("POLL_INTERVAL_SECS", 15),
            blocks_per_poll: env_or("BLOCKS_PER_POLL", 20),
            logs_chunk_blocks: env_or("LOGS_CHUNK_BLOCKS", 50),
            start_block: non_empty("START_BLOCK").and_then(|v| v.parse().ok()),

            max_trades_in_memory: env_or("MAX_TRADES_IN_MEMORY", 50_000),
            max_alerts_in_memory: env_or("MAX_ALERTS_IN_MEMORY", 1_000),
            sync_interval_secs: env_or("SYNC_INTERVAL_SECS", 10),
            analysis_interval_secs: env_or("ANALYSIS_INTERVAL_SECS", 120),
            event_queue_capacity: env_or("EVENT_QUEUE_CAPACITY", 1_024),

            gamma_api_url: env::var("GAMMA_API_URL").unwrap_or_else(|_| DEFAULT_GAMMA_URL.into()),
            market_lookup_timeout_secs: env_or("MARKET_LOOKUP_TIMEOUT_SECS", 5),
            market_preload_limit: env_or("MARKET_PRELOAD_LIMIT", 500),

            known_event_times: parse_event_times(&env::var("KNOWN_EVENT_TIMES").unwrap_or_default()),

            telegram_bot_token: non_empty("TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: non_empty("TELEGRAM_CHAT_ID"),
            notifications_enabled: env_or("NOTIFICATIONS_ENABLED", false),
        })
    }

    /// Telegram credentials, when notifications are enabled and configured.
    pub fn telegram(&self) -> Option<(String, String)> {
        if !self.notifications_enabled {
            return None;
        }
        match (&self.telegram_bot_token, &self.telegram_chat_id) {
            (Some(token), Some(chat)) => Some((token.clone(), chat.clone())),
            _ => None,
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            max_trades: self.max_trades_in_memory,
            max_alerts: self.max_alerts_in_memory,
            ..Default::default()
        }
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            blocks_per_poll: self.blocks_per_poll.max(1),
            chunk_blocks: self.logs_chunk_blocks.max(1),
            start_block: self.start_block,
        }
    }

    pub fn detector_config(&self) -> DetectorConfig {
        let mut config = DetectorConfig::default();
        config.volume_spike.known_events = self.known_event_times.clone();
        config
    }
}
