use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::models::MarketInfo;
use crate::store::market_cache::MarketLookup;

const GAMMA_API_BASE: &str = "https://gamma-api.polymarket.com";

/// Gamma caps page size at 500.
const PAGE_SIZE: u32 = 500;

#[derive(Debug, Error)]
pub enum GammaClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    Unexpected(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GammaEvent {
    #[serde(default)]
    pub slug: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GammaMarket {
    #[serde(alias = "conditionId")]
    pub condition_id: String,
    pub question: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub events: Vec<GammaEvent>,
    /// JSON array of outcome labels, e.g. ["Yes","No"]
    #[serde(default)]
    pub outcomes: Option<String>,
    /// Stringified JSON array of token IDs, e.g. "[\"token1\", \"token2\"]"
    #[serde(default, alias = "clobTokenIds")]
    pub clob_token_ids: Option<String>,
}

impl GammaMarket {
    /// Parse the stringified clobTokenIds into a Vec of token ID strings.
    pub fn parse_token_ids(&self) -> Vec<String> {
        parse_string_array(self.clob_token_ids.as_deref())
    }

    pub fn parse_outcomes(&self) -> Vec<String> {
        parse_string_array(self.outcomes.as_deref())
    }

    /// Get the event-level slug (for polymarket.com/event/{slug} URLs).
    /// Falls back to the market-level slug if no event slug is available.
    pub fn event_slug(&self) -> Option<&str> {
        self.events
            .first()
            .and_then(|e| e.slug.as_deref())
            .or(self.slug.as_deref())
    }

    /// One `MarketInfo` per outcome token, outcome labels matched by position.
    pub fn to_market_infos(&self) -> Vec<MarketInfo> {
        let outcomes = self.parse_outcomes();
        self.parse_token_ids()
            .into_iter()
            .enumerate()
            .map(|(i, asset_id)| MarketInfo {
                asset_id,
                question: self.question.clone(),
                slug: self.event_slug().map(str::to_string),
                outcome: outcomes.get(i).cloned(),
                group_id: Some(self.condition_id.clone()),
            })
            .collect()
    }
}

fn parse_string_array(raw: Option<&str>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str::<Vec<String>>(s).ok())
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct GammaClient {
    http: Client,
    base_url: String,
    timeout: Duration,
}

impl GammaClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            timeout,
        }
    }

    /// Fetch active markets from the Gamma API with pagination.
    pub async fn get_active_markets(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<GammaMarket>, GammaClientError> {
        let url = format!("{}/markets", self.base_url);
        let resp = self
            .http
            .get(&url)
            .timeout(self.timeout)
            .query(&[
                ("active", "true"),
                ("closed", "false"),
                ("limit", &limit.to_string()),
                ("offset", &offset.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?;

        let markets: Vec<GammaMarket> = resp.json().await?;
        Ok(markets)
    }

    /// Find the market that lists `token_id` among its outcome tokens.
    pub async fn get_market_by_token(
        &self,
        token_id: &str,
    ) -> Result<Option<GammaMarket>, GammaClientError> {
        let url = format!("{}/markets", self.base_url);
        let resp = self
            .http
            .get(&url)
            .timeout(self.timeout)
            .query(&[("clob_token_ids", token_id)])
            .send()
            .await?
            .error_for_status()?;

        let markets: Vec<GammaMarket> = resp.json().await?;
        Ok(markets
            .into_iter()
            .find(|m| m.parse_token_ids().iter().any(|t| t == token_id)))
    }
}

impl Default for GammaClient {
    fn default() -> Self {
        Self::new(GAMMA_API_BASE, Duration::from_secs(5))
    }
}

#[async_trait]
impl MarketLookup for GammaClient {
    async fn lookup_market(&self, asset_id: &str) -> anyhow::Result<Option<MarketInfo>> {
        let market = self.get_market_by_token(asset_id).await?;
        Ok(market.and_then(|m| {
            m.to_market_infos()
                .into_iter()
                .find(|info| info.asset_id == asset_id)
        }))
    }

    async fn active_markets(&self, limit: u32) -> anyhow::Result<Vec<MarketInfo>> {
        let mut infos = Vec::new();
        let mut offset = 0;
        while offset < limit {
            let page = self.get_active_markets(PAGE_SIZE.min(limit - offset), offset).await?;
            if page.is_empty() {
                break;
            }
            offset += page.len() as u32;
            infos.extend(page.iter().flat_map(GammaMarket::to_market_infos));
        }
        Ok(infos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_market() -> GammaMarket {
        serde_json::from_value(serde_json::json!({
            "conditionId": "0xcond",
            "question": "Will BTC close above 100k?",
            "slug": "btc-100k",
            "events": [{ "slug": "btc-price" }],
            "outcomes": "[\"Yes\",\"No\"]",
            "clobTokenIds": "[\"111\",\"222\"]"
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_token_ids() {
        assert_eq!(sample_market().parse_token_ids(), vec!["111", "222"]);
    }

    #[test]
    fn test_event_slug_preferred() {
        assert_eq!(sample_market().event_slug(), Some("btc-price"));
    }

    #[test]
    fn test_market_infos_pair_outcomes_with_tokens() {
        let infos = sample_market().to_market_infos();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[1].asset_id, "222");
        assert_eq!(infos[1].outcome.as_deref(), Some("No"));
        assert_eq!(infos[1].group_id.as_deref(), Some("0xcond"));
    }

    #[test]
    fn test_missing_token_ids_yield_nothing() {
        let mut market = sample_market();
        market.clob_token_ids = None;
        assert!(market.to_market_infos().is_empty());
    }
}
