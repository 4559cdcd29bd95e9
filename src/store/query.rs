use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::models::{Alert, AlertType, Severity, Side, Trade};

pub const DEFAULT_PAGE: usize = 100;
pub const MAX_PAGE: usize = 1000;

/// Trade filter. All criteria are ANDed; results come back newest first.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TradeQuery {
    #[serde(alias = "market")]
    pub asset_id: Option<String>,
    pub address: Option<String>,
    #[serde(default)]
    pub wash_only: bool,
    pub side: Option<Side>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl TradeQuery {
    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE).min(MAX_PAGE)
    }

    pub fn offset(&self) -> usize {
        self.offset.unwrap_or(0)
    }

    pub fn matches(&self, trade: &Trade) -> bool {
        if let Some(asset) = &self.asset_id {
            if &trade.asset_id != asset {
                return false;
            }
        }
        if let Some(address) = &self.address {
            let address = address.to_lowercase();
            if trade.maker != address && trade.taker != address {
                return false;
            }
        }
        if self.wash_only && !trade.is_wash {
            return false;
        }
        if let Some(side) = self.side {
            if trade.side != side {
                return false;
            }
        }
        if let Some(since) = self.since {
            if trade.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if trade.timestamp > until {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertQuery {
    pub alert_type: Option<AlertType>,
    pub severity: Option<Severity>,
    pub asset_id: Option<String>,
    #[serde(default)]
    pub unacknowledged: bool,
    pub limit: Option<usize>,
}

impl AlertQuery {
    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(50).min(MAX_PAGE)
    }

    pub fn matches(&self, alert: &Alert) -> bool {
        if let Some(t) = self.alert_type {
            if alert.alert_type != t {
                return false;
            }
        }
        if let Some(s) = self.severity {
            if alert.severity != s {
                return false;
            }
        }
        if let Some(asset) = &self.asset_id {
            if alert.asset_id.as_deref() != Some(asset.as_str())
                && !alert.trades.iter().any(|t| &t.asset_id == asset)
            {
                return false;
            }
        }
        !(self.unacknowledged && alert.acknowledged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_limits() {
        let q = TradeQuery::default();
        assert_eq!(q.limit(), DEFAULT_PAGE);
        let q = TradeQuery {
            limit: Some(50_000),
            ..Default::default()
        };
        assert_eq!(q.limit(), MAX_PAGE);
    }

    #[test]
    fn test_deserialize_from_query_string_shape() {
        let q: TradeQuery = serde_json::from_value(serde_json::json!({
            "market": "123",
            "side": "SELL",
            "wash_only": true
        }))
        .unwrap();
        assert_eq!(q.asset_id.as_deref(), Some("123"));
        assert_eq!(q.side, Some(Side::Sell));
        assert!(q.wash_only);
    }
}
