use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;

use super::{DetectContext, DetectorError, Evidence, IncrementalDetector};
use crate::models::{AlertType, Trade};

#[derive(Debug, Clone)]
pub struct NewWalletConfig {
    /// Stay quiet until the store has seen this many trades, otherwise every
    /// wallet looks new right after startup.
    pub arm_after: u64,
    pub first_trade_notional: Decimal,
    pub young_wallet_notional: Decimal,
    pub young_age: Duration,
    /// Wallets idle for longer than this are forgotten.
    pub retention: Duration,
}

impl Default for NewWalletConfig {
    fn default() -> Self {
        Self {
            arm_after: 100,
            first_trade_notional: Decimal::from(5_000),
            young_wallet_notional: Decimal::from(10_000),
            young_age: Duration::hours(24),
            retention: Duration::days(7),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Seen {
    first: DateTime<Utc>,
    last: DateTime<Utc>,
}

/// Large trades from wallets with no history: a first-ever trade above one
/// threshold, or a wallet younger than a day trading above a higher one.
pub struct NewWalletDetector {
    config: NewWalletConfig,
    seen: HashMap<String, Seen>,
}

impl NewWalletDetector {
    pub fn new(config: NewWalletConfig) -> Self {
        Self {
            config,
            seen: HashMap::new(),
        }
    }

    pub fn tracked_wallets(&self) -> usize {
        self.seen.len()
    }

    fn check(&self, wallet: &str, trade: &Trade) -> Option<Evidence> {
        let notional = trade.notional();
        let (reason, threshold, age) = match self.seen.get(wallet) {
            None => ("first_trade", self.config.first_trade_notional, None),
            Some(seen) if trade.timestamp - seen.first < self.config.young_age => {
                ("young_wallet", self.config.young_wallet_notional, Some(trade.timestamp - seen.first))
            }
            Some(_) => return None,
        };
        if notional <= threshold || threshold.is_zero() {
            return None;
        }

        let multiple = (notional / threshold).to_f64().unwrap_or(1.0);
        let confidence = (0.5 + 0.05 * (multiple - 1.0)).min(0.95);
        let mut evidence = Evidence::new(AlertType::NewWalletInsider, vec![trade.clone()], confidence)
            .with_key(format!("{wallet}@{}", trade.key()))
            .with_addresses(vec![wallet.to_string()])
            .with_detail("reason", reason)
            .with_detail("wallet", wallet)
            .with_detail("notional", notional.round_dp(6).to_string())
            .with_detail("threshold", threshold.to_string());
        if let Some(age) = age {
            evidence = evidence.with_detail("wallet_age_hours", age.num_seconds() as f64 / 3600.0);
        }
        Some(evidence)
    }

    fn remember(&mut self, wallet: &str, at: DateTime<Utc>) {
        self.seen
            .entry(wallet.to_string())
            .and_modify(|s| {
                s.first = s.first.min(at);
                s.last = s.last.max(at);
            })
            .or_insert(Seen { first: at, last: at });
    }
}

impl IncrementalDetector for NewWalletDetector {
    fn name(&self) -> &'static str {
        "new_wallet"
    }

    fn on_trade(&mut self, trade: &Trade, ctx: &DetectContext) -> Result<Vec<Evidence>, DetectorError> {
        let armed = ctx.prior_trades >= self.config.arm_after;
        let mut wallets = vec![trade.maker.as_str(), trade.taker.as_str()];
        wallets.dedup();

        let mut found = Vec::new();
        for wallet in wallets {
            if armed {
                found.extend(self.check(wallet, trade));
            }
            self.remember(wallet, trade.timestamp);
        }
        Ok(found)
    }

    fn trim(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.config.retention;
        self.seen.retain(|_, s| s.last >= cutoff);
    }
}
