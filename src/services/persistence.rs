use async_trait::async_trait;
use metrics::counter;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::models::{Alert, Trade};
use crate::store::TradeStore;

/// Records taken from the store per sync pass.
const SYNC_BATCH: usize = 500;

/// Append-only durable home for trades and alerts. Both calls are
/// idempotent: a record that is already there returns `Ok(false)`.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn append_trade_if_absent(&self, trade: &Trade) -> anyhow::Result<bool>;
    async fn append_alert_if_absent(&self, alert: &Alert) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub trades_written: usize,
    pub alerts_written: usize,
    pub duplicates: usize,
    /// Records put back after a sink error.
    pub requeued: usize,
}

/// Push one batch of pending records to the sink. On the first error the
/// unwritten remainder goes back to the head of the store's queue.
pub async fn sync_once(store: &TradeStore, sink: &dyn PersistenceSink) -> SyncOutcome {
    let (trades, alerts) = store.drain_pending(SYNC_BATCH);
    let mut outcome = SyncOutcome::default();

    let mut trades = trades.into_iter();
    while let Some(trade) = trades.next() {
        match sink.append_trade_if_absent(&trade).await {
            Ok(true) => outcome.trades_written += 1,
            Ok(false) => outcome.duplicates += 1,
            Err(e) => {
                tracing::error!(error = %e, tx = %trade.tx_hash, "Failed to persist trade");
                let rest: Vec<Trade> = std::iter::once(trade).chain(trades).collect();
                outcome.requeued = rest.len() + alerts.len();
                store.requeue(rest, alerts);
                counter!("persistence_errors_total").increment(1);
                return outcome;
            }
        }
    }

    let mut alerts = alerts.into_iter();
    while let Some(alert) = alerts.next() {
        match sink.append_alert_if_absent(&alert).await {
            Ok(true) => outcome.alerts_written += 1,
            Ok(false) => outcome.duplicates += 1,
            Err(e) => {
                tracing::error!(error = %e, alert_id = %alert.alert_id, "Failed to persist alert");
                let rest: Vec<Alert> = std::iter::once(alert).chain(alerts).collect();
                outcome.requeued = rest.len();
                store.requeue(Vec::new(), rest);
                counter!("persistence_errors_total").increment(1);
                return outcome;
            }
        }
    }

    outcome
}

/// Run the sync worker. Drains the store every `interval_secs` until the
/// queues are empty or the sink fails.
pub async fn run_sync_worker(store: Arc<TradeStore>, sink: Arc<dyn PersistenceSink>, interval_secs: u64) {
    let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!(interval_secs, "Persistence sync worker started");

    loop {
        ticker.tick().await;

        loop {
            let outcome = sync_once(&store, sink.as_ref()).await;
            if outcome.trades_written + outcome.alerts_written > 0 {
                tracing::debug!(
                    trades = outcome.trades_written,
                    alerts = outcome.alerts_written,
                    duplicates = outcome.duplicates,
                    "Synced to database"
                );
            }
            let (trades, alerts) = store.pending_len();
            if outcome.requeued > 0 || trades + alerts == 0 {
                break;
            }
        }
    }
}
