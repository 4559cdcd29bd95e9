use metrics::counter;
use std::collections::BTreeSet;

use crate::chain::RawLog;
use crate::detection::DetectorSet;
use crate::ingestion::decoder::{decode_log, BlockClock, DecodeError, DecodedLog};
use crate::models::{PositionEvent, Trade};
use crate::store::TradeStore;

/// Logs of one poll, decoded. Logs that failed to decode are already
/// logged and counted.
#[derive(Debug, Clone, Default)]
pub struct DecodedBatch {
    pub trades: Vec<Trade>,
    pub positions: Vec<PositionEvent>,
    pub decode_errors: usize,
}

impl DecodedBatch {
    pub fn decode(logs: &[RawLog], clock: &BlockClock) -> Self {
        let mut batch = Self::default();
        for log in logs {
            match decode_log(log, clock) {
                Ok(DecodedLog::Trade(trade)) => batch.trades.push(trade),
                Ok(DecodedLog::Position(event)) => batch.positions.push(event),
                Err(DecodeError::Removed) => {
                    tracing::debug!(tx = %log.transaction_hash, log_index = log.log_index, "Skipping removed log");
                }
                Err(e) => {
                    batch.decode_errors += 1;
                    counter!("decode_errors_total").increment(1);
                    tracing::warn!(
                        tx = %log.transaction_hash,
                        log_index = log.log_index,
                        block = log.block_number,
                        error = %e,
                        "Failed to decode log, skipping"
                    );
                }
            }
        }
        batch
    }
}

/// What a batch did to the store.
#[derive(Debug, Clone, Default)]
pub struct StoredBatch {
    /// Trades that were new to the store, in chain order.
    pub inserted: Vec<Trade>,
    pub duplicates: usize,
    pub positions: usize,
}

impl StoredBatch {
    /// Markets touched by the newly inserted trades.
    pub fn assets(&self) -> BTreeSet<&str> {
        self.inserted.iter().map(|t| t.asset_id.as_str()).collect()
    }
}

/// Sort a batch into chain order, hand position events to the detector set
/// and insert the trades. Duplicates from overlapping polls are dropped.
pub fn store_batch(store: &TradeStore, detectors: &DetectorSet, mut batch: DecodedBatch) -> StoredBatch {
    batch.trades.sort_by_key(Trade::chain_order);
    detectors.record_positions(&batch.positions);

    let mut stored = StoredBatch {
        positions: batch.positions.len(),
        ..Default::default()
    };
    for trade in batch.trades {
        if store.insert(trade.clone()) {
            stored.inserted.push(trade);
        } else {
            stored.duplicates += 1;
        }
    }
    stored
}
