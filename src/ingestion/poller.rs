//! Poll loop: ask the node for new blocks, fetch their logs in chunks,
//! decode, store, detect, notify.
//!
//! State is published on a `watch` channel so the HTTP surface can report
//! where ingestion is without touching the loop.

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{interval, sleep, MissedTickBehavior};

use crate::chain::{LedgerNode, LogFilter, RawLog, RpcError};
use crate::detection::DetectorSet;
use crate::ingestion::decoder::BlockClock;
use crate::ingestion::pipeline::{store_batch, DecodedBatch};
use crate::store::{MarketDirectory, TradeStore};

const BASE_RECONNECT_DELAY: Duration = Duration::from_secs(2);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Chunks fetched concurrently within one poll.
const MAX_CONCURRENT_CHUNKS: usize = 4;

/// Polls a chunk may fail in a row before its range is abandoned.
pub const MAX_CHUNK_ATTEMPTS: u32 = 3;

/// Abandoned ranges remembered for inspection.
const MAX_ABANDONED_CHUNKS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestState {
    Disconnected,
    Connecting,
    Polling,
    Fetching,
    Decoding,
    Storing,
    Detecting,
    Notifying,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestStatus {
    pub state: IngestState,
    /// Highest block fully processed.
    pub last_block: Option<u64>,
    pub chain_head: Option<u64>,
    pub last_error: Option<String>,
    /// Block ranges given up on after repeated fetch failures.
    pub chunks_abandoned: u64,
    pub updated_at: DateTime<Utc>,
}

impl Default for IngestStatus {
    fn default() -> Self {
        Self {
            state: IngestState::Disconnected,
            last_block: None,
            chain_head: None,
            last_error: None,
            chunks_abandoned: 0,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub poll_interval: Duration,
    pub blocks_per_poll: u64,
    pub chunk_blocks: u64,
    /// First block to ingest. Defaults to `head - blocks_per_poll`.
    pub start_block: Option<u64>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            blocks_per_poll: 20,
            chunk_blocks: 50,
            start_block: None,
        }
    }
}

/// Result of one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollOutcome {
    pub from_block: u64,
    pub to_block: u64,
    pub logs: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub decode_errors: usize,
    pub failed_chunks: usize,
    pub abandoned_chunks: usize,
    pub alerts: usize,
}

/// Delay before reconnect attempt `attempt` (0-based).
pub fn backoff_delay(attempt: u32) -> Duration {
    let delay = BASE_RECONNECT_DELAY * 2u32.saturating_pow(attempt.min(16));
    delay.min(MAX_RECONNECT_DELAY)
}

/// Split `[from, to]` into inclusive ranges of at most `size` blocks.
pub fn chunk_ranges(from: u64, to: u64, size: u64) -> Vec<(u64, u64)> {
    let size = size.max(1);
    let mut ranges = Vec::new();
    let mut start = from;
    while start <= to {
        let end = to.min(start.saturating_add(size - 1));
        ranges.push((start, end));
        if end == u64::MAX {
            break;
        }
        start = end + 1;
    }
    ranges
}

pub struct Poller {
    node: Arc<dyn LedgerNode>,
    store: Arc<TradeStore>,
    detectors: Arc<DetectorSet>,
    markets: Option<Arc<MarketDirectory>>,
    config: PollerConfig,
    status: watch::Sender<IngestStatus>,
    next_block: Option<u64>,
    /// Consecutive failures per chunk start block.
    attempts: HashMap<u64, u32>,
    abandoned: VecDeque<(u64, u64)>,
}

impl Poller {
    pub fn new(
        node: Arc<dyn LedgerNode>,
        store: Arc<TradeStore>,
        detectors: Arc<DetectorSet>,
        config: PollerConfig,
    ) -> (Self, watch::Receiver<IngestStatus>) {
        let (status, rx) = watch::channel(IngestStatus::default());
        let next_block = config.start_block;
        let poller = Self {
            node,
            store,
            detectors,
            markets: None,
            config,
            status,
            next_block,
            attempts: HashMap::new(),
            abandoned: VecDeque::new(),
        };
        (poller, rx)
    }

    /// Warm market metadata for every newly seen asset.
    pub fn with_markets(mut self, markets: Arc<MarketDirectory>) -> Self {
        self.markets = Some(markets);
        self
    }

    pub fn next_block(&self) -> Option<u64> {
        self.next_block
    }

    /// Most recent ranges skipped after `MAX_CHUNK_ATTEMPTS` failures, oldest first.
    pub fn abandoned_chunks(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.abandoned.iter().copied()
    }

    fn set_state(&self, state: IngestState) {
        self.status.send_modify(|s| {
            s.state = state;
            s.updated_at = Utc::now();
        });
    }

    /// Connect, then poll forever. Node failures never end the loop.
    pub async fn run(mut self) {
        self.connect().await;

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.poll_once().await {
                Ok(outcome) if outcome.inserted > 0 || outcome.failed_chunks > 0 => {
                    tracing::info!(
                        from = outcome.from_block,
                        to = outcome.to_block,
                        logs = outcome.logs,
                        inserted = outcome.inserted,
                        duplicates = outcome.duplicates,
                        alerts = outcome.alerts,
                        failed_chunks = outcome.failed_chunks,
                        abandoned_chunks = outcome.abandoned_chunks,
                        "Poll complete"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    counter!("rpc_errors_total").increment(1);
                    tracing::warn!(error = %e, "Poll failed, reconnecting");
                    self.status.send_modify(|s| {
                        s.state = IngestState::Disconnected;
                        s.last_error = Some(e.to_string());
                        s.updated_at = Utc::now();
                    });
                    self.connect().await;
                }
            }
        }
    }

    /// Retry `eth_blockNumber` with exponential backoff until the node answers.
    async fn connect(&mut self) -> u64 {
        let mut attempt: u32 = 0;
        loop {
            self.set_state(IngestState::Connecting);
            match self.node.latest_block_number().await {
                Ok(head) => {
                    if self.next_block.is_none() {
                        self.next_block = Some(head.saturating_sub(self.config.blocks_per_poll));
                    }
                    self.status.send_modify(|s| {
                        s.state = IngestState::Polling;
                        s.chain_head = Some(head);
                        s.last_error = None;
                        s.updated_at = Utc::now();
                    });
                    gauge!("chain_head_block").set(head as f64);
                    tracing::info!(head, next_block = ?self.next_block, "Connected to ledger node");
                    return head;
                }
                Err(e) => {
                    counter!("rpc_errors_total").increment(1);
                    let delay = backoff_delay(attempt);
                    attempt = attempt.saturating_add(1);
                    tracing::warn!(
                        error = %e,
                        attempt,
                        delay_secs = delay.as_secs(),
                        "Ledger node unreachable, retrying"
                    );
                    self.status.send_modify(|s| {
                        s.state = IngestState::Disconnected;
                        s.last_error = Some(e.to_string());
                        s.updated_at = Utc::now();
                    });
                    sleep(delay).await;
                }
            }
        }
    }

    /// One poll: fetch, decode, store, detect and notify for the next range
    /// of blocks. Only the head lookup can fail the whole poll. A failed
    /// chunk is retried from its start on the next poll, up to
    /// `MAX_CHUNK_ATTEMPTS` times, then skipped.
    pub async fn poll_once(&mut self) -> Result<PollOutcome, RpcError> {
        self.set_state(IngestState::Polling);
        let head = self.node.latest_block_number().await?;
        gauge!("chain_head_block").set(head as f64);
        self.status.send_modify(|s| s.chain_head = Some(head));

        let from = *self
            .next_block
            .get_or_insert_with(|| head.saturating_sub(self.config.blocks_per_poll));
        if from > head {
            return Ok(PollOutcome {
                from_block: from,
                to_block: head,
                ..Default::default()
            });
        }
        let to = head.min(from + self.config.blocks_per_poll.max(1) - 1);
        let started = Instant::now();

        self.set_state(IngestState::Fetching);
        let (logs, failed) = self.fetch_range(from, to).await;
        let failed_chunks = failed.len();

        self.set_state(IngestState::Decoding);
        let clock = self.block_clock(from, to, head).await;
        let batch = DecodedBatch::decode(&logs, &clock);
        let decode_errors = batch.decode_errors;

        self.set_state(IngestState::Storing);
        let stored = store_batch(&self.store, &self.detectors, batch);

        self.set_state(IngestState::Detecting);
        let report = self.detectors.on_trades(&self.store, &stored.inserted);

        self.set_state(IngestState::Notifying);
        self.store.publish_stats();
        if let Some(markets) = &self.markets {
            for asset in stored.assets() {
                if markets.get(asset).is_none() {
                    markets.request_refresh(asset);
                }
            }
        }

        let (retry, abandoned_chunks) = self.settle_failures(&failed);
        let resume = retry.unwrap_or(to + 1);
        self.next_block = Some(resume);
        let last_done = resume.checked_sub(1).filter(|b| *b >= from);
        self.status.send_modify(|s| {
            s.state = IngestState::Polling;
            if last_done.is_some() {
                s.last_block = last_done;
            }
            s.chunks_abandoned += abandoned_chunks as u64;
            s.updated_at = Utc::now();
        });
        histogram!("ingest_cycle_seconds").record(started.elapsed().as_secs_f64());

        Ok(PollOutcome {
            from_block: from,
            to_block: to,
            logs: logs.len(),
            inserted: stored.inserted.len(),
            duplicates: stored.duplicates,
            decode_errors,
            failed_chunks,
            abandoned_chunks,
            alerts: report.alerts_appended,
        })
    }

    /// Count a failure against each failed chunk. Returns the earliest
    /// chunk still worth retrying and how many were abandoned this poll.
    fn settle_failures(&mut self, failed: &[(u64, u64)]) -> (Option<u64>, usize) {
        let mut retry: Option<u64> = None;
        let mut abandoned = 0;

        for &(start, end) in failed {
            let attempts = self.attempts.entry(start).or_insert(0);
            *attempts += 1;
            if *attempts < MAX_CHUNK_ATTEMPTS {
                retry = Some(retry.map_or(start, |r| r.min(start)));
                continue;
            }

            self.attempts.remove(&start);
            abandoned += 1;
            counter!("chunks_abandoned_total").increment(1);
            tracing::warn!(
                from = start,
                to = end,
                attempts = MAX_CHUNK_ATTEMPTS,
                "Abandoning block range after repeated fetch failures"
            );
            if self.abandoned.len() == MAX_ABANDONED_CHUNKS {
                self.abandoned.pop_front();
            }
            self.abandoned.push_back((start, end));
        }

        // Chunks that did not fail this time start counting afresh.
        let failing: Vec<u64> = failed.iter().map(|(start, _)| *start).collect();
        self.attempts.retain(|start, _| failing.contains(start));

        (retry, abandoned)
    }

    /// Fetch fills and position changes for every chunk of the range.
    /// Returns the logs of the chunks that succeeded and the range of each
    /// chunk that failed.
    async fn fetch_range(&self, from: u64, to: u64) -> (Vec<RawLog>, Vec<(u64, u64)>) {
        let node = &self.node;
        let results: Vec<(u64, u64, Result<Vec<RawLog>, RpcError>)> =
            stream::iter(chunk_ranges(from, to, self.config.chunk_blocks))
                .map(|(start, end)| async move {
                    let fills = node.get_logs(&LogFilter::order_fills(start, end)).await;
                    let positions = node.get_logs(&LogFilter::position_changes(start, end)).await;
                    let result = match (fills, positions) {
                        (Ok(mut fills), Ok(positions)) => {
                            fills.extend(positions);
                            Ok(fills)
                        }
                        (Err(e), _) | (_, Err(e)) => Err(e),
                    };
                    (start, end, result)
                })
                .buffer_unordered(MAX_CONCURRENT_CHUNKS)
                .collect()
                .await;

        let mut logs = Vec::new();
        let mut failed = Vec::new();
        for (start, end, result) in results {
            match result {
                Ok(chunk) => logs.extend(chunk),
                Err(e) => {
                    counter!("rpc_errors_total").increment(1);
                    tracing::warn!(from = start, to = end, error = %e, "Log fetch failed for chunk, skipping");
                    failed.push((start, end));
                }
            }
        }
        (logs, failed)
    }

    /// Timestamps for the range endpoints, falling back to an estimate from
    /// the head block when the node will not say.
    async fn block_clock(&self, from: u64, to: u64, head: u64) -> BlockClock {
        let lo = self.node.block_timestamp(from).await;
        let hi = if to == from {
            None
        } else {
            Some(self.node.block_timestamp(to).await)
        };

        match (lo, hi) {
            (Ok(a), Some(Ok(b))) => BlockClock::between((from, a), (to, b)),
            (Ok(a), _) => BlockClock::anchored(from, a),
            (Err(_), Some(Ok(b))) => BlockClock::anchored(to, b),
            (Err(e), _) => {
                counter!("rpc_errors_total").increment(1);
                tracing::debug!(error = %e, "Block timestamp unavailable, estimating");
                BlockClock::estimated(head, Utc::now())
            }
        }
    }
}
