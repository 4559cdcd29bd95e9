mod common;

use std::sync::Arc;

use washwatch::chain::RawLog;
use washwatch::ingestion::poller::{IngestState, Poller, PollerConfig, MAX_CHUNK_ATTEMPTS};
use washwatch::models::{AlertType, WashType};
use washwatch::services::persistence::sync_once;
use washwatch::store::{AlertQuery, TradeQuery};

use common::{at, detectors, fill_log, store, tx_hash, wallet, MemorySink, MockNode};

/// One fill per block in 100..=119, each in its own market. Block 105 is a
/// self-trade.
fn ledger() -> Vec<RawLog> {
    (100..120u64)
        .map(|block| {
            let maker = wallet(block * 2);
            let taker = if block == 105 { maker.clone() } else { wallet(block * 2 + 1) };
            fill_log(block, 0, &maker, &taker, 1_000 + block as u128, 50, 100)
        })
        .collect()
}

fn config(start: u64) -> PollerConfig {
    PollerConfig {
        start_block: Some(start),
        blocks_per_poll: 20,
        chunk_blocks: 5,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_poll_ingests_range_and_flags_self_trade() {
    let node = MockNode::new(119, ledger());
    let store = store();
    let (mut poller, status) = Poller::new(node, store.clone(), detectors(), config(100));

    let outcome = poller.poll_once().await.unwrap();

    assert_eq!((outcome.from_block, outcome.to_block), (100, 119));
    assert_eq!(outcome.inserted, 20);
    assert_eq!(outcome.failed_chunks, 0);
    assert_eq!(outcome.decode_errors, 0);
    assert_eq!(outcome.alerts, 1);
    assert_eq!(poller.next_block(), Some(120));

    let status = status.borrow().clone();
    assert_eq!(status.state, IngestState::Polling);
    assert_eq!(status.last_block, Some(119));
    assert_eq!(status.chain_head, Some(119));

    let alerts = store.alerts(&AlertQuery::default());
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, AlertType::SelfTrade);

    let flagged = store.trades_by_tx(&tx_hash(105));
    assert_eq!(flagged.len(), 1);
    assert!(flagged[0].is_wash);
    assert_eq!(flagged[0].wash_type, Some(WashType::SelfTrade));
    assert_eq!(flagged[0].timestamp, at(210));
}

#[tokio::test]
async fn test_failed_chunk_is_refetched_next_poll() {
    let node = MockNode::new(119, ledger());
    node.fail_chunk_once(110);
    let store = store();
    let (mut poller, status) = Poller::new(node.clone(), store.clone(), detectors(), config(100));

    let first = poller.poll_once().await.unwrap();
    assert_eq!(first.failed_chunks, 1);
    assert_eq!(first.inserted, 15);
    assert_eq!(poller.next_block(), Some(110));
    assert_eq!(status.borrow().last_block, Some(109));

    let second = poller.poll_once().await.unwrap();
    assert_eq!((second.from_block, second.to_block), (110, 119));
    assert_eq!(second.failed_chunks, 0);
    assert_eq!(second.inserted, 5);
    assert_eq!(second.duplicates, 5);
    assert_eq!(store.stats().total_trades, 20);
    assert_eq!(poller.next_block(), Some(120));
}

#[tokio::test]
async fn test_persistently_failing_chunk_is_abandoned() {
    let node = MockNode::new(299, ledger());
    node.break_block(105);
    let store = store();
    let (mut poller, status) = Poller::new(node, store.clone(), detectors(), config(100));

    for attempt in 1..MAX_CHUNK_ATTEMPTS {
        let outcome = poller.poll_once().await.unwrap();
        assert_eq!(outcome.failed_chunks, 1);
        assert_eq!(outcome.abandoned_chunks, 0, "attempt {attempt}");
        assert_eq!(poller.next_block(), Some(105));
    }

    let last = poller.poll_once().await.unwrap();
    assert_eq!((last.from_block, last.to_block), (105, 124));
    assert_eq!(last.abandoned_chunks, 1);
    assert_eq!(poller.next_block(), Some(125));
    assert_eq!(poller.abandoned_chunks().collect::<Vec<_>>(), vec![(105, 109)]);

    let status = status.borrow().clone();
    assert_eq!(status.chunks_abandoned, 1);
    assert_eq!(status.last_block, Some(124));

    let next = poller.poll_once().await.unwrap();
    assert_eq!((next.from_block, next.to_block), (125, 144));
    assert_eq!(next.failed_chunks, 0);
    assert_eq!(poller.next_block(), Some(145));

    // Everything outside the broken chunk was ingested.
    assert_eq!(store.stats().total_trades, 15);
    assert!(store.trades_by_tx(&tx_hash(105)).is_empty());
}

#[tokio::test]
async fn test_non_hex_payload_is_counted_and_skipped() {
    let mut logs = ledger();
    let mut garbled = fill_log(107, 1, &wallet(1), &wallet(2), 7, 50, 100);
    garbled.data = format!("0x{}", "€".repeat(200));
    logs.push(garbled);

    let node = MockNode::new(119, logs);
    let store = store();
    let (mut poller, _) = Poller::new(node, store.clone(), detectors(), config(100));

    let outcome = poller.poll_once().await.unwrap();
    assert_eq!(outcome.logs, 21);
    assert_eq!(outcome.decode_errors, 1);
    assert_eq!(outcome.inserted, 20);
    assert_eq!(poller.next_block(), Some(120));
}

#[tokio::test]
async fn test_overlapping_polls_are_idempotent() {
    let node = MockNode::new(119, ledger());
    let store = store();
    let detectors = detectors();

    let (mut first, _) = Poller::new(node.clone(), store.clone(), detectors.clone(), config(100));
    first.poll_once().await.unwrap();
    let (mut again, _) = Poller::new(node, store.clone(), detectors, config(100));
    let outcome = again.poll_once().await.unwrap();

    assert_eq!(outcome.inserted, 0);
    assert_eq!(outcome.duplicates, 20);
    assert_eq!(outcome.alerts, 0);
    assert_eq!(store.stats().total_trades, 20);
    assert_eq!(store.stats().total_alerts, 1);
}

#[tokio::test]
async fn test_poll_waits_when_caught_up() {
    let node = MockNode::new(119, ledger());
    let (mut poller, _) = Poller::new(node.clone(), store(), detectors(), config(120));

    let outcome = poller.poll_once().await.unwrap();
    assert_eq!(outcome.inserted, 0);
    assert_eq!(poller.next_block(), Some(120));
    assert_eq!(node.get_logs_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_ingested_records_reach_the_sink_once() {
    let node = MockNode::new(119, ledger());
    let store = store();
    let (mut poller, _) = Poller::new(node, store.clone(), detectors(), config(100));
    poller.poll_once().await.unwrap();

    let sink = Arc::new(MemorySink::default());
    let first = sync_once(&store, sink.as_ref()).await;
    assert_eq!(first.trades_written, 20);
    assert_eq!(first.alerts_written, 1);
    assert_eq!(store.pending_len(), (0, 0));

    let persisted = sink.trades.lock().get(&format!("{}:0", tx_hash(105))).cloned().unwrap();
    assert!(persisted.is_wash);

    let second = sync_once(&store, sink.as_ref()).await;
    assert_eq!(second.trades_written + second.alerts_written, 0);

    let wash_only = store.query(&TradeQuery {
        wash_only: true,
        ..Default::default()
    });
    assert_eq!(wash_only.len(), 1);
}
