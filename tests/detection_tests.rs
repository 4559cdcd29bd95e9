mod common;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use washwatch::detection::{run_full_analysis, DetectorSet, DetectorConfig};
use washwatch::models::{AlertType, PositionEvent, PositionKind, Severity, Side, Trade, WashType};
use washwatch::store::AlertQuery;

use common::{detectors, store, trade, wallet};

fn alert_ids(trades: &[Trade]) -> Vec<String> {
    let store = store();
    let set = DetectorSet::new(DetectorConfig::default());
    for t in trades {
        store.insert(t.clone());
    }
    set.on_trades(&store, trades);
    let mut ids: Vec<String> = store
        .alerts(&AlertQuery::default())
        .into_iter()
        .map(|a| a.alert_id)
        .collect();
    ids.sort();
    ids
}

#[test]
fn test_same_trades_give_same_alert_ids() {
    let trades = vec![
        trade(1, 0, "0xa", "0xa", Side::Buy, "0.5", "100"),
        trade(2, 10, "0xb", "0xc", Side::Buy, "0.5", "100"),
        trade(3, 20, "0xc", "0xb", Side::Buy, "0.5", "100"),
    ];
    let first = alert_ids(&trades);
    assert_eq!(first.len(), 2);
    assert!(first.iter().any(|id| id.starts_with("SELF_")));
    assert!(first.iter().any(|id| id.starts_with("CIRC_")));
    assert_eq!(first, alert_ids(&trades));
}

#[tokio::test]
async fn test_inline_and_batch_circular_findings_collapse() {
    let store = store();
    let set = detectors();
    let trades = vec![
        trade(1, 0, "0xa", "0xb", Side::Buy, "0.5", "200"),
        trade(2, 30, "0xb", "0xa", Side::Buy, "0.5", "200"),
        trade(3, 90, "0xd", "0xe", Side::Sell, "0.7", "15"),
    ];
    for t in &trades {
        store.insert(t.clone());
    }
    set.on_trades(&store, &trades);

    let circular = AlertQuery {
        alert_type: Some(AlertType::Circular),
        ..Default::default()
    };
    assert_eq!(store.alerts(&circular).len(), 1);

    let report = run_full_analysis(store.clone(), set, Arc::new(AtomicBool::new(false)))
        .await
        .unwrap();
    assert_eq!(report.evidence.get(&AlertType::Circular), Some(&1));
    assert_eq!(store.alerts(&circular).len(), 1);

    let alert = &store.alerts(&circular)[0];
    assert_eq!(alert.trades.len(), 2);
    assert!(alert.trades.iter().all(|t| t.wash_type == Some(WashType::Circular)));
    assert_eq!(store.stats().wash_trade_count, 2);
}

#[test]
fn test_sybil_cluster_forms_inline() {
    let store = store();
    let set = detectors();
    let trades: Vec<Trade> = (0..5)
        .map(|i| trade(i, i as i64, &wallet(i), "0xcounter", Side::Buy, "0.5", "1000"))
        .collect();
    for t in &trades {
        store.insert(t.clone());
    }
    let report = set.on_trades(&store, &trades);

    assert_eq!(report.evidence.get(&AlertType::SybilCluster), Some(&1));
    let alerts = store.alerts(&AlertQuery {
        alert_type: Some(AlertType::SybilCluster),
        ..Default::default()
    });
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].details["cluster_size"], 5);
    // Sybil findings alert without tagging trades.
    assert_eq!(store.stats().wash_trade_count, 0);
}

#[test]
fn test_reciprocal_pair_marks_both_legs_equally() {
    let store = store();
    let set = detectors();
    let t1 = trade(1, 0, "0xa", "0xb", Side::Buy, "0.5", "100");
    let t2 = trade(2, 30, "0xb", "0xa", Side::Buy, "0.5", "100");
    for t in [&t1, &t2] {
        store.insert(t.clone());
        set.on_trades(&store, std::slice::from_ref(t));
    }

    let first = store.get(&t1.key()).unwrap();
    let second = store.get(&t2.key()).unwrap();
    assert_eq!(first.wash_type, Some(WashType::Circular));
    assert_eq!(second.wash_type, Some(WashType::Circular));
    assert!(first.wash_confidence > 0.0);
    assert_eq!(first.wash_confidence, second.wash_confidence);
}

#[tokio::test]
async fn test_volume_spike_lowers_market_health() {
    let store = store();
    for i in 0..12u64 {
        store.insert(trade(i, i as i64 * 300, &wallet(2 * i), &wallet(2 * i + 1), Side::Buy, "0.5", "100"));
    }
    store.insert(trade(12, 12 * 300, &wallet(50), &wallet(51), Side::Buy, "0.5", "1200"));

    let report = run_full_analysis(store.clone(), detectors(), Arc::new(AtomicBool::new(false)))
        .await
        .unwrap();

    assert_eq!(report.evidence.get(&AlertType::VolumeSpike), Some(&1));
    let health = store.market_health("asset-x").unwrap();
    assert!(health.score() < 100.0);
    assert!(health.score() > 90.0);
    assert_eq!(health.wash_trades, 0);
}

#[tokio::test]
async fn test_repeated_analysis_appends_nothing_new() {
    let store = store();
    store.insert(trade(1, 0, "0xa", "0xb", Side::Buy, "0.5", "200"));
    store.insert(trade(2, 600, "0xb", "0xc", Side::Buy, "0.5", "200"));
    store.insert(trade(3, 1200, "0xc", "0xa", Side::Buy, "0.5", "200"));
    let set = detectors();

    let first = run_full_analysis(store.clone(), set.clone(), Arc::new(AtomicBool::new(false)))
        .await
        .unwrap();
    let second = run_full_analysis(store.clone(), set, Arc::new(AtomicBool::new(false)))
        .await
        .unwrap();

    assert!(first.alerts_appended >= 1);
    assert_eq!(first.trades_flagged, 3);
    assert_eq!(second.alerts_appended, 0);
    assert_eq!(second.trades_flagged, 0);
}

fn position(kind: PositionKind, tx_hash: &str, stakeholder: &str) -> PositionEvent {
    PositionEvent {
        kind,
        tx_hash: tx_hash.into(),
        log_index: 10,
        block_number: 500,
        stakeholder: stakeholder.into(),
        condition_id: "0xcond".into(),
        amount: "100".parse().unwrap(),
    }
}

#[tokio::test]
async fn test_exact_atomic_finding_survives_earlier_heuristic_alert() {
    let store = store();
    let set = detectors();

    let mut buy = trade(1, 0, "0xa", "0xb", Side::Buy, "0.5", "100");
    let mut sell = trade(2, 0, "0xa", "0xc", Side::Sell, "0.5", "100");
    buy.block_number = 500;
    sell.block_number = 500;
    sell.tx_hash = buy.tx_hash.clone();
    let tx = buy.tx_hash.clone();
    let trades = vec![buy.clone(), sell];
    for t in &trades {
        store.insert(t.clone());
    }

    set.on_trades(&store, &trades);
    let atomic = AlertQuery {
        alert_type: Some(AlertType::AtomicWash),
        ..Default::default()
    };
    let inline = store.alerts(&atomic);
    assert_eq!(inline.len(), 1);
    assert_eq!(inline[0].details["pattern"], "buy_sell_hedge");

    set.record_positions(&[
        position(PositionKind::Split, &tx, "0xa"),
        position(PositionKind::Merge, &tx, "0xa"),
    ]);
    let report = run_full_analysis(store.clone(), set, Arc::new(AtomicBool::new(false)))
        .await
        .unwrap();
    assert!(report.alerts_appended >= 1);

    let alerts = store.alerts(&atomic);
    assert_eq!(alerts.len(), 2);
    let exact = alerts
        .iter()
        .find(|a| a.details["pattern"] == "split_trade_merge")
        .expect("exact finding stored");
    assert_eq!(exact.confidence, 0.995);
    assert_eq!(exact.severity, Severity::Critical);
    assert!(exact.trades.iter().all(|t| t.wash_confidence == 0.995));

    let heuristic = alerts
        .iter()
        .find(|a| a.details["pattern"] == "buy_sell_hedge")
        .expect("heuristic finding kept");
    assert!(heuristic.confidence < exact.confidence);

    let flagged = store.get(&buy.key()).unwrap();
    assert_eq!(flagged.wash_type, Some(WashType::Atomic));
    assert_eq!(flagged.wash_confidence, 0.995);
}
