use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus exporter and register all application metrics.
/// Returns a `PrometheusHandle` whose `render()` method produces the
/// text/plain Prometheus scrape payload.
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    // Pre-register counters so they appear even before the first increment.
    for name in [
        "trades_ingested_total",
        "trades_duplicate_total",
        "decode_errors_total",
        "wash_trades_flagged_total",
        "alerts_emitted_total",
        "events_dropped_total",
        "rpc_errors_total",
        "chunks_abandoned_total",
        "detector_failures_total",
        "persistence_errors_total",
        "persistence_dropped_total",
        "subscriber_failures_total",
    ] {
        counter!(name).absolute(0);
    }

    gauge!("chain_head_block").set(0.0);
    gauge!("store_trades").set(0.0);

    // Histogram is lazily created on first record; force creation.
    histogram!("ingest_cycle_seconds").record(0.0);

    Ok(handle)
}
