use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::detection::{run_full_analysis, AnalysisReport, DetectorSet};
use crate::store::TradeStore;

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("an analysis run is already in progress")]
    AlreadyRunning,
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Serializes full-analysis runs between the periodic worker and the HTTP
/// trigger, and keeps the last report around.
pub struct AnalysisRunner {
    store: Arc<TradeStore>,
    detectors: Arc<DetectorSet>,
    cancel: Arc<AtomicBool>,
    running: Mutex<()>,
    last: RwLock<Option<AnalysisReport>>,
}

impl AnalysisRunner {
    pub fn new(store: Arc<TradeStore>, detectors: Arc<DetectorSet>) -> Self {
        Self {
            store,
            detectors,
            cancel: Arc::new(AtomicBool::new(false)),
            running: Mutex::new(()),
            last: RwLock::new(None),
        }
    }

    /// Run every batch detector over a fresh snapshot. Fails fast when a run
    /// is already underway instead of queueing behind it.
    pub async fn run(&self) -> Result<AnalysisReport, AnalysisError> {
        let _guard = self.running.try_lock().map_err(|_| AnalysisError::AlreadyRunning)?;
        self.cancel.store(false, Ordering::Relaxed);

        let report = run_full_analysis(self.store.clone(), self.detectors.clone(), self.cancel.clone()).await?;
        *self.last.write() = Some(report.clone());
        Ok(report)
    }

    /// Ask the current run to stop at its next detector boundary.
    /// Returns false when nothing is running.
    pub fn cancel(&self) -> bool {
        if self.running.try_lock().is_ok() {
            return false;
        }
        self.cancel.store(true, Ordering::Relaxed);
        true
    }

    pub fn is_running(&self) -> bool {
        self.running.try_lock().is_err()
    }

    pub fn last_report(&self) -> Option<AnalysisReport> {
        self.last.read().clone()
    }
}

/// Periodic full analysis. Ticks that land on a manual run are skipped.
pub async fn run_analysis_worker(runner: Arc<AnalysisRunner>, interval_secs: u64) {
    let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick fires immediately; nothing is ingested yet.
    ticker.tick().await;
    tracing::info!(interval_secs, "Analysis worker started");

    loop {
        ticker.tick().await;
        match runner.run().await {
            Ok(_) => {}
            Err(AnalysisError::AlreadyRunning) => {
                tracing::debug!("Analysis already running, skipping tick");
            }
            Err(e) => {
                tracing::error!(error = %e, "Periodic analysis failed");
            }
        }
    }
}
