use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use axum::extract::FromRef;

use crate::models::forecast::RunReport;
use crate::services::cache::CacheGateway;

/// State handed to the axum router; handlers pull the sub-state they need
/// via `FromRef<SharedState>`.
#[derive(Clone)]
pub struct SharedState {
    pub cache: CacheGateway,
    pub stats: Arc<RunStats>,
}

impl FromRef<SharedState> for CacheGateway {
    fn from_ref(state: &SharedState) -> Self {
        state.cache.clone()
    }
}

impl FromRef<SharedState> for Arc<RunStats> {
    fn from_ref(state: &SharedState) -> Self {
        state.stats.clone()
    }
}

/// Run counters and the last run report, fed by the scheduler and read by
/// the metrics endpoint.
#[derive(Debug)]
pub struct RunStats {
    started_at: Instant,
    runs_total: AtomicU64,
    runs_failed: AtomicU64,
    last_report: RwLock<Option<RunReport>>,
}

impl Default for RunStats {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            runs_total: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
            last_report: RwLock::new(None),
        }
    }
}

impl RunStats {
    pub fn record_success(&self, report: &RunReport) {
        self.runs_total.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_report.write() {
            *last = Some(report.clone());
        }
    }

    pub fn record_failure(&self) {
        self.runs_total.fetch_add(1, Ordering::Relaxed);
        self.runs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn runs_total(&self) -> u64 {
        self.runs_total.load(Ordering::Relaxed)
    }

    pub fn runs_failed(&self) -> u64 {
        self.runs_failed.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn last_report(&self) -> Option<RunReport> {
        self.last_report.read().ok().and_then(|r| r.clone())
    }
}
