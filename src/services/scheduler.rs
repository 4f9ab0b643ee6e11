//! Cron firing for the orchestration task.
//!
//! Four UTC instants per day by default. The scheduler is stateless:
//! missed fires are not made up, and a fire that arrives while a run is
//! still in flight is discarded via `try_lock` on the shared run lock.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::errors::PipelineError;
use crate::services::pipeline::Pipeline;
use crate::shared_state::RunStats;

/// Task-level retries: only a complete upstream outage or a hot cache
/// write failure re-runs, after a 5 minute pause.
const MAX_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(300);
/// Hard deadline for one attempt.
const RUN_DEADLINE: Duration = Duration::from_secs(600);

/// Register and start the cron job. The returned scheduler handle must be
/// kept alive by the caller.
pub async fn start(
    cron_expr: &str,
    pipeline: Arc<Pipeline>,
    stats: Arc<RunStats>,
) -> anyhow::Result<JobScheduler> {
    let expr = normalize_cron(cron_expr);
    let run_lock = Arc::new(Mutex::new(()));

    let sched = JobScheduler::new().await?;
    let job = Job::new_async(expr.as_str(), move |_uuid, _lock| {
        let pipeline = pipeline.clone();
        let stats = stats.clone();
        let run_lock = run_lock.clone();
        Box::pin(async move {
            execute_fire(&pipeline, &stats, &run_lock).await;
        })
    })?;
    sched.add(job).await?;
    sched.start().await?;
    info!(cron = %expr, "scheduler started");
    Ok(sched)
}

/// Handle one fire: claim the run lock (or drop the fire), then run the
/// pipeline with the task-level retry policy.
async fn execute_fire(pipeline: &Pipeline, stats: &RunStats, run_lock: &Mutex<()>) {
    let Ok(_guard) = run_lock.try_lock() else {
        info!("run already in progress, discarding fire");
        return;
    };

    for attempt in 1..=MAX_ATTEMPTS {
        let fired_at = Utc::now();
        let result = match tokio::time::timeout(RUN_DEADLINE, pipeline.run(fired_at)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::DeadlineExceeded(RUN_DEADLINE.as_secs())),
        };

        match result {
            Ok(report) => {
                stats.record_success(&report);
                return;
            }
            Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                warn!(attempt, error = %e, "run failed, retrying in 5 minutes");
                stats.record_failure();
                tokio::time::sleep(RETRY_DELAY).await;
            }
            Err(e) => {
                error!(attempt, error = %e, "run failed");
                stats.record_failure();
                return;
            }
        }
    }
}

/// The configured expression follows the 5-field cron convention; the
/// scheduler wants a seconds field in front.
pub fn normalize_cron(expr: &str) -> String {
    let trimmed = expr.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}
