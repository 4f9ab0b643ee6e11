//! The orchestration run: five fixed phases per scheduled fire.
//!
//! 1. Fetch    – batched provider fetch, partial failure tolerated
//! 2. Compute  – per-city ETo kernel, failed cities dropped
//! 3. Validate – global model-vs-provider metrics, diagnostic only
//! 4. Persist hot   – snapshot + metadata to the cache (one retry, then abort)
//! 5. Persist audit – run row upsert, failures swallowed
//!
//! Only a complete Phase-1 outage or a Phase-4 failure aborts the run;
//! everything else degrades into the per-city failure list.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::errors::{FailureKind, PipelineError};
use crate::models::city::CityRef;
use crate::models::forecast::{
    CityFailure, CityForecast, Quality, RunLabel, RunMetadata, RunReport, Snapshot,
};
use crate::services::audit::AuditLog;
use crate::services::cache::CacheGateway;
use crate::services::forecast_client::ForecastClient;
use crate::services::{eto, validation};

// Soft per-phase budgets: overruns log a warning, nothing is cancelled.
const FETCH_BUDGET: Duration = Duration::from_secs(60);
const COMPUTE_BUDGET: Duration = Duration::from_secs(15);
const PERSIST_BUDGET: Duration = Duration::from_secs(5);
const CACHE_RETRY_DELAY: Duration = Duration::from_millis(500);

pub struct Pipeline {
    cities: Arc<Vec<CityRef>>,
    client: ForecastClient,
    cache: CacheGateway,
    audit: AuditLog,
}

impl Pipeline {
    pub fn new(
        cities: Arc<Vec<CityRef>>,
        client: ForecastClient,
        cache: CacheGateway,
        audit: AuditLog,
    ) -> Self {
        Self {
            cities,
            client,
            cache,
            audit,
        }
    }

    /// Execute one run. Returns the structured report on success; the two
    /// retryable error cases bubble up to the scheduler.
    pub async fn run(&self, fired_at: DateTime<Utc>) -> Result<RunReport, PipelineError> {
        let started = Instant::now();
        let run_label = RunLabel::from_fired_at(fired_at);
        info!(run_label = %run_label, cities = self.cities.len(), "run started");

        // ── Phase 1: fetch ───────────────────────────────────────────────
        let phase = Instant::now();
        let (mut per_city_hourly, mut failures) = self.client.fetch_all(&self.cities).await;
        warn_if_over(phase, FETCH_BUDGET, "fetch");
        info!(
            fetched = per_city_hourly.len(),
            failed = failures.len(),
            "fetch phase done"
        );
        if per_city_hourly.is_empty() && !self.cities.is_empty() {
            error!("every batch failed, provider appears to be down");
            return Err(PipelineError::UpstreamOutage);
        }

        // ── Phase 2: compute ─────────────────────────────────────────────
        let phase = Instant::now();
        let mut forecasts: BTreeMap<String, CityForecast> = BTreeMap::new();
        let mut model = Vec::with_capacity(per_city_hourly.len() * 2);
        let mut provider = Vec::with_capacity(per_city_hourly.len() * 2);

        for city in self.cities.iter() {
            let Some(series) = per_city_hourly.remove(&city.code) else {
                continue;
            };
            match eto::compute(&series, city.latitude, city.elevation_m) {
                Ok(out) if out.days.len() == 2 => {
                    if out.non_finite_hours > 0 {
                        warn!(
                            city = %city.code,
                            hours = out.non_finite_hours,
                            "non-finite ETo hours substituted with 0"
                        );
                    }
                    for day in &out.days {
                        model.push(day.eto_model_mm_day);
                        provider.push(day.eto_provider_mm_day);
                    }
                    forecasts.insert(
                        city.code.clone(),
                        CityForecast {
                            city_name: city.name.clone(),
                            state: city.state,
                            latitude: city.latitude,
                            longitude: city.longitude,
                            elevation_m: city.elevation_m,
                            days: out.days,
                        },
                    );
                }
                Ok(out) => {
                    debug!(city = %city.code, days = out.days.len(), "incomplete day coverage");
                    failures.push(CityFailure {
                        city_code: city.code.clone(),
                        error_kind: FailureKind::InsufficientHours,
                    });
                }
                Err(e) => {
                    debug!(city = %city.code, error = %e, "kernel rejected city");
                    failures.push(CityFailure {
                        city_code: city.code.clone(),
                        error_kind: e.kind(),
                    });
                }
            }
        }
        warn_if_over(phase, COMPUTE_BUDGET, "compute");

        // ── Phase 3: validate (never halts the pipeline) ─────────────────
        let validation = validation::validate(&model, &provider);
        match validation.quality {
            Quality::BelowExpected => warn!(
                r2 = ?validation.r2,
                rmse = ?validation.rmse_mm_day,
                n_samples = validation.n_samples,
                "model agreement below expected"
            ),
            q => info!(
                quality = %q,
                r2 = ?validation.r2,
                rmse = ?validation.rmse_mm_day,
                n_samples = validation.n_samples,
                "validation done"
            ),
        }

        // ── Phase 4: persist hot (the only persistence that can abort) ───
        let updated_at = Utc::now();
        let metadata = RunMetadata::new(run_label, updated_at, self.cities.len(), forecasts.len());
        let n_cities_succeeded = forecasts.len();
        let snapshot = Snapshot {
            forecasts,
            validation,
            metadata,
        };

        let phase = Instant::now();
        if let Err(first) = self.cache.put_snapshot(&snapshot).await {
            warn!(error = %first, "hot cache write failed, retrying once");
            tokio::time::sleep(CACHE_RETRY_DELAY).await;
            if let Err(second) = self.cache.put_snapshot(&snapshot).await {
                error!(error = %second, "hot cache write failed twice, aborting run");
                return Err(PipelineError::CacheWriteFailed(second.to_string()));
            }
        }
        warn_if_over(phase, PERSIST_BUDGET, "persist-hot");

        // ── Phase 5: persist audit (failures swallowed) ──────────────────
        let report = RunReport {
            success: true,
            run_label,
            duration_s: started.elapsed().as_secs_f64(),
            n_cities_attempted: self.cities.len(),
            n_cities_succeeded,
            quality: snapshot.validation.quality,
            failures,
        };

        let phase = Instant::now();
        if let Err(e) = self
            .audit
            .record_run(&snapshot.metadata, &snapshot.validation, &report)
            .await
        {
            warn!(error = %e, "audit write failed, continuing");
        }
        warn_if_over(phase, PERSIST_BUDGET, "persist-audit");

        info!(
            run_label = %report.run_label,
            duration_s = report.duration_s,
            succeeded = report.n_cities_succeeded,
            attempted = report.n_cities_attempted,
            quality = %report.quality,
            "run finished"
        );
        Ok(report)
    }
}

fn warn_if_over(started: Instant, budget: Duration, phase: &str) {
    let elapsed = started.elapsed();
    if elapsed > budget {
        warn!(
            phase,
            elapsed_s = elapsed.as_secs(),
            budget_s = budget.as_secs(),
            "phase exceeded its soft budget"
        );
    }
}
