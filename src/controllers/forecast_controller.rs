use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::Utc;
use tokio::time::timeout;
use tracing::{error, warn};

use crate::models::forecast::{RunLabel, RunMetadata, Snapshot};
use crate::services::cache::CacheGateway;
use crate::shared_state::RunStats;

/// Hard timeout on cache lookups; a slow cache degrades to 503, never to a
/// hanging reader.
const CACHE_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

// ─── Snapshot ────────────────────────────────────────────────────────────────

/// GET /api/v1/matopiba/forecasts
///
/// The full latest snapshot, straight from the hot cache. Reads never
/// trigger an upstream fetch: an empty or unreachable cache is a 503 with
/// the next scheduled update as a polling hint.
#[utoipa::path(get, path = "/api/v1/matopiba/forecasts",
    responses(
        (status = 200, description = "Latest snapshot", body = Snapshot),
        (status = 503, description = "Cache empty or unreachable")
    ))]
pub async fn get_forecasts(State(cache): State<CacheGateway>) -> impl IntoResponse {
    match timeout(CACHE_LOOKUP_TIMEOUT, cache.get_snapshot()).await {
        Ok(Ok(Some(snapshot))) => (StatusCode::OK, Json(snapshot)).into_response(),
        Ok(Ok(None)) => cache_empty(true),
        Ok(Err(e)) => {
            error!(error = %e, "snapshot lookup failed");
            cache_empty(true)
        }
        Err(_) => {
            warn!("snapshot lookup timed out");
            cache_empty(true)
        }
    }
}

// ─── Metadata ────────────────────────────────────────────────────────────────

/// GET /api/v1/matopiba/metadata
#[utoipa::path(get, path = "/api/v1/matopiba/metadata",
    responses(
        (status = 200, description = "Latest run metadata", body = RunMetadata),
        (status = 503, description = "Cache empty or unreachable")
    ))]
pub async fn get_metadata(State(cache): State<CacheGateway>) -> impl IntoResponse {
    match timeout(CACHE_LOOKUP_TIMEOUT, cache.get_metadata()).await {
        Ok(Ok(Some(metadata))) => (StatusCode::OK, Json(metadata)).into_response(),
        Ok(Ok(None)) => cache_empty(false),
        Ok(Err(e)) => {
            error!(error = %e, "metadata lookup failed");
            cache_empty(false)
        }
        Err(_) => {
            warn!("metadata lookup timed out");
            cache_empty(false)
        }
    }
}

// ─── Health ──────────────────────────────────────────────────────────────────

/// GET /api/v1/matopiba/health — liveness only, does not consult the cache.
#[utoipa::path(get, path = "/api/v1/matopiba/health",
    responses((status = 200, description = "Process is alive")))]
pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

// ─── Prometheus metrics endpoint ─────────────────────────────────────────────

/// GET /metrics — Prometheus text format
pub async fn prometheus_metrics(State(stats): State<Arc<RunStats>>) -> impl IntoResponse {
    let mut out = String::with_capacity(1024);

    out.push_str("# HELP matopiba_runs_total Orchestration runs attempted\n");
    out.push_str("# TYPE matopiba_runs_total counter\n");
    out.push_str(&format!("matopiba_runs_total {}\n", stats.runs_total()));

    out.push_str("# HELP matopiba_runs_failed_total Orchestration runs that aborted\n");
    out.push_str("# TYPE matopiba_runs_failed_total counter\n");
    out.push_str(&format!("matopiba_runs_failed_total {}\n", stats.runs_failed()));

    out.push_str("# HELP matopiba_uptime_seconds Seconds since process start\n");
    out.push_str("# TYPE matopiba_uptime_seconds gauge\n");
    out.push_str(&format!("matopiba_uptime_seconds {}\n", stats.uptime_seconds()));

    if let Some(last) = stats.last_report() {
        out.push_str("# HELP matopiba_last_run_cities Cities in the latest snapshot\n");
        out.push_str("# TYPE matopiba_last_run_cities gauge\n");
        out.push_str(&format!(
            "matopiba_last_run_cities {}\n",
            last.n_cities_succeeded
        ));

        out.push_str("# HELP matopiba_last_run_duration_seconds Wall time of the last run\n");
        out.push_str("# TYPE matopiba_last_run_duration_seconds gauge\n");
        out.push_str(&format!(
            "matopiba_last_run_duration_seconds {:.3}\n",
            last.duration_s
        ));

        out.push_str("# HELP matopiba_last_run_quality Quality class of the last run\n");
        out.push_str("# TYPE matopiba_last_run_quality gauge\n");
        for quality in ["EXCELLENT", "ACCEPTABLE", "BELOW_EXPECTED"] {
            let value = if last.quality.as_str() == quality { 1 } else { 0 };
            out.push_str(&format!(
                "matopiba_last_run_quality{{class=\"{quality}\"}} {value}\n"
            ));
        }
    }

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        out,
    )
}

/// 503 body; the forecasts endpoint adds the next scheduled instant so
/// clients know when to poll again.
fn cache_empty(with_hint: bool) -> axum::response::Response {
    let mut body = serde_json::json!({ "error": "cache_empty" });
    if with_hint {
        body["next_update_utc"] = serde_json::json!(RunLabel::next_instant(Utc::now()));
    }
    (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
}
