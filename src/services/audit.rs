//! Audit log gateway.
//!
//! One relational row per run, keyed by `updated_at`, for post-hoc
//! analysis. The gateway is optional: without `DB_URL` every write is
//! skipped with a warning, and a write failure never fails the run —
//! the hot cache is the authority for read availability.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::models::forecast::{RunMetadata, RunReport, ValidationMetrics};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS matopiba_runs (
    run_label     TEXT NOT NULL,
    updated_at    TIMESTAMPTZ NOT NULL UNIQUE,
    n_cities      INTEGER NOT NULL,
    r2            DOUBLE PRECISION,
    rmse          DOUBLE PRECISION,
    bias          DOUBLE PRECISION,
    mae           DOUBLE PRECISION,
    success_rate  DOUBLE PRECISION NOT NULL,
    quality       TEXT NOT NULL,
    metadata_json JSONB NOT NULL,
    created_at    TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS idx_matopiba_runs_updated_at ON matopiba_runs (updated_at DESC);
CREATE INDEX IF NOT EXISTS idx_matopiba_runs_quality   ON matopiba_runs (quality);
CREATE INDEX IF NOT EXISTS idx_matopiba_runs_run_label ON matopiba_runs (run_label);
"#;

/// Upsert on the unique run timestamp: a task retry replaces the metric
/// columns instead of inserting a second row.
const UPSERT_SQL: &str = r#"
INSERT INTO matopiba_runs
    (run_label, updated_at, n_cities, r2, rmse, bias, mae, success_rate, quality, metadata_json)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
ON CONFLICT (updated_at) DO UPDATE SET
    run_label     = EXCLUDED.run_label,
    n_cities      = EXCLUDED.n_cities,
    r2            = EXCLUDED.r2,
    rmse          = EXCLUDED.rmse,
    bias          = EXCLUDED.bias,
    mae           = EXCLUDED.mae,
    success_rate  = EXCLUDED.success_rate,
    quality       = EXCLUDED.quality,
    metadata_json = EXCLUDED.metadata_json
"#;

#[derive(Clone)]
pub struct AuditLog {
    pool: Option<PgPool>,
}

impl AuditLog {
    /// Lazy pool: an unreachable database surfaces per-write (and is
    /// swallowed there), not at startup.
    pub fn connect(db_url: Option<&str>) -> Self {
        let pool = match db_url {
            Some(url) => match PgPoolOptions::new().max_connections(2).connect_lazy(url) {
                Ok(pool) => Some(pool),
                Err(e) => {
                    warn!(error = %e, "invalid DB_URL, audit log disabled");
                    None
                }
            },
            None => {
                warn!("DB_URL not set, audit log disabled");
                None
            }
        };
        Self { pool }
    }

    #[cfg(test)]
    pub fn disabled() -> Self {
        Self { pool: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.pool.is_some()
    }

    /// Create the run table and its indexes if missing. Best-effort.
    pub async fn ensure_schema(&self) {
        let Some(pool) = &self.pool else { return };
        match sqlx::raw_sql(SCHEMA_SQL).execute(pool).await {
            Ok(_) => info!("audit schema ready"),
            Err(e) => warn!(error = %e, "audit schema setup failed"),
        }
    }

    /// Record one run. Errors bubble up so the pipeline can log-and-swallow;
    /// a disabled gateway skips silently apart from a warning.
    pub async fn record_run(
        &self,
        metadata: &RunMetadata,
        validation: &ValidationMetrics,
        report: &RunReport,
    ) -> Result<(), sqlx::Error> {
        let Some(pool) = &self.pool else {
            warn!("audit log disabled, run not recorded");
            return Ok(());
        };
        let metadata_json = serde_json::to_value(report).unwrap_or_default();
        sqlx::query(UPSERT_SQL)
            .bind(metadata.run_label.as_str())
            .bind(metadata.updated_at_utc)
            .bind(metadata.n_cities_succeeded as i32)
            .bind(validation.r2)
            .bind(validation.rmse_mm_day)
            .bind(validation.bias_mm_day)
            .bind(validation.mae_mm_day)
            .bind(metadata.success_rate)
            .bind(validation.quality.as_str())
            .bind(metadata_json)
            .execute(pool)
            .await?;
        Ok(())
    }
}
