//! Hot cache gateway.
//!
//! The snapshot lives in a key/value store under fixed `:latest` keys so a
//! new run replaces the previous one atomically instead of leaving readers
//! to chase timestamped keys. Both keys are written in one MULTI/EXEC
//! pipeline, snapshot first, so a reader that sees metadata always finds
//! the matching snapshot.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::forecast::{RunMetadata, Snapshot};

pub const SNAPSHOT_KEY: &str = "matopiba:forecasts:latest";
pub const METADATA_KEY: &str = "matopiba:metadata:latest";
/// 6 hours, re-applied on every successful write.
pub const SNAPSHOT_TTL_SECS: u64 = 21_600;

const LEGACY_PATTERNS: [&str; 2] = ["matopiba:forecasts:*", "matopiba:metadata:*"];

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("snapshot encode: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("snapshot decode: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("metadata json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone)]
pub struct CacheGateway {
    con: ConnectionManager,
}

impl CacheGateway {
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let con = ConnectionManager::new(client).await?;
        Ok(Self { con })
    }

    /// Publish a run: sweep legacy keys (best-effort), then write snapshot
    /// and metadata with TTL in a single transaction.
    pub async fn put_snapshot(&self, snapshot: &Snapshot) -> Result<(), CacheError> {
        let snapshot_bytes = encode_snapshot(snapshot)?;
        let metadata_json = serde_json::to_string(&snapshot.metadata)?;

        self.cleanup_legacy_keys().await;

        let mut con = self.con.clone();
        redis::pipe()
            .atomic()
            .set_ex(SNAPSHOT_KEY, snapshot_bytes, SNAPSHOT_TTL_SECS)
            .ignore()
            .set_ex(METADATA_KEY, metadata_json, SNAPSHOT_TTL_SECS)
            .ignore()
            .query_async::<_, ()>(&mut con)
            .await?;
        Ok(())
    }

    pub async fn get_snapshot(&self) -> Result<Option<Snapshot>, CacheError> {
        let mut con = self.con.clone();
        let bytes: Option<Vec<u8>> = con.get(SNAPSHOT_KEY).await?;
        match bytes {
            Some(bytes) => Ok(Some(decode_snapshot(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn get_metadata(&self) -> Result<Option<RunMetadata>, CacheError> {
        let mut con = self.con.clone();
        let raw: Option<String> = con.get(METADATA_KEY).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Remove keys left behind by older deployments that stored snapshots
    /// under timestamped names. Failure here never fails the run.
    async fn cleanup_legacy_keys(&self) {
        match self.collect_legacy_keys().await {
            Ok(stale) if !stale.is_empty() => {
                debug!(count = stale.len(), "deleting legacy cache keys");
                let mut con = self.con.clone();
                if let Err(e) = con.del::<_, ()>(stale).await {
                    warn!(error = %e, "legacy key cleanup failed");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "legacy key scan failed"),
        }
    }

    async fn collect_legacy_keys(&self) -> Result<Vec<String>, redis::RedisError> {
        let mut con = self.con.clone();
        let mut stale = Vec::new();
        for pattern in LEGACY_PATTERNS {
            let mut iter = con.scan_match::<_, String>(pattern).await?;
            while let Some(key) = iter.next_item().await {
                if is_legacy_key(&key) {
                    stale.push(key);
                }
            }
        }
        Ok(stale)
    }
}

/// A matched key is legacy unless it is one of the two `:latest` names.
pub(crate) fn is_legacy_key(key: &str) -> bool {
    key != SNAPSHOT_KEY && key != METADATA_KEY
}

pub(crate) fn encode_snapshot(snapshot: &Snapshot) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    // Named MessagePack over BTreeMaps: equal inputs encode to equal bytes.
    rmp_serde::to_vec_named(snapshot)
}

pub(crate) fn decode_snapshot(bytes: &[u8]) -> Result<Snapshot, rmp_serde::decode::Error> {
    rmp_serde::from_slice(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::city::StateCode;
    use crate::models::forecast::{
        CityForecast, DailyForecast, Quality, RunLabel, RunMetadata, ValidationMetrics,
    };
    use chrono::{NaiveDate, TimeZone, Utc};
    use std::collections::BTreeMap;

    fn sample_snapshot() -> Snapshot {
        let day = |d: u32| DailyForecast {
            date_local: NaiveDate::from_ymd_opt(2026, 8, d).unwrap(),
            t_max_c: 33.0,
            t_min_c: 19.5,
            t_mean_c: 25.8,
            rh_mean_pct: 52.0,
            ws_mean_ms: 2.4,
            radiation_sum_mj_m2: 21.7,
            precipitation_sum_mm: 0.0,
            eto_model_mm_day: 5.2,
            eto_provider_mm_day: 5.0,
        };
        let mut forecasts = BTreeMap::new();
        forecasts.insert(
            "2100055".to_string(),
            CityForecast {
                city_name: "Balsas".into(),
                state: StateCode::MA,
                latitude: -7.53,
                longitude: -46.04,
                elevation_m: 280.0,
                days: vec![day(1), day(2)],
            },
        );
        let updated = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 3).unwrap();
        Snapshot {
            forecasts,
            validation: ValidationMetrics {
                r2: Some(0.91),
                rmse_mm_day: Some(0.4),
                bias_mm_day: Some(0.1),
                mae_mm_day: Some(0.3),
                n_samples: 2,
                quality: Quality::Excellent,
            },
            metadata: RunMetadata::new(RunLabel::H12, updated, 337, 337),
        }
    }

    #[test]
    fn snapshot_round_trips_through_messagepack() {
        let snapshot = sample_snapshot();
        let bytes = encode_snapshot(&snapshot).unwrap();
        let decoded = decode_snapshot(&bytes).unwrap();
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn equal_snapshots_encode_to_equal_bytes() {
        let a = encode_snapshot(&sample_snapshot()).unwrap();
        let b = encode_snapshot(&sample_snapshot()).unwrap();
        assert_eq!(a, b, "encoding must be deterministic for equal inputs");
    }

    #[test]
    fn none_metrics_survive_the_round_trip() {
        let mut snapshot = sample_snapshot();
        snapshot.validation = ValidationMetrics {
            r2: None,
            rmse_mm_day: None,
            bias_mm_day: None,
            mae_mm_day: None,
            n_samples: 0,
            quality: Quality::BelowExpected,
        };
        let decoded = decode_snapshot(&encode_snapshot(&snapshot).unwrap()).unwrap();
        assert_eq!(decoded.validation.r2, None);
        assert_eq!(decoded.validation.quality, Quality::BelowExpected);
    }

    #[test]
    fn latest_keys_are_never_treated_as_legacy() {
        assert!(!is_legacy_key(SNAPSHOT_KEY));
        assert!(!is_legacy_key(METADATA_KEY));
        assert!(is_legacy_key("matopiba:forecasts:2026-08-01T06"));
        assert!(is_legacy_key("matopiba:metadata:backup"));
    }
}
