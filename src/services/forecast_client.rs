//! Batched HTTP fetch of hourly forecasts for the full city list.
//!
//! The provider accepts up to 50 coordinates per request, so a 337-city run
//! needs 7 batches. Batches run concurrently under a small semaphore; a
//! failed batch marks its own cities failed and never aborts the run.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::America::Sao_Paulo;
use futures_util::future::join_all;
use reqwest::StatusCode;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::errors::{FailureKind, FetchError};
use crate::models::city::CityRef;
use crate::models::forecast::{CityFailure, HourlySeries, EXPECTED_HOURS};
use crate::models::provider::{HourlyBlock, LocationResponse, ProviderPayload};

/// Provider hard limit on coordinates per request.
pub const MAX_BATCH_SIZE: usize = 50;
/// Courtesy bound on concurrent batch requests.
const MAX_CONCURRENT_BATCHES: usize = 4;
const MAX_ATTEMPTS: u32 = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Hourly variables requested for every city.
pub const HOURLY_VARIABLES: &str = "temperature_2m,relative_humidity_2m,dew_point_2m,\
wind_speed_10m,shortwave_radiation,precipitation,et0_fao_evapotranspiration";

#[derive(Clone)]
pub struct ForecastClient {
    http: reqwest::Client,
    base_url: String,
}

impl ForecastClient {
    pub fn new(base_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Fetch hourly series for every city, batching by 50. Returns the
    /// successful series keyed by city code plus one failure record per
    /// city that could not be served.
    pub async fn fetch_all(
        &self,
        cities: &[CityRef],
    ) -> (BTreeMap<String, HourlySeries>, Vec<CityFailure>) {
        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_BATCHES));
        let batches = cities.chunks(MAX_BATCH_SIZE).map(|batch| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await;
                (batch, self.fetch_batch(batch).await)
            }
        });

        let mut series = BTreeMap::new();
        let mut failures = Vec::new();
        for (batch, result) in join_all(batches).await {
            match result {
                Ok(locations) if locations.len() == batch.len() => {
                    for (city, location) in batch.iter().zip(locations) {
                        match build_series(location.hourly) {
                            Ok(s) => {
                                series.insert(city.code.clone(), s);
                            }
                            Err(kind) => {
                                debug!(city = %city.code, ?kind, "city dropped during parse");
                                failures.push(CityFailure {
                                    city_code: city.code.clone(),
                                    error_kind: kind,
                                });
                            }
                        }
                    }
                }
                Ok(locations) => {
                    warn!(
                        expected = batch.len(),
                        got = locations.len(),
                        "provider returned wrong location count, dropping batch"
                    );
                    failures.extend(batch.iter().map(|c| CityFailure {
                        city_code: c.code.clone(),
                        error_kind: FailureKind::UpstreamMalformed,
                    }));
                }
                Err(e) => {
                    warn!(cities = batch.len(), error = %e, "batch fetch failed");
                    failures.extend(batch.iter().map(|c| CityFailure {
                        city_code: c.code.clone(),
                        error_kind: e.kind(),
                    }));
                }
            }
        }
        (series, failures)
    }

    /// One batch with retry: up to 3 attempts, 1 s/2 s/4 s backoff, only on
    /// transient errors and HTTP 5xx/429.
    async fn fetch_batch(&self, batch: &[CityRef]) -> Result<Vec<LocationResponse>, FetchError> {
        let url = self.batch_url(batch);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.request_once(&url).await {
                Ok(locations) => return Ok(locations),
                Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                    let backoff = BACKOFF_BASE * 2u32.pow(attempt - 1);
                    warn!(attempt, backoff_s = backoff.as_secs(), error = %e, "retrying batch");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn request_once(&self, url: &str) -> Result<Vec<LocationResponse>, FetchError> {
        let response = self.http.get(url).send().await.map_err(classify_reqwest)?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::UpstreamRateLimited);
        }
        if status.is_server_error() {
            return Err(FetchError::TransientNetwork(format!("HTTP {status}")));
        }
        if status.is_client_error() {
            return Err(FetchError::UpstreamBadRequest(status.as_u16()));
        }
        let payload: ProviderPayload = response
            .json()
            .await
            .map_err(|e| FetchError::UpstreamMalformed(e.to_string()))?;
        Ok(payload.into_vec())
    }

    /// Coordinates go out as comma-separated lists; the timezone pin makes
    /// the provider align the 48 hours with the region's two civil dates,
    /// and wind arrives in m/s instead of the provider default.
    fn batch_url(&self, batch: &[CityRef]) -> String {
        let latitudes: Vec<String> = batch.iter().map(|c| format!("{:.4}", c.latitude)).collect();
        let longitudes: Vec<String> = batch.iter().map(|c| format!("{:.4}", c.longitude)).collect();
        format!(
            "{}?latitude={}&longitude={}&hourly={}&forecast_days=2&timezone=America%2FSao_Paulo&wind_speed_unit=ms",
            self.base_url,
            latitudes.join(","),
            longitudes.join(","),
            HOURLY_VARIABLES,
        )
    }
}

fn classify_reqwest(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::TransientNetwork(e.to_string())
    }
}

// ─── Per-city normalization ──────────────────────────────────────────────────

/// Turn one location's parallel arrays into an `HourlySeries`.
///
/// Required columns (temperature, wind, radiation, and humidity or dew
/// point) must be fully populated; dew point keeps per-cell gaps for the
/// kernel's T − 5 substitution, and provider ETo gaps become NaN so the
/// validator skips those days.
pub(crate) fn build_series(block: HourlyBlock) -> Result<HourlySeries, FailureKind> {
    let n = block.time.len();
    if n < EXPECTED_HOURS {
        return Err(FailureKind::InsufficientHours);
    }

    let mut time_utc = Vec::with_capacity(n);
    for raw in &block.time {
        time_utc.push(parse_local_time(raw).ok_or(FailureKind::UpstreamMalformed)?);
    }

    let temp_c = require_column(&block.temperature_2m, n)?;
    let wind_speed_10m_ms = require_column(&block.wind_speed_10m, n)?;
    let shortwave_radiation_wm2 = require_column(&block.shortwave_radiation, n)?;

    let dew_complete =
        block.dew_point_2m.len() == n && block.dew_point_2m.iter().all(Option::is_some);
    let relative_humidity_pct = match require_column(&block.relative_humidity_2m, n) {
        Ok(col) => col,
        // Humidity may be absent when dew point is fully populated; the
        // daily RH mean then reports as null.
        Err(_) if dew_complete => vec![f64::NAN; n],
        Err(e) => return Err(e),
    };

    let dew_point_c = if block.dew_point_2m.len() == n {
        block.dew_point_2m
    } else {
        vec![None; n]
    };
    let precipitation_mm = optional_column(&block.precipitation, n, 0.0);
    let provider_eto_mm_h = optional_column(&block.et0_fao_evapotranspiration, n, f64::NAN);

    Ok(HourlySeries {
        time_utc,
        temp_c,
        relative_humidity_pct,
        wind_speed_10m_ms,
        shortwave_radiation_wm2,
        precipitation_mm,
        dew_point_c,
        provider_eto_mm_h,
    })
}

fn require_column(col: &[Option<f64>], n: usize) -> Result<Vec<f64>, FailureKind> {
    if col.len() != n {
        return Err(FailureKind::MissingColumns);
    }
    col.iter()
        .map(|cell| cell.ok_or(FailureKind::MissingColumns))
        .collect()
}

fn optional_column(col: &[Option<f64>], n: usize, fill: f64) -> Vec<f64> {
    if col.len() == n {
        col.iter().map(|cell| cell.unwrap_or(fill)).collect()
    } else {
        vec![fill; n]
    }
}

/// Provider times are local wall clock, `YYYY-MM-DDTHH:MM`. Brazil has no
/// DST transitions since 2019, so the local → UTC mapping is unambiguous.
fn parse_local_time(raw: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M").ok()?;
    naive
        .and_local_timezone(Sao_Paulo)
        .single()
        .map(|local| local.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::city::StateCode;
    use chrono::Timelike;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn city(code: &str) -> CityRef {
        CityRef {
            code: code.to_string(),
            name: format!("City {code}"),
            state: StateCode::TO,
            latitude: -10.2,
            longitude: -48.3,
            elevation_m: 230.0,
        }
    }

    fn hourly_json(hours: usize) -> serde_json::Value {
        let time: Vec<String> = (0..hours)
            .map(|h| format!("2026-08-{:02}T{:02}:00", 1 + h / 24, h % 24))
            .collect();
        json!({
            "time": time,
            "temperature_2m": vec![25.0; hours],
            "relative_humidity_2m": vec![60.0; hours],
            "dew_point_2m": vec![17.0; hours],
            "wind_speed_10m": vec![2.0; hours],
            "shortwave_radiation": vec![400.0; hours],
            "precipitation": vec![0.0; hours],
            "et0_fao_evapotranspiration": vec![0.3; hours],
        })
    }

    fn location_json(hours: usize) -> serde_json::Value {
        json!({"latitude": -10.2, "longitude": -48.3, "hourly": hourly_json(hours)})
    }

    #[tokio::test]
    async fn happy_path_returns_a_series_per_city() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/forecast"))
            .and(query_param("forecast_days", "2"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([location_json(48), location_json(48)])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = ForecastClient::new(&format!("{}/v1/forecast", server.uri()));
        let cities = [city("1700001"), city("1700002")];
        let (series, failures) = client.fetch_all(&cities).await;

        assert!(failures.is_empty(), "{failures:?}");
        assert_eq!(series.len(), 2);
        let s = &series["1700001"];
        assert_eq!(s.len(), 48);
        // 00:00 local in America/Sao_Paulo is 03:00 UTC.
        assert_eq!(s.time_utc[0].hour(), 3);
    }

    #[tokio::test]
    async fn server_errors_fail_the_batch_after_three_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/forecast"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let client = ForecastClient::new(&format!("{}/v1/forecast", server.uri()));
        let cities = [city("1700001"), city("1700002")];
        let (series, failures) = client.fetch_all(&cities).await;

        assert!(series.is_empty());
        assert_eq!(failures.len(), 2);
        assert!(failures
            .iter()
            .all(|f| f.error_kind == FailureKind::TransientNetwork));
    }

    #[tokio::test]
    async fn bad_request_aborts_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/forecast"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let client = ForecastClient::new(&format!("{}/v1/forecast", server.uri()));
        let (series, failures) = client.fetch_all(&[city("1700001")]).await;

        assert!(series.is_empty());
        assert_eq!(failures[0].error_kind, FailureKind::UpstreamBadRequest);
    }

    #[tokio::test]
    async fn short_horizon_drops_the_city_not_the_batch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/forecast"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([location_json(24), location_json(48)])),
            )
            .mount(&server)
            .await;

        let client = ForecastClient::new(&format!("{}/v1/forecast", server.uri()));
        let cities = [city("1700001"), city("1700002")];
        let (series, failures) = client.fetch_all(&cities).await;

        assert_eq!(series.len(), 1);
        assert!(series.contains_key("1700002"));
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].city_code, "1700001");
        assert_eq!(failures[0].error_kind, FailureKind::InsufficientHours);
    }

    #[test]
    fn batch_url_lists_coordinates_and_pins_the_timezone() {
        let client = ForecastClient::new("https://provider.example/v1/forecast");
        let url = client.batch_url(&[city("a"), city("b")]);
        assert!(url.contains("latitude=-10.2000,-10.2000"), "{url}");
        assert!(url.contains("longitude=-48.3000,-48.3000"), "{url}");
        assert!(url.contains("timezone=America%2FSao_Paulo"), "{url}");
        assert!(url.contains("et0_fao_evapotranspiration"), "{url}");
    }

    #[test]
    fn missing_required_column_is_rejected_per_city() {
        let mut block: HourlyBlock =
            serde_json::from_value(hourly_json(48)).unwrap();
        block.temperature_2m.clear();
        assert_eq!(build_series(block).unwrap_err(), FailureKind::MissingColumns);
    }

    #[test]
    fn null_cell_in_required_column_is_rejected() {
        let mut block: HourlyBlock = serde_json::from_value(hourly_json(48)).unwrap();
        block.wind_speed_10m[10] = None;
        assert_eq!(build_series(block).unwrap_err(), FailureKind::MissingColumns);
    }

    #[test]
    fn absent_humidity_is_tolerated_when_dew_point_is_complete() {
        let mut block: HourlyBlock = serde_json::from_value(hourly_json(48)).unwrap();
        block.relative_humidity_2m.clear();
        let series = build_series(block).unwrap();
        assert!(series.relative_humidity_pct.iter().all(|v| v.is_nan()));
        assert_eq!(series.dew_point_c[0], Some(17.0));
    }

    #[test]
    fn provider_eto_gaps_become_nan() {
        let mut block: HourlyBlock = serde_json::from_value(hourly_json(48)).unwrap();
        block.et0_fao_evapotranspiration[5] = None;
        let series = build_series(block).unwrap();
        assert!(series.provider_eto_mm_h[5].is_nan());
        assert_eq!(series.provider_eto_mm_h[4], 0.3);
    }

    #[test]
    fn provider_daily_sums_group_by_local_date() {
        let block: HourlyBlock = serde_json::from_value(hourly_json(48)).unwrap();
        let series = build_series(block).unwrap();
        let daily = series.provider_eto_daily();
        assert_eq!(daily.len(), 2);
        assert!((daily[0].1 - 24.0 * 0.3).abs() < 1e-9);
        assert_eq!(daily[0].0.succ_opt().unwrap(), daily[1].0);
    }
}
