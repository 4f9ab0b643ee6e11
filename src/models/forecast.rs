use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::America::Sao_Paulo;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::errors::{ComputeError, FailureKind};
use crate::models::city::StateCode;

/// Hot cache TTL and the spacing between scheduled runs.
pub const UPDATE_INTERVAL_HOURS: i64 = 6;

/// Hours every city must deliver per run (today + tomorrow, hourly).
pub const EXPECTED_HOURS: usize = 48;

/// Minimum hours the kernel will accept.
pub const MIN_KERNEL_HOURS: usize = 24;

// ─── Hourly observations (struct-of-arrays) ──────────────────────────────────

/// One city's hourly forecast for the run horizon, column-major so the
/// kernel can sweep whole arrays. All columns are index-aligned with
/// `time_utc`; `dew_point_c` keeps per-cell gaps, `provider_eto_mm_h`
/// carries NaN where the provider sent null.
#[derive(Debug, Clone, Default)]
pub struct HourlySeries {
    pub time_utc: Vec<DateTime<Utc>>,
    pub temp_c: Vec<f64>,
    pub relative_humidity_pct: Vec<f64>,
    pub wind_speed_10m_ms: Vec<f64>,
    pub shortwave_radiation_wm2: Vec<f64>,
    pub precipitation_mm: Vec<f64>,
    pub dew_point_c: Vec<Option<f64>>,
    pub provider_eto_mm_h: Vec<f64>,
}

impl HourlySeries {
    pub fn len(&self) -> usize {
        self.time_utc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time_utc.is_empty()
    }

    /// Check the kernel's input contract: aligned required columns and at
    /// least 24 hours.
    pub fn validate(&self) -> Result<usize, ComputeError> {
        let n = self.time_utc.len();
        let aligned = self.temp_c.len() == n
            && self.relative_humidity_pct.len() == n
            && self.wind_speed_10m_ms.len() == n
            && self.shortwave_radiation_wm2.len() == n
            && self.precipitation_mm.len() == n
            && self.dew_point_c.len() == n
            && self.provider_eto_mm_h.len() == n;
        if !aligned {
            return Err(ComputeError::MissingColumns);
        }
        if n < MIN_KERNEL_HOURS {
            return Err(ComputeError::InsufficientHours(n));
        }
        Ok(n)
    }

    /// Provider ETo summed per local calendar date, in chronological order.
    /// NaN cells poison their date's sum, which the validator later skips.
    pub fn provider_eto_daily(&self) -> Vec<(NaiveDate, f64)> {
        let mut sums: BTreeMap<NaiveDate, f64> = BTreeMap::new();
        for (ts, eto) in self.time_utc.iter().zip(&self.provider_eto_mm_h) {
            *sums.entry(local_date(*ts)).or_insert(0.0) += eto;
        }
        sums.into_iter().collect()
    }
}

/// Calendar date of a UTC instant in the region's shared civil time.
pub fn local_date(ts: DateTime<Utc>) -> NaiveDate {
    ts.with_timezone(&Sao_Paulo).date_naive()
}

// ─── Daily output ────────────────────────────────────────────────────────────

/// One city-day of aggregated forecast plus both ETo figures (mm/day).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DailyForecast {
    #[serde(rename = "date")]
    pub date_local: NaiveDate,
    pub t_max_c: f64,
    pub t_min_c: f64,
    pub t_mean_c: f64,
    pub rh_mean_pct: f64,
    pub ws_mean_ms: f64,
    pub radiation_sum_mj_m2: f64,
    pub precipitation_sum_mm: f64,
    /// Penman-Monteith result, summed over the day's hours
    pub eto_model_mm_day: f64,
    /// Provider's own ETo, summed over the same hours
    pub eto_provider_mm_day: f64,
}

/// Snapshot entry for one municipality: static reference data plus the
/// two forecast days.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CityForecast {
    pub city_name: String,
    pub state: StateCode,
    pub latitude: f64,
    pub longitude: f64,
    pub elevation_m: f64,
    pub days: Vec<DailyForecast>,
}

// ─── Validation outcome ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Quality {
    Excellent,
    Acceptable,
    BelowExpected,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Excellent => "EXCELLENT",
            Quality::Acceptable => "ACCEPTABLE",
            Quality::BelowExpected => "BELOW_EXPECTED",
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Global agreement between computed and provider ETo over every
/// successful (city, day) pair. Metrics are `None` when undefined
/// (no finite samples), which serializes to JSON null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ValidationMetrics {
    pub r2: Option<f64>,
    pub rmse_mm_day: Option<f64>,
    /// Mean of model − provider
    pub bias_mm_day: Option<f64>,
    pub mae_mm_day: Option<f64>,
    pub n_samples: usize,
    pub quality: Quality,
}

// ─── Run identity ────────────────────────────────────────────────────────────

/// Human-readable name of a scheduled instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum RunLabel {
    #[serde(rename = "00h UTC")]
    H00,
    #[serde(rename = "06h UTC")]
    H06,
    #[serde(rename = "12h UTC")]
    H12,
    #[serde(rename = "18h UTC")]
    H18,
}

impl RunLabel {
    /// Label for a fire time: delayed or manual fires map to the most
    /// recent scheduled instant.
    pub fn from_fired_at(fired_at: DateTime<Utc>) -> Self {
        match fired_at.hour() / 6 {
            0 => RunLabel::H00,
            1 => RunLabel::H06,
            2 => RunLabel::H12,
            _ => RunLabel::H18,
        }
    }

    /// The next scheduled UTC instant strictly after `now` (the 503 hint).
    pub fn next_instant(now: DateTime<Utc>) -> DateTime<Utc> {
        let base = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|d| Utc.from_utc_datetime(&d))
            .unwrap_or(now);
        let slot = (now.hour() / 6 + 1) as i64;
        base + Duration::hours(slot * UPDATE_INTERVAL_HOURS)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunLabel::H00 => "00h UTC",
            RunLabel::H06 => "06h UTC",
            RunLabel::H12 => "12h UTC",
            RunLabel::H18 => "18h UTC",
        }
    }
}

impl fmt::Display for RunLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot provenance served alongside the forecasts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RunMetadata {
    pub run_label: RunLabel,
    pub updated_at_utc: DateTime<Utc>,
    pub next_update_utc: DateTime<Utc>,
    pub n_cities_attempted: usize,
    pub n_cities_succeeded: usize,
    pub success_rate: f64,
    pub version: String,
}

impl RunMetadata {
    /// `next_update_utc` is always `updated_at + 6h` by construction.
    pub fn new(
        run_label: RunLabel,
        updated_at_utc: DateTime<Utc>,
        n_cities_attempted: usize,
        n_cities_succeeded: usize,
    ) -> Self {
        let success_rate = if n_cities_attempted > 0 {
            n_cities_succeeded as f64 / n_cities_attempted as f64
        } else {
            0.0
        };
        Self {
            run_label,
            updated_at_utc,
            next_update_utc: updated_at_utc + Duration::hours(UPDATE_INTERVAL_HOURS),
            n_cities_attempted,
            n_cities_succeeded,
            success_rate,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

// ─── Snapshot ────────────────────────────────────────────────────────────────

/// A run's complete output; replaces the previous snapshot wholesale.
/// `BTreeMap` keeps the MessagePack encoding deterministic for equal inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Snapshot {
    pub forecasts: BTreeMap<String, CityForecast>,
    pub validation: ValidationMetrics,
    pub metadata: RunMetadata,
}

// ─── Run report ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CityFailure {
    pub city_code: String,
    pub error_kind: FailureKind,
}

/// Structured return value of one orchestration run; logged and stored in
/// the audit row's `metadata_json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RunReport {
    pub success: bool,
    pub run_label: RunLabel,
    pub duration_s: f64,
    pub n_cities_attempted: usize,
    pub n_cities_succeeded: usize,
    pub quality: Quality,
    pub failures: Vec<CityFailure>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn run_label_floors_to_the_six_hour_grid() {
        let cases = [
            (0, RunLabel::H00),
            (3, RunLabel::H00),
            (6, RunLabel::H06),
            (11, RunLabel::H06),
            (12, RunLabel::H12),
            (17, RunLabel::H12),
            (18, RunLabel::H18),
            (23, RunLabel::H18),
        ];
        for (hour, expected) in cases {
            let fired = Utc.with_ymd_and_hms(2026, 8, 1, hour, 0, 30).unwrap();
            assert_eq!(RunLabel::from_fired_at(fired), expected, "hour {hour}");
        }
    }

    #[test]
    fn run_label_serializes_as_its_display_name() {
        assert_eq!(serde_json::to_string(&RunLabel::H06).unwrap(), "\"06h UTC\"");
    }

    #[test]
    fn next_instant_is_the_following_slot() {
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 13, 45, 0).unwrap();
        assert_eq!(
            RunLabel::next_instant(now),
            Utc.with_ymd_and_hms(2026, 8, 1, 18, 0, 0).unwrap()
        );
        // 18h rolls over to next-day 00h.
        let late = Utc.with_ymd_and_hms(2026, 8, 1, 19, 0, 1).unwrap();
        assert_eq!(
            RunLabel::next_instant(late),
            Utc.with_ymd_and_hms(2026, 8, 2, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn metadata_next_update_is_six_hours_out() {
        let at = Utc.with_ymd_and_hms(2026, 8, 1, 6, 0, 2).unwrap();
        let meta = RunMetadata::new(RunLabel::H06, at, 337, 287);
        assert_eq!(meta.next_update_utc - meta.updated_at_utc, Duration::hours(6));
        assert!((meta.success_rate - 287.0 / 337.0).abs() < 1e-12);
    }

    #[test]
    fn local_date_shifts_late_utc_hours_to_the_previous_civil_day() {
        // 02:00 UTC is 23:00 of the previous day in America/Sao_Paulo (UTC-3).
        let ts = Utc.with_ymd_and_hms(2026, 8, 2, 2, 0, 0).unwrap();
        assert_eq!(local_date(ts), NaiveDate::from_ymd_opt(2026, 8, 1).unwrap());
        let ts = Utc.with_ymd_and_hms(2026, 8, 2, 3, 0, 0).unwrap();
        assert_eq!(local_date(ts), NaiveDate::from_ymd_opt(2026, 8, 2).unwrap());
    }

    #[test]
    fn series_validation_flags_short_and_misaligned_input() {
        let mut series = HourlySeries::default();
        for h in 0..12 {
            series.time_utc.push(Utc.with_ymd_and_hms(2026, 8, 1, h, 0, 0).unwrap());
            series.temp_c.push(25.0);
            series.relative_humidity_pct.push(60.0);
            series.wind_speed_10m_ms.push(2.0);
            series.shortwave_radiation_wm2.push(500.0);
            series.precipitation_mm.push(0.0);
            series.dew_point_c.push(Some(18.0));
            series.provider_eto_mm_h.push(0.3);
        }
        assert_eq!(series.validate(), Err(ComputeError::InsufficientHours(12)));

        series.temp_c.pop();
        assert_eq!(series.validate(), Err(ComputeError::MissingColumns));
    }

    #[test]
    fn city_entry_json_shape_matches_the_read_contract() {
        let entry = CityForecast {
            city_name: "Balsas".into(),
            state: StateCode::MA,
            latitude: -7.53,
            longitude: -46.04,
            elevation_m: 280.0,
            days: vec![DailyForecast {
                date_local: NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(),
                t_max_c: 33.1,
                t_min_c: 19.4,
                t_mean_c: 26.0,
                rh_mean_pct: 48.0,
                ws_mean_ms: 2.7,
                radiation_sum_mj_m2: 21.4,
                precipitation_sum_mm: 0.0,
                eto_model_mm_day: 5.1,
                eto_provider_mm_day: 4.9,
            }],
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["state"], "MA");
        assert_eq!(json["days"][0]["date"], "2026-08-01");
        assert!(json["days"][0].get("eto_provider_mm_day").is_some());
    }
}
