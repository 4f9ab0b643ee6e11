/// ============================================================
///  FAO-56 Penman-Monteith Hourly ETo Kernel
///
///  Algorithm pipeline (over the hour axis of one city):
///   1. Wind profile 10 m → 2 m (logarithmic adjustment)
///   2. Atmospheric pressure & psychrometric constant from elevation
///   3. Vapor pressure terms – es, ea (dew point, gap-filled T − 5), VPD
///   4. Slope of the saturation vapor pressure curve
///   5. Extraterrestrial radiation Ra – declination, inverse relative
///      Earth-Sun distance, seasonal correction, hour angle
///   6. Net radiation – albedo 0.23 shortwave + FAO-56 hourly longwave
///   7. Soil heat flux – zero by day, 0.5·Rn at night
///   8. Day/night coefficient switch – Cn/Cd (ASCE-EWRI standardized)
///   9. Penman-Monteith hourly ETo, clamped to ≥ 0
///  10. Daily aggregation by local calendar date
///
///  Stages 1–4 and 6–9 are whole-array passes; only stage 5 walks the
///  hours one by one because of the datetime dependency.
/// ============================================================
use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Timelike};
use chrono_tz::America::Sao_Paulo;
use chrono_tz::Tz;
use std::f64::consts::PI;

use crate::errors::ComputeError;
use crate::models::forecast::{local_date, DailyForecast, HourlySeries};

// ─── Physical constants ──────────────────────────────────────
const DEG: f64 = PI / 180.0;
/// Solar constant (MJ m⁻² min⁻¹)
const GSC: f64 = 0.0820;
/// Stefan-Boltzmann constant on an hourly basis (MJ m⁻² h⁻¹ K⁻⁴)
const SIGMA_HOURLY: f64 = 2.043e-10;
/// Reference grass albedo
const ALBEDO: f64 = 0.23;
/// W/m² sustained for one hour → MJ/m²
const W_TO_MJ_H: f64 = 3600.0 / 1.0e6;
/// Gap fill for missing dew point cells: Td = T − 5
const DEW_POINT_GAP_C: f64 = 5.0;

// FAO-56 standardized hourly coefficients for the reference grass surface.
// The nighttime pair is mandatory: running Cn=37/Cd=0.24 around the clock
// inflates nighttime ETo and breaks the daily agreement with the provider.
const CN_DAY: f64 = 37.0;
const CD_DAY: f64 = 0.24;
const CN_NIGHT: f64 = 6.0;
const CD_NIGHT: f64 = 0.96;

// ─── Public output ───────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct KernelOutput {
    /// Hourly reference ET (mm/h), aligned with the input hours
    pub eto_hourly_mm_h: Vec<f64>,
    /// Daily aggregation over the first two local calendar dates
    pub days: Vec<DailyForecast>,
    /// Hours where the equation produced a non-finite value (substituted 0)
    pub non_finite_hours: usize,
}

/// Main entry point – compute hourly + daily ETo for one city.
///
/// * `series`       – hourly observations (≥ 24 aligned hours)
/// * `latitude_deg` – station latitude (−90 … +90)
/// * `elevation_m`  – station elevation above sea level
pub fn compute(
    series: &HourlySeries,
    latitude_deg: f64,
    elevation_m: f64,
) -> Result<KernelOutput, ComputeError> {
    series.validate()?;
    let lat_rad = latitude_deg * DEG;

    // ── 1. Wind 10 m → 2 m ────────────────────────────────────
    // u2 = u10 · 4.87 / ln(67.8·10 − 5.42); calm sensors report 0.5 m/s
    let wind_factor = 4.87 / (67.8 * 10.0 - 5.42_f64).ln();
    let u2: Vec<f64> = series
        .wind_speed_10m_ms
        .iter()
        .map(|&u10| if u10 <= 0.0 { 0.5 } else { u10 * wind_factor })
        .collect();

    // ── 2. Pressure & psychrometric constant (per-station scalars) ──
    let pressure_kpa = 101.3 * ((293.0 - 0.0065 * elevation_m) / 293.0).powf(5.26);
    let gamma = 0.000665 * pressure_kpa;

    // ── 3. Vapor pressure terms ───────────────────────────────
    let es: Vec<f64> = series.temp_c.iter().map(|&t| saturation_vp(t)).collect();
    let ea: Vec<f64> = series
        .temp_c
        .iter()
        .zip(&series.dew_point_c)
        .map(|(&t, dew)| saturation_vp(dew.unwrap_or(t - DEW_POINT_GAP_C)))
        .collect();
    let vpd: Vec<f64> = es
        .iter()
        .zip(&ea)
        .map(|(&es, &ea)| (es - ea).max(0.0))
        .collect();

    // ── 4. Slope of the vapor pressure curve ──────────────────
    let delta: Vec<f64> = series
        .temp_c
        .iter()
        .zip(&es)
        .map(|(&t, &es)| 4098.0 * es / ((t + 237.3) * (t + 237.3)))
        .collect();

    // ── 5. Extraterrestrial radiation (the per-hour stage) ────
    let ra: Vec<f64> = series
        .time_utc
        .iter()
        .map(|ts| hourly_ra(lat_rad, ts.with_timezone(&Sao_Paulo)))
        .collect();

    // ── 6. Net radiation ──────────────────────────────────────
    let rs_mj: Vec<f64> = series
        .shortwave_radiation_wm2
        .iter()
        .map(|&w| (w * W_TO_MJ_H).max(0.0))
        .collect();
    let rso_factor = 0.75 + 2e-5 * elevation_m;
    // Relative shortwave (cloudiness) ratio; FAO-56 leaves the nighttime
    // value open, the standard 0.8 substitute is used where Rso = 0.
    let sky_ratio: Vec<f64> = rs_mj
        .iter()
        .zip(&ra)
        .map(|(&rs, &ra)| {
            let rso = rso_factor * ra;
            if rso > 1e-9 { (rs / rso).clamp(0.3, 1.0) } else { 0.8 }
        })
        .collect();
    let rn: Vec<f64> = series
        .temp_c
        .iter()
        .zip(&ea)
        .zip(&rs_mj)
        .zip(&sky_ratio)
        .map(|(((&t, &ea), &rs), &ratio)| {
            let tk = t + 273.16;
            let rnl = SIGMA_HOURLY
                * tk.powi(4)
                * (0.34 - 0.14 * ea.max(0.0).sqrt())
                * (1.35 * ratio - 0.35);
            (1.0 - ALBEDO) * rs - rnl
        })
        .collect();

    // ── 7./8. Soil heat flux & day/night coefficients ─────────
    let is_night: Vec<bool> = series
        .shortwave_radiation_wm2
        .iter()
        .map(|&w| w == 0.0)
        .collect();
    let g: Vec<f64> = rn
        .iter()
        .zip(&is_night)
        .map(|(&rn, &night)| if night { 0.5 * rn } else { 0.0 })
        .collect();

    // ── 9. Penman-Monteith hourly ─────────────────────────────
    let radiative: Vec<f64> = delta
        .iter()
        .zip(&rn)
        .zip(&g)
        .map(|((&d, &rn), &g)| 0.408 * d * (rn - g))
        .collect();
    let aerodynamic: Vec<f64> = series
        .temp_c
        .iter()
        .zip(&u2)
        .zip(&vpd)
        .zip(&is_night)
        .map(|(((&t, &u2), &vpd), &night)| {
            let cn = if night { CN_NIGHT } else { CN_DAY };
            gamma * (cn / (t + 273.0)) * u2 * vpd
        })
        .collect();
    let denominator: Vec<f64> = delta
        .iter()
        .zip(&u2)
        .zip(&is_night)
        .map(|((&d, &u2), &night)| {
            let cd = if night { CD_NIGHT } else { CD_DAY };
            d + gamma * (1.0 + cd * u2)
        })
        .collect();

    let mut non_finite_hours = 0usize;
    let eto_hourly_mm_h: Vec<f64> = radiative
        .iter()
        .zip(&aerodynamic)
        .zip(&denominator)
        .map(|((&rad, &aero), &den)| {
            if den <= 0.0 {
                return 0.0;
            }
            let eto = (rad + aero) / den;
            if eto.is_finite() {
                eto.max(0.0)
            } else {
                non_finite_hours += 1;
                0.0
            }
        })
        .collect();

    // ── 10. Daily aggregation ─────────────────────────────────
    let days = aggregate_daily(series, &eto_hourly_mm_h);

    Ok(KernelOutput {
        eto_hourly_mm_h,
        days,
        non_finite_hours,
    })
}

/// Tetens form: es(T) in kPa for T in °C.
#[inline]
fn saturation_vp(t: f64) -> f64 {
    0.6108 * (17.27 * t / (t + 237.3)).exp()
}

// ─── Extraterrestrial radiation ──────────────────────────────
/// Ra (MJ m⁻² h⁻¹) for the hour starting at `local`, from latitude,
/// day-of-year and the hour-angle pair at the period boundaries.
/// Solar time is taken as local clock time plus the seasonal correction;
/// the region's longitude band sits close enough to the zone meridian
/// that the meridian offset is dropped.
fn hourly_ra(lat_rad: f64, local: DateTime<Tz>) -> f64 {
    let doy = local.ordinal() as f64;
    let t_mid = local.hour() as f64 + local.minute() as f64 / 60.0 + 0.5;

    // Inverse relative Earth-Sun distance and solar declination
    let dr = 1.0 + 0.033 * (2.0 * PI * doy / 365.0).cos();
    let decl = 0.409 * (2.0 * PI * doy / 365.0 - 1.39).sin();

    // Seasonal correction for solar time (hours)
    let b = 2.0 * PI * (doy - 81.0) / 364.0;
    let sc = 0.1645 * (2.0 * b).sin() - 0.1255 * b.cos() - 0.025 * b.sin();

    // Hour angles at the period boundaries, clamped to sunrise/sunset
    let omega_mid = PI / 12.0 * ((t_mid + sc) - 12.0);
    let half_period = PI / 24.0;
    let omega_s = (-lat_rad.tan() * decl.tan()).clamp(-1.0, 1.0).acos();
    let omega_1 = (omega_mid - half_period).clamp(-omega_s, omega_s);
    let omega_2 = (omega_mid + half_period).clamp(-omega_s, omega_s);
    if omega_2 <= omega_1 {
        return 0.0;
    }

    let ra = 12.0 * 60.0 / PI
        * GSC
        * dr
        * ((omega_2 - omega_1) * lat_rad.sin() * decl.sin()
            + lat_rad.cos() * decl.cos() * (omega_2.sin() - omega_1.sin()));
    ra.max(0.0)
}

// ─── Daily aggregation ───────────────────────────────────────
/// Group hours by local calendar date and reduce to the daily record.
/// Keeps the first two dates in chronological order (today + tomorrow).
fn aggregate_daily(series: &HourlySeries, eto_hourly: &[f64]) -> Vec<DailyForecast> {
    let mut by_date: BTreeMap<chrono::NaiveDate, Vec<usize>> = BTreeMap::new();
    for (i, ts) in series.time_utc.iter().enumerate() {
        by_date.entry(local_date(*ts)).or_default().push(i);
    }

    by_date
        .into_iter()
        .take(2)
        .map(|(date, idx)| {
            let n = idx.len() as f64;
            let fold = |col: &[f64], f: fn(f64, f64) -> f64, init: f64| {
                idx.iter().map(|&i| col[i]).fold(init, f)
            };
            let sum = |col: &[f64]| idx.iter().map(|&i| col[i]).sum::<f64>();

            DailyForecast {
                date_local: date,
                t_max_c: fold(&series.temp_c, f64::max, f64::NEG_INFINITY),
                t_min_c: fold(&series.temp_c, f64::min, f64::INFINITY),
                t_mean_c: sum(&series.temp_c) / n,
                rh_mean_pct: sum(&series.relative_humidity_pct) / n,
                ws_mean_ms: sum(&series.wind_speed_10m_ms) / n,
                radiation_sum_mj_m2: sum(&series.shortwave_radiation_wm2) * W_TO_MJ_H,
                precipitation_sum_mm: sum(&series.precipitation_mm),
                eto_model_mm_day: sum(eto_hourly),
                eto_provider_mm_day: sum(&series.provider_eto_mm_h),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};

    const BALSAS_LAT: f64 = -7.53;
    const BALSAS_ELEV: f64 = 280.0;

    /// 48 hours starting at local midnight in America/Sao_Paulo, with a
    /// diurnal temperature/radiation cycle (daylight 06:00–17:59 local).
    fn synthetic_series(hours: usize) -> HourlySeries {
        let start = Sao_Paulo
            .with_ymd_and_hms(2026, 8, 1, 0, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let mut s = HourlySeries::default();
        for h in 0..hours {
            let local_hour = h % 24;
            let day_phase = (local_hour as f64 - 6.0) / 12.0; // 0 at 06h, 1 at 18h
            let radiation = if (6..18).contains(&local_hour) {
                850.0 * (PI * day_phase).sin().max(0.0)
            } else {
                0.0
            };
            s.time_utc.push(start + chrono::Duration::hours(h as i64));
            s.temp_c.push(22.0 + 8.0 * (PI * day_phase).sin().max(-0.4));
            s.relative_humidity_pct.push(65.0 - 20.0 * (PI * day_phase).sin().max(0.0));
            s.wind_speed_10m_ms.push(1.5 + (h % 5) as f64 * 0.4);
            s.shortwave_radiation_wm2.push(radiation);
            s.precipitation_mm.push(if h == 30 { 2.5 } else { 0.0 });
            s.dew_point_c.push(Some(16.0));
            s.provider_eto_mm_h.push(if radiation > 0.0 { 0.45 } else { 0.01 });
        }
        s
    }

    /// Straightforward per-hour re-implementation of the same equations,
    /// used as the oracle for the whole-array version.
    fn reference_eto(series: &HourlySeries, lat_deg: f64, elev_m: f64) -> Vec<f64> {
        let lat = lat_deg * DEG;
        let p = 101.3 * ((293.0 - 0.0065 * elev_m) / 293.0).powf(5.26);
        let gamma = 0.000665 * p;
        let wind_factor = 4.87 / (67.8 * 10.0 - 5.42_f64).ln();

        (0..series.len())
            .map(|i| {
                let t = series.temp_c[i];
                let u10 = series.wind_speed_10m_ms[i];
                let u2 = if u10 <= 0.0 { 0.5 } else { u10 * wind_factor };
                let es = saturation_vp(t);
                let td = series.dew_point_c[i].unwrap_or(t - DEW_POINT_GAP_C);
                let ea = saturation_vp(td);
                let vpd = (es - ea).max(0.0);
                let delta = 4098.0 * es / ((t + 237.3) * (t + 237.3));

                let rs = (series.shortwave_radiation_wm2[i] * W_TO_MJ_H).max(0.0);
                let ra = hourly_ra(lat, series.time_utc[i].with_timezone(&Sao_Paulo));
                let rso = (0.75 + 2e-5 * elev_m) * ra;
                let ratio = if rso > 1e-9 { (rs / rso).clamp(0.3, 1.0) } else { 0.8 };
                let tk = t + 273.16;
                let rnl =
                    SIGMA_HOURLY * tk.powi(4) * (0.34 - 0.14 * ea.sqrt()) * (1.35 * ratio - 0.35);
                let rn = (1.0 - ALBEDO) * rs - rnl;

                let night = series.shortwave_radiation_wm2[i] == 0.0;
                let g = if night { 0.5 * rn } else { 0.0 };
                let (cn, cd) = if night { (CN_NIGHT, CD_NIGHT) } else { (CN_DAY, CD_DAY) };

                let num = 0.408 * delta * (rn - g) + gamma * (cn / (t + 273.0)) * u2 * vpd;
                let den = delta + gamma * (1.0 + cd * u2);
                if den <= 0.0 { 0.0 } else { (num / den).max(0.0) }
            })
            .collect()
    }

    #[test]
    fn vectorized_matches_per_hour_reference() {
        let series = synthetic_series(48);
        let out = compute(&series, BALSAS_LAT, BALSAS_ELEV).unwrap();
        let reference = reference_eto(&series, BALSAS_LAT, BALSAS_ELEV);

        for (h, (&v, &r)) in out.eto_hourly_mm_h.iter().zip(&reference).enumerate() {
            assert!(
                (v - r).abs() <= 0.01,
                "hour {h}: vectorized {v:.5} vs reference {r:.5}"
            );
        }
        let daily_ref: f64 = reference[..24].iter().sum();
        let daily_vec = out.days[0].eto_model_mm_day;
        assert!(
            (daily_vec - daily_ref).abs() <= 0.05,
            "daily sums diverge: {daily_vec:.4} vs {daily_ref:.4}"
        );
    }

    #[test]
    fn night_hours_emit_small_non_negative_values() {
        let series = synthetic_series(48);
        let out = compute(&series, BALSAS_LAT, BALSAS_ELEV).unwrap();
        for (i, &rad) in series.shortwave_radiation_wm2.iter().enumerate() {
            if rad == 0.0 {
                let eto = out.eto_hourly_mm_h[i];
                assert!(eto >= 0.0, "hour {i} negative: {eto}");
                assert!(eto < 0.1, "hour {i} too large for night: {eto}");
            }
        }
    }

    #[test]
    fn daytime_eto_dominates_the_daily_sum() {
        let series = synthetic_series(48);
        let out = compute(&series, BALSAS_LAT, BALSAS_ELEV).unwrap();
        let day = out.days[0].eto_model_mm_day;
        assert!(day > 2.0 && day < 10.0, "implausible dry-season daily ETo: {day:.2}");
    }

    #[test]
    fn missing_dew_point_cells_fall_back_to_t_minus_5() {
        let mut gap = synthetic_series(48);
        for cell in gap.dew_point_c.iter_mut() {
            *cell = None;
        }
        let mut explicit = synthetic_series(48);
        for (cell, &t) in explicit.dew_point_c.iter_mut().zip(&explicit.temp_c.clone()) {
            *cell = Some(t - DEW_POINT_GAP_C);
        }

        let out_gap = compute(&gap, BALSAS_LAT, BALSAS_ELEV).unwrap();
        let out_explicit = compute(&explicit, BALSAS_LAT, BALSAS_ELEV).unwrap();
        assert_eq!(out_gap.eto_hourly_mm_h, out_explicit.eto_hourly_mm_h);
        assert_eq!(out_gap.non_finite_hours, 0);
    }

    #[test]
    fn fewer_than_24_hours_is_rejected() {
        let series = synthetic_series(12);
        assert_eq!(
            compute(&series, BALSAS_LAT, BALSAS_ELEV).unwrap_err(),
            ComputeError::InsufficientHours(12)
        );
    }

    #[test]
    fn daily_aggregation_produces_two_consecutive_local_dates() {
        let series = synthetic_series(48);
        let out = compute(&series, BALSAS_LAT, BALSAS_ELEV).unwrap();
        assert_eq!(out.days.len(), 2);
        assert_eq!(out.days[0].date_local, NaiveDate::from_ymd_opt(2026, 8, 1).unwrap());
        assert_eq!(
            out.days[1].date_local,
            out.days[0].date_local.succ_opt().unwrap()
        );

        let day = &out.days[0];
        let expected_max = series.temp_c[..24].iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let expected_min = series.temp_c[..24].iter().cloned().fold(f64::INFINITY, f64::min);
        assert_eq!(day.t_max_c, expected_max);
        assert_eq!(day.t_min_c, expected_min);
        let expected_rad: f64 =
            series.shortwave_radiation_wm2[..24].iter().sum::<f64>() * W_TO_MJ_H;
        assert!((day.radiation_sum_mj_m2 - expected_rad).abs() < 1e-9);
        assert_eq!(out.days[1].precipitation_sum_mm, 2.5);
    }

    #[test]
    fn provider_daily_sum_covers_the_same_hours() {
        let series = synthetic_series(48);
        let out = compute(&series, BALSAS_LAT, BALSAS_ELEV).unwrap();
        let expected: f64 = series.provider_eto_mm_h[..24].iter().sum();
        assert!((out.days[0].eto_provider_mm_day - expected).abs() < 1e-9);
    }

    #[test]
    fn outputs_are_finite_even_for_extreme_inputs() {
        let mut series = synthetic_series(48);
        for t in series.temp_c.iter_mut() {
            *t = 48.0;
        }
        for w in series.wind_speed_10m_ms.iter_mut() {
            *w = 0.0; // calm substitution path
        }
        let out = compute(&series, BALSAS_LAT, BALSAS_ELEV).unwrap();
        assert!(out.eto_hourly_mm_h.iter().all(|v| v.is_finite() && *v >= 0.0));
    }

    #[test]
    fn ra_is_zero_at_night_and_positive_at_midday() {
        let midnight = Sao_Paulo.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap();
        let noon = Sao_Paulo.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        assert_eq!(hourly_ra(BALSAS_LAT * DEG, midnight), 0.0);
        let ra_noon = hourly_ra(BALSAS_LAT * DEG, noon);
        // Midday extraterrestrial radiation in the tropics: 3–5 MJ/m²/h.
        assert!(ra_noon > 2.5 && ra_noon < 5.5, "Ra at noon: {ra_noon:.3}");
    }
}
