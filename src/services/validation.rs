//! Global agreement between computed and provider ETo.
//!
//! Pure function over the flattened (model, provider) daily pairs of every
//! successfully computed city-day. Diagnostic only: a poor score is logged
//! and recorded, never used to block persistence.

use crate::models::forecast::{Quality, ValidationMetrics};

// Classification thresholds (both criteria must hold).
const EXCELLENT_R2: f64 = 0.75;
const EXCELLENT_RMSE: f64 = 1.2;
const ACCEPTABLE_R2: f64 = 0.65;
const ACCEPTABLE_RMSE: f64 = 1.5;

/// Compute R², RMSE, bias and MAE over the finite (model, provider) pairs.
/// Non-finite pairs are skipped; with no usable samples every metric is
/// `None` and the run is classified BELOW_EXPECTED.
pub fn validate(model: &[f64], provider: &[f64]) -> ValidationMetrics {
    let pairs: Vec<(f64, f64)> = model
        .iter()
        .zip(provider)
        .filter(|(m, p)| m.is_finite() && p.is_finite())
        .map(|(&m, &p)| (m, p))
        .collect();

    let n = pairs.len();
    if n == 0 {
        return ValidationMetrics {
            r2: None,
            rmse_mm_day: None,
            bias_mm_day: None,
            mae_mm_day: None,
            n_samples: 0,
            quality: Quality::BelowExpected,
        };
    }
    let nf = n as f64;

    let bias = pairs.iter().map(|(m, p)| m - p).sum::<f64>() / nf;
    let mae = pairs.iter().map(|(m, p)| (m - p).abs()).sum::<f64>() / nf;
    let ss_err = pairs.iter().map(|(m, p)| (m - p) * (m - p)).sum::<f64>();
    let rmse = (ss_err / nf).sqrt();

    let provider_mean = pairs.iter().map(|(_, p)| p).sum::<f64>() / nf;
    let ss_tot = pairs
        .iter()
        .map(|(_, p)| (p - provider_mean) * (p - provider_mean))
        .sum::<f64>();
    // Constant provider series has no variance to explain; R² is undefined.
    let r2 = if ss_tot > 0.0 {
        Some(1.0 - ss_err / ss_tot)
    } else {
        None
    };

    ValidationMetrics {
        r2,
        rmse_mm_day: Some(rmse),
        bias_mm_day: Some(bias),
        mae_mm_day: Some(mae),
        n_samples: n,
        quality: classify(r2, Some(rmse)),
    }
}

/// Quality label from the R²/RMSE pair; anything undefined is BELOW_EXPECTED.
pub fn classify(r2: Option<f64>, rmse: Option<f64>) -> Quality {
    let (Some(r2), Some(rmse)) = (r2, rmse) else {
        return Quality::BelowExpected;
    };
    if r2 >= EXCELLENT_R2 && rmse <= EXCELLENT_RMSE {
        Quality::Excellent
    } else if r2 >= ACCEPTABLE_R2 && rmse <= ACCEPTABLE_RMSE {
        Quality::Acceptable
    } else {
        Quality::BelowExpected
    }
}
