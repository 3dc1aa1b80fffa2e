//! Forecast metrics — pure functions over scored rows.
//!
//! Every metric is a pure function: scored rows in, scalar out. A metric with no
//! defined rows is `None`, never zero.

use serde::{Deserialize, Serialize};

use qforecast_core::domain::QuarterKey;

/// One out-of-sample forecast and its realised outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRow {
    /// Target quarter.
    pub key: QuarterKey,
    pub predicted: f64,
    pub actual: f64,
    /// Last observed price at the forecast origin.
    pub previous_actual: Option<f64>,
}

/// Aggregate accuracy over a set of scored rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastMetrics {
    pub mape: Option<f64>,
    /// Rows that entered MAPE (actual ≠ 0).
    pub mape_count: usize,
    pub directional_accuracy: Option<f64>,
    /// Rows that entered directional accuracy (previous actual known).
    pub directional_count: usize,
    pub sample_count: usize,
    /// 90th percentile of |actual − predicted| / |predicted|.
    pub residual_band: Option<f64>,
}

impl ForecastMetrics {
    pub fn compute(rows: &[ScoredRow]) -> Self {
        let (mape, mape_count) = mape(rows);
        let (directional_accuracy, directional_count) = directional_accuracy(rows);
        Self {
            mape,
            mape_count,
            directional_accuracy,
            directional_count,
            sample_count: rows.len(),
            residual_band: residual_band(rows, RESIDUAL_QUANTILE),
        }
    }
}

pub const RESIDUAL_QUANTILE: f64 = 0.9;

// ─── Individual metric functions ────────────────────────────────────

/// Mean absolute percentage error as a fraction, over rows with a non-zero
/// actual. Returns the value and the number of rows it covers.
pub fn mape(rows: &[ScoredRow]) -> (Option<f64>, usize) {
    let errors: Vec<f64> = rows
        .iter()
        .filter(|r| r.actual != 0.0)
        .map(|r| (r.actual - r.predicted).abs() / r.actual.abs())
        .collect();
    (mean(&errors), errors.len())
}

/// Share of rows with a known previous actual whose predicted move has the same
/// sign as the realised move. A flat move has sign zero and only matches a flat
/// prediction.
pub fn directional_accuracy(rows: &[ScoredRow]) -> (Option<f64>, usize) {
    let mut scored = 0usize;
    let mut hits = 0usize;
    for row in rows {
        let Some(previous) = row.previous_actual else {
            continue;
        };
        scored += 1;
        if sign(row.predicted - previous) == sign(row.actual - previous) {
            hits += 1;
        }
    }
    if scored == 0 {
        (None, 0)
    } else {
        (Some(hits as f64 / scored as f64), scored)
    }
}

/// Quantile of relative absolute residuals `|actual − predicted| / |predicted|`.
pub fn residual_band(rows: &[ScoredRow], quantile: f64) -> Option<f64> {
    let mut residuals: Vec<f64> = rows
        .iter()
        .filter(|r| r.predicted != 0.0)
        .map(|r| (r.actual - r.predicted).abs() / r.predicted.abs())
        .filter(|r| r.is_finite())
        .collect();
    if residuals.is_empty() {
        return None;
    }
    residuals.sort_by(f64::total_cmp);
    let idx = ((residuals.len() - 1) as f64 * quantile.clamp(0.0, 1.0)).round() as usize;
    Some(residuals[idx])
}

fn sign(x: f64) -> i8 {
    if x > 0.0 {
        1
    } else if x < 0.0 {
        -1
    } else {
        0
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}
