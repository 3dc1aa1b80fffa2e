//! Prediction record — the append-only output of the pipeline.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::ids::{EnsembleVersion, FeatureSetVersion, ModelVersion};
use super::quarter::QuarterKey;
use crate::model::ModelFamily;

/// Symmetric or asymmetric uncertainty band around a point estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub lower: f64,
    pub upper: f64,
}

impl Interval {
    pub fn around(point: f64, half_width: f64) -> Self {
        let half_width = half_width.abs();
        Self {
            lower: point - half_width,
            upper: point + half_width,
        }
    }

    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }
}

/// One base model's contribution to a blended forecast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberEstimate {
    pub family: ModelFamily,
    pub version: ModelVersion,
    pub point: f64,
    /// Price-space variance, when the family produces one.
    pub variance: Option<f64>,
}

/// A forecast for the price at the end of `key`'s quarter.
///
/// Never mutated once recorded; a newer `generated_at` supersedes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Target quarter (the quarter whose closing price is forecast).
    pub key: QuarterKey,
    pub point_estimate: f64,
    pub interval: Interval,
    pub ensemble_version: EnsembleVersion,
    pub feature_set: FeatureSetVersion,
    pub generated_at: NaiveDateTime,
    /// Last price known when the forecast was issued.
    pub previous_actual: f64,
    #[serde(default)]
    pub members: Vec<MemberEstimate>,
    /// 0–100; narrower relative intervals score higher.
    pub confidence_score: f64,
    /// Forecast move vs. `previous_actual`, in percent.
    pub change_pct: f64,
}

impl Prediction {
    pub fn ticker(&self) -> &str {
        &self.key.ticker
    }

    /// Absolute percentage error against a realised price; `None` when the
    /// realised price is zero.
    pub fn error_pct(&self, actual: f64) -> Option<f64> {
        if actual == 0.0 {
            return None;
        }
        Some((actual - self.point_estimate).abs() / actual.abs() * 100.0)
    }
}

/// Confidence score from the relative interval width: a band as wide as the
/// price itself scores 0, a zero-width band scores 100.
pub fn confidence_score(point: f64, interval: &Interval) -> f64 {
    if point == 0.0 || !point.is_finite() {
        return 0.0;
    }
    let relative = interval.width() / point.abs();
    (100.0 * (1.0 - relative)).clamp(0.0, 100.0)
}

pub fn change_pct(point: f64, previous: f64) -> f64 {
    if previous == 0.0 {
        return 0.0;
    }
    (point - previous) / previous * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_around_is_symmetric() {
        let i = Interval::around(100.0, -5.0);
        assert_eq!(i.lower, 95.0);
        assert_eq!(i.upper, 105.0);
        assert!(i.contains(100.0));
        assert!(!i.contains(106.0));
    }

    #[test]
    fn confidence_clamps() {
        assert_eq!(confidence_score(100.0, &Interval::around(100.0, 0.0)), 100.0);
        assert_eq!(confidence_score(100.0, &Interval::around(100.0, 80.0)), 0.0);
        let mid = confidence_score(100.0, &Interval::around(100.0, 10.0));
        assert!((mid - 80.0).abs() < 1e-9);
    }

    #[test]
    fn change_pct_handles_zero_previous() {
        assert_eq!(change_pct(105.0, 100.0), 5.0);
        assert_eq!(change_pct(105.0, 0.0), 0.0);
    }
}
