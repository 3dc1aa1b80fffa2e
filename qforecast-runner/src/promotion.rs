//! Promotion gate — the evaluation thresholds a candidate must meet to serve.
//!
//! The gate is the only path into the Prediction Store's promoted pointer. A
//! failing candidate is not deleted; its artifacts and reports stay on disk for
//! analysis and the previously promoted release keeps serving.

use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use qforecast_core::domain::EnsembleVersion;

use crate::report::{EvaluationReport, Subject};

// ─── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionConfig {
    /// MAPE ceiling as a fraction (strictly below passes).
    pub max_mape: f64,
    /// Directional accuracy floor (strictly above passes).
    pub min_directional_accuracy: f64,
    /// Minimum scored rows behind the aggregate report.
    pub min_samples: usize,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            max_mape: 0.08,
            min_directional_accuracy: 0.55,
            min_samples: 8,
        }
    }
}

impl PromotionConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.max_mape.is_finite() && self.max_mape > 0.0) {
            return Err(format!("promotion.max_mape must be positive, got {}", self.max_mape));
        }
        if !(0.0..1.0).contains(&self.min_directional_accuracy) {
            return Err(format!(
                "promotion.min_directional_accuracy must be within [0, 1), got {}",
                self.min_directional_accuracy
            ));
        }
        Ok(())
    }
}

// ─── Gate ────────────────────────────────────────────────────────────

/// One unmet threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum GateViolation {
    MapeTooHigh { mape: f64, ceiling: f64 },
    DirectionTooLow { accuracy: f64, floor: f64 },
    TooFewSamples { samples: usize, min: usize },
    MetricUndefined { metric: String },
    NotAggregate,
}

impl fmt::Display for GateViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MapeTooHigh { mape, ceiling } => {
                write!(f, "MAPE {:.2}% ≥ ceiling {:.2}%", mape * 100.0, ceiling * 100.0)
            }
            Self::DirectionTooLow { accuracy, floor } => write!(
                f,
                "directional accuracy {:.1}% ≤ floor {:.1}%",
                accuracy * 100.0,
                floor * 100.0
            ),
            Self::TooFewSamples { samples, min } => write!(f, "{samples} scored rows < {min}"),
            Self::MetricUndefined { metric } => write!(f, "{metric} undefined"),
            Self::NotAggregate => f.write_str("report is not an aggregate"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("promotion blocked for {subject} {version}: {}", join_reasons(.reasons))]
pub struct PromotionGateFailure {
    pub subject: Subject,
    pub version: String,
    pub reasons: Vec<GateViolation>,
}

fn join_reasons(reasons: &[GateViolation]) -> String {
    reasons
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// One gate decision, as written to the promotion audit journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionRecord {
    pub candidate: EnsembleVersion,
    pub report_version: String,
    pub passed: bool,
    #[serde(default)]
    pub reasons: Vec<GateViolation>,
    pub decided_at: NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct PromotionGate {
    config: PromotionConfig,
}

impl PromotionGate {
    pub fn new(config: PromotionConfig) -> Self {
        Self { config }
    }

    /// Check an aggregate evaluation report against the thresholds.
    pub fn check(&self, report: &EvaluationReport) -> Result<(), PromotionGateFailure> {
        let mut reasons = Vec::new();
        if !report.is_aggregate() {
            reasons.push(GateViolation::NotAggregate);
        }
        if report.sample_count < self.config.min_samples {
            reasons.push(GateViolation::TooFewSamples {
                samples: report.sample_count,
                min: self.config.min_samples,
            });
        }
        match report.mape {
            Some(mape) if mape >= self.config.max_mape => reasons.push(GateViolation::MapeTooHigh {
                mape,
                ceiling: self.config.max_mape,
            }),
            Some(_) => {}
            None => reasons.push(GateViolation::MetricUndefined {
                metric: "MAPE".into(),
            }),
        }
        match report.directional_accuracy {
            Some(acc) if acc <= self.config.min_directional_accuracy => {
                reasons.push(GateViolation::DirectionTooLow {
                    accuracy: acc,
                    floor: self.config.min_directional_accuracy,
                })
            }
            Some(_) => {}
            None => reasons.push(GateViolation::MetricUndefined {
                metric: "directional accuracy".into(),
            }),
        }

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(PromotionGateFailure {
                subject: report.subject,
                version: report.version.clone(),
                reasons,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{FoldWindow, ReportScope};

    fn report(mape: Option<f64>, da: Option<f64>, n: usize) -> EvaluationReport {
        let q = "2023Q1".parse().unwrap();
        EvaluationReport {
            subject: Subject::Ensemble,
            version: "abc".into(),
            scope: ReportScope::Aggregate { folds: 3 },
            window: FoldWindow {
                train: None,
                test_first: q,
                test_last: q,
            },
            mape,
            directional_accuracy: da,
            sample_count: n,
            mape_count: n,
            directional_count: n,
            residual_band: None,
            generated_at: NaiveDateTime::default(),
        }
    }

    #[test]
    fn passing_report() {
        let gate = PromotionGate::new(PromotionConfig::default());
        assert!(gate.check(&report(Some(0.05), Some(0.6), 20)).is_ok());
    }

    #[test]
    fn thresholds_are_strict() {
        let gate = PromotionGate::new(PromotionConfig::default());
        let err = gate.check(&report(Some(0.08), Some(0.55), 20)).unwrap_err();
        assert_eq!(err.reasons.len(), 2);
        assert!(matches!(err.reasons[0], GateViolation::MapeTooHigh { .. }));
        assert!(matches!(err.reasons[1], GateViolation::DirectionTooLow { .. }));
        assert!(err.to_string().contains("ensemble"));
    }

    #[test]
    fn undefined_metrics_and_small_samples_fail() {
        let gate = PromotionGate::new(PromotionConfig::default());
        let err = gate.check(&report(None, Some(0.9), 2)).unwrap_err();
        assert!(err.reasons.contains(&GateViolation::TooFewSamples { samples: 2, min: 8 }));
        assert!(err
            .reasons
            .iter()
            .any(|r| matches!(r, GateViolation::MetricUndefined { .. })));
    }

    #[test]
    fn fold_reports_are_not_promotable() {
        let gate = PromotionGate::new(PromotionConfig::default());
        let mut r = report(Some(0.01), Some(0.9), 20);
        r.scope = ReportScope::Fold { index: 0 };
        assert!(gate.check(&r).is_err());
    }
}
