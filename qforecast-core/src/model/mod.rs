//! Base forecaster families.
//!
//! Every family implements the same capability set (`Forecaster`): fit on
//! standardised feature windows against log-return targets, predict a point
//! estimate, and optionally a variance. `BaseModel` is the tagged union the rest of
//! the pipeline stores and dispatches on.
//!
//! A window is the ticker's feature rows ordered oldest → newest, ending at the
//! quarter being predicted from. Families that do not look at history (the tree
//! ensemble) use only the last row.

pub mod artifact;
pub mod attention;
pub mod linalg;
pub mod scaler;
pub mod sequence;
pub mod tree;

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{FiscalQuarter, QuarterKey};

pub use artifact::{ArtifactSpec, Estimate, ModelArtifact, TrainingWindow};
pub use attention::{AttentionModel, AttentionParams};
pub use scaler::Standardizer;
pub use sequence::{SequenceModel, SequenceParams};
pub use tree::{TreeEnsemble, TreeParams};

// ─── Families and configuration ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    TreeEnsemble,
    Sequence,
    Attention,
}

impl ModelFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TreeEnsemble => "tree_ensemble",
            Self::Sequence => "sequence",
            Self::Attention => "attention",
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hyperparameters, enumerated per family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum ModelConfig {
    TreeEnsemble(TreeParams),
    Sequence(SequenceParams),
    Attention(AttentionParams),
}

impl ModelConfig {
    pub fn family(&self) -> ModelFamily {
        match self {
            Self::TreeEnsemble(_) => ModelFamily::TreeEnsemble,
            Self::Sequence(_) => ModelFamily::Sequence,
            Self::Attention(_) => ModelFamily::Attention,
        }
    }

    /// Feature rows of history the family reads (window length).
    pub fn history_rows(&self) -> usize {
        match self {
            Self::TreeEnsemble(_) => 1,
            Self::Sequence(p) => p.sequence_length.max(1),
            Self::Attention(p) => p.horizons.iter().copied().max().unwrap_or(0) + 1,
        }
    }
}

// ─── Errors and fit context ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("{family}: {rows} training rows, need at least {min}")]
    InsufficientData {
        family: ModelFamily,
        rows: usize,
        min: usize,
    },

    #[error("{family} failed to converge: {detail}")]
    Convergence { family: ModelFamily, detail: String },

    #[error("{family} training exceeded its time budget after {elapsed_ms} ms")]
    Timeout { family: ModelFamily, elapsed_ms: u128 },

    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    #[error("{0} model used before fitting")]
    NotFitted(ModelFamily),

    #[error("artifact serialization failed: {0}")]
    Serialization(String),
}

/// Per-fit resource limits.
#[derive(Debug, Clone, Copy, Default)]
pub struct FitContext {
    started: Option<Instant>,
    deadline: Option<Instant>,
}

impl FitContext {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_budget(budget: std::time::Duration) -> Self {
        let now = Instant::now();
        Self {
            started: Some(now),
            deadline: now.checked_add(budget),
        }
    }

    /// `Err(Timeout)` once the deadline has passed. Families call this between
    /// boosting rounds / epochs.
    pub fn check(&self, family: ModelFamily) -> Result<(), ModelError> {
        match (self.started, self.deadline) {
            (Some(started), Some(deadline)) if Instant::now() > deadline => {
                Err(ModelError::Timeout {
                    family,
                    elapsed_ms: started.elapsed().as_millis(),
                })
            }
            _ => Ok(()),
        }
    }
}

// ─── Capability set ──────────────────────────────────────────────────

/// Common interface of all base model families. Windows are standardised,
/// dense, oldest row first.
pub trait Forecaster {
    fn family(&self) -> ModelFamily;

    fn fit(
        &mut self,
        windows: &[Vec<Vec<f64>>],
        targets: &[f64],
        ctx: &FitContext,
    ) -> Result<(), ModelError>;

    fn predict(&self, window: &[Vec<f64>]) -> Result<f64, ModelError>;

    /// Point estimate plus a variance when the family can produce one.
    fn predict_with_variance(&self, window: &[Vec<f64>]) -> Result<(f64, Option<f64>), ModelError> {
        Ok((self.predict(window)?, None))
    }
}

/// Tagged union over the concrete families.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum BaseModel {
    TreeEnsemble(TreeEnsemble),
    Sequence(SequenceModel),
    Attention(AttentionModel),
}

impl BaseModel {
    pub fn from_config(config: &ModelConfig) -> Self {
        match config {
            ModelConfig::TreeEnsemble(p) => Self::TreeEnsemble(TreeEnsemble::new(p.clone())),
            ModelConfig::Sequence(p) => Self::Sequence(SequenceModel::new(p.clone())),
            ModelConfig::Attention(p) => Self::Attention(AttentionModel::new(p.clone())),
        }
    }

    fn inner(&self) -> &dyn Forecaster {
        match self {
            Self::TreeEnsemble(m) => m,
            Self::Sequence(m) => m,
            Self::Attention(m) => m,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Forecaster {
        match self {
            Self::TreeEnsemble(m) => m,
            Self::Sequence(m) => m,
            Self::Attention(m) => m,
        }
    }
}

impl Forecaster for BaseModel {
    fn family(&self) -> ModelFamily {
        self.inner().family()
    }

    fn fit(
        &mut self,
        windows: &[Vec<Vec<f64>>],
        targets: &[f64],
        ctx: &FitContext,
    ) -> Result<(), ModelError> {
        self.inner_mut().fit(windows, targets, ctx)
    }

    fn predict(&self, window: &[Vec<f64>]) -> Result<f64, ModelError> {
        self.inner().predict(window)
    }

    fn predict_with_variance(&self, window: &[Vec<f64>]) -> Result<(f64, Option<f64>), ModelError> {
        self.inner().predict_with_variance(window)
    }
}

/// Shared check that all windows and targets line up.
pub(crate) fn check_training_shape(
    family: ModelFamily,
    windows: &[Vec<Vec<f64>>],
    targets: &[f64],
    min_rows: usize,
) -> Result<usize, ModelError> {
    if windows.len() != targets.len() {
        return Err(ModelError::ShapeMismatch {
            expected: format!("{} targets", windows.len()),
            got: targets.len().to_string(),
        });
    }
    if windows.len() < min_rows {
        return Err(ModelError::InsufficientData {
            family,
            rows: windows.len(),
            min: min_rows,
        });
    }
    let width = windows
        .iter()
        .flat_map(|w| w.last())
        .map(|row| row.len())
        .next()
        .unwrap_or(0);
    if windows.iter().flatten().any(|row| row.len() != width) {
        return Err(ModelError::ShapeMismatch {
            expected: format!("{width} features per row"),
            got: "ragged rows".into(),
        });
    }
    Ok(width)
}

// ─── Training examples ───────────────────────────────────────────────

/// One supervised example: features up to `key`'s quarter, labelled with the
/// next quarter's price when it is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    /// Quarter the features describe (the forecast origin).
    pub key: QuarterKey,
    /// Raw feature rows, oldest first; the last row is `key`'s quarter.
    pub window: Vec<Vec<Option<f64>>>,
    /// Price at `key`'s quarter.
    pub previous_actual: f64,
    /// Price at the next quarter, once realised.
    pub target: Option<f64>,
    /// Observed-feature coverage of the last row.
    pub coverage: f64,
}

impl Example {
    pub fn quarter(&self) -> FiscalQuarter {
        self.key.quarter()
    }

    /// Key of the quarter being forecast.
    pub fn target_key(&self) -> QuarterKey {
        QuarterKey::new(self.key.ticker.as_str(), self.quarter().next())
    }

    pub fn target_quarter(&self) -> FiscalQuarter {
        self.quarter().next()
    }

    /// `ln(target / previous)`, when both prices are positive.
    pub fn log_return(&self) -> Option<f64> {
        let target = self.target?;
        (target > 0.0 && self.previous_actual > 0.0)
            .then(|| (target / self.previous_actual).ln())
    }

    /// Last (current-quarter) feature row.
    pub fn features(&self) -> &[Option<f64>] {
        self.window.last().map(|r| r.as_slice()).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_serializes_snake_case() {
        let json = serde_json::to_string(&ModelFamily::TreeEnsemble).unwrap();
        assert_eq!(json, "\"tree_ensemble\"");
    }

    #[test]
    fn config_tagged_by_family() {
        let cfg: ModelConfig =
            serde_json::from_str(r#"{"family":"sequence","hidden_size":8}"#).unwrap();
        assert_eq!(cfg.family(), ModelFamily::Sequence);
        match cfg {
            ModelConfig::Sequence(p) => {
                assert_eq!(p.hidden_size, 8);
                assert_eq!(p.sequence_length, SequenceParams::default().sequence_length);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn history_rows_per_family() {
        assert_eq!(ModelConfig::TreeEnsemble(TreeParams::default()).history_rows(), 1);
        assert_eq!(ModelConfig::Attention(AttentionParams::default()).history_rows(), 5);
    }

    #[test]
    fn expired_context_times_out() {
        let ctx = FitContext::with_budget(std::time::Duration::ZERO);
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(matches!(
            ctx.check(ModelFamily::Sequence),
            Err(ModelError::Timeout { .. })
        ));
        assert!(FitContext::unbounded().check(ModelFamily::Sequence).is_ok());
    }

    #[test]
    fn log_return_requires_positive_prices() {
        let mut ex = Example {
            key: QuarterKey::new("7203.T", "2023Q1".parse().unwrap()),
            window: vec![vec![Some(1.0)]],
            previous_actual: 100.0,
            target: Some(110.0),
            coverage: 1.0,
        };
        assert!((ex.log_return().unwrap() - (1.1f64).ln()).abs() < 1e-12);
        assert_eq!(ex.target_quarter().to_string(), "2023Q2");
        ex.previous_actual = 0.0;
        assert_eq!(ex.log_return(), None);
    }
}
