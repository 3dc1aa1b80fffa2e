//! Walk-forward validation — time-ordered folds, out-of-sample scoring and
//! sample-weighted aggregation per subject.
//!
//! Quarters here are forecast origins. A training example at origin `t` is
//! labelled with the price at `t+1`, so a fold whose first test origin is `T`
//! may only train on origins `≤ T − 1 − embargo`: every training label is then
//! known at `T`'s decision cutoff and strictly precedes the first scored quarter.
//!
//! Ensemble weights for a fold are fitted on out-of-fold rows produced inside
//! that fold's training window: base models are refitted on the window minus its
//! trailing `validation_quarters`, which are then predicted.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use qforecast_core::domain::{FiscalQuarter, Prediction};
use qforecast_core::model::{Estimate, Example, ModelArtifact, ModelConfig, ModelFamily, TrainingWindow};

use crate::dataset::Dataset;
use crate::metrics::ScoredRow;
use crate::registry::ArtifactRegistry;
use crate::report::{EvaluationReport, FoldWindow, Subject};
use crate::stacker::{EnsembleConfig, EnsembleWeights, MemberRef, OofRow, StackError, Stacker};
use crate::trainer::{train_or_reuse, TrainerConfig};

// ─── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WindowKind {
    /// Train on every origin since the first.
    Expanding,
    /// Train on the trailing `quarters` origins.
    Rolling { quarters: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkForwardConfig {
    pub window: WindowKind,
    /// Minimum labelled origins in a fold's training window.
    pub min_train_quarters: usize,
    /// Origins per test fold.
    pub test_quarters: usize,
    /// Keep only the most recent folds.
    pub max_folds: Option<usize>,
    /// Origins skipped between training and test.
    pub embargo_quarters: usize,
}

impl Default for WalkForwardConfig {
    fn default() -> Self {
        Self {
            window: WindowKind::Expanding,
            min_train_quarters: 8,
            test_quarters: 1,
            max_folds: None,
            embargo_quarters: 0,
        }
    }
}

impl WalkForwardConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.min_train_quarters == 0 {
            return Err("walk_forward.min_train_quarters must be at least 1".into());
        }
        if self.test_quarters == 0 {
            return Err("walk_forward.test_quarters must be at least 1".into());
        }
        if let WindowKind::Rolling { quarters } = self.window {
            if quarters < self.min_train_quarters {
                return Err(format!(
                    "rolling window of {quarters} quarters is shorter than min_train_quarters {}",
                    self.min_train_quarters
                ));
            }
        }
        if self.max_folds == Some(0) {
            return Err("walk_forward.max_folds must be at least 1".into());
        }
        Ok(())
    }
}

// ─── Result types ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoldSpec {
    pub index: usize,
    pub train: TrainingWindow,
    pub test_first: FiscalQuarter,
    pub test_last: FiscalQuarter,
}

impl FoldSpec {
    pub fn window(&self) -> FoldWindow {
        FoldWindow {
            train: Some(self.train),
            test_first: self.test_first,
            test_last: self.test_last,
        }
    }

    pub fn tests(&self, quarter: FiscalQuarter) -> bool {
        quarter >= self.test_first && quarter <= self.test_last
    }
}

#[derive(Debug, Clone)]
pub struct FoldOutcome {
    pub spec: FoldSpec,
    pub reports: Vec<EvaluationReport>,
    /// Out-of-sample ensemble forecasts for the fold's test rows.
    pub predictions: Vec<Prediction>,
    pub ensemble: Option<EnsembleWeights>,
    pub failures: Vec<(ModelFamily, String)>,
}

#[derive(Debug, Clone)]
pub struct WalkForwardOutcome {
    pub folds: Vec<FoldOutcome>,
    pub aggregates: Vec<EvaluationReport>,
}

impl WalkForwardOutcome {
    pub fn aggregate(&self, subject: Subject) -> Option<&EvaluationReport> {
        self.aggregates.iter().find(|r| r.subject == subject)
    }

    /// Fold reports followed by aggregates.
    pub fn all_reports(&self) -> Vec<EvaluationReport> {
        self.folds
            .iter()
            .flat_map(|f| f.reports.iter().cloned())
            .chain(self.aggregates.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum WalkForwardError {
    #[error("insufficient history: {quarters} labelled quarters, need at least {needed}")]
    InsufficientData { quarters: usize, needed: usize },

    #[error("fold {fold}: training labels reach {last_label}, test starts at {test_first}")]
    Leakage {
        fold: usize,
        last_label: FiscalQuarter,
        test_first: FiscalQuarter,
    },

    #[error("fold {fold}: {source}")]
    Stack {
        fold: usize,
        #[source]
        source: StackError,
    },
}

// ─── Fold creation ───────────────────────────────────────────────────

/// Create time-ordered, non-overlapping test folds over labelled origin
/// `quarters` (ascending). Each fold's training window ends `1 + embargo`
/// quarters before its first test origin.
pub fn create_folds(
    quarters: &[FiscalQuarter],
    config: &WalkForwardConfig,
) -> Result<Vec<FoldSpec>, WalkForwardError> {
    let needed = config.min_train_quarters + config.embargo_quarters + config.test_quarters;
    let Some(&first) = quarters.first() else {
        return Err(WalkForwardError::InsufficientData { quarters: 0, needed });
    };

    let mut folds = Vec::new();
    let mut start = 0;
    while start < quarters.len() {
        let test_first = quarters[start];
        let train_last = test_first.offset(-1 - config.embargo_quarters as i32);
        let train_first = match config.window {
            WindowKind::Expanding => first,
            WindowKind::Rolling { quarters: n } => train_last.offset(1 - n as i32).max(first),
        };
        let train_rows = quarters
            .iter()
            .filter(|q| **q >= train_first && **q <= train_last)
            .count();
        if train_last < first || train_rows < config.min_train_quarters {
            start += 1;
            continue;
        }

        let end = (start + config.test_quarters).min(quarters.len());
        folds.push(FoldSpec {
            index: 0,
            train: TrainingWindow::new(train_first, train_last),
            test_first,
            test_last: quarters[end - 1],
        });
        start = end;
    }

    if let Some(max) = config.max_folds {
        let skip = folds.len().saturating_sub(max);
        folds.drain(..skip);
    }
    for (i, fold) in folds.iter_mut().enumerate() {
        fold.index = i;
    }

    if folds.is_empty() {
        return Err(WalkForwardError::InsufficientData {
            quarters: quarters.len(),
            needed,
        });
    }
    Ok(folds)
}

/// Leakage guard: every label the artifact saw must precede the test fold.
fn check_disjoint(fold: &FoldSpec, trained_on: &TrainingWindow) -> Result<(), WalkForwardError> {
    let last_label = trained_on.last_label_quarter();
    if last_label > fold.test_first || trained_on.last_quarter >= fold.test_first {
        return Err(WalkForwardError::Leakage {
            fold: fold.index,
            last_label,
            test_first: fold.test_first,
        });
    }
    Ok(())
}

// ─── Walk-forward orchestration ──────────────────────────────────────

/// Everything a walk-forward run reads.
pub struct WalkForwardInputs<'a> {
    pub dataset: &'a Dataset,
    pub models: &'a [ModelConfig],
    pub trainer: &'a TrainerConfig,
    pub ensemble: &'a EnsembleConfig,
    pub config: &'a WalkForwardConfig,
    pub registry: Option<&'a ArtifactRegistry>,
    pub generated_at: NaiveDateTime,
}

/// Run walk-forward validation for every configured family and the ensemble.
///
/// Family failures inside a fold are isolated: the fold is scored with the
/// families that trained. Folds run in order because each ensemble interval
/// uses the residual band of the previous fold.
pub fn run_walk_forward(inputs: &WalkForwardInputs<'_>) -> Result<WalkForwardOutcome, WalkForwardError> {
    let quarters = inputs.dataset.labelled_quarters();
    let folds = create_folds(&quarters, inputs.config)?;
    info!(folds = folds.len(), quarters = quarters.len(), "walk-forward started");

    let mut outcomes = Vec::with_capacity(folds.len());
    let mut residual_band = None;
    for fold in &folds {
        let outcome = run_fold(inputs, fold, residual_band)?;
        if let Some(band) = outcome
            .reports
            .iter()
            .find(|r| r.subject == Subject::Ensemble)
            .and_then(|r| r.residual_band)
        {
            residual_band = Some(band);
        }
        outcomes.push(outcome);
    }

    let mut by_subject: BTreeMap<Subject, Vec<EvaluationReport>> = BTreeMap::new();
    for outcome in &outcomes {
        for report in &outcome.reports {
            by_subject.entry(report.subject).or_default().push(report.clone());
        }
    }
    let aggregates: Vec<EvaluationReport> = by_subject
        .values()
        .filter_map(|reports| EvaluationReport::aggregate(reports, inputs.generated_at))
        .collect();
    for agg in &aggregates {
        info!(report = %agg, "walk-forward aggregate");
    }

    Ok(WalkForwardOutcome {
        folds: outcomes,
        aggregates,
    })
}

fn run_fold(
    inputs: &WalkForwardInputs<'_>,
    fold: &FoldSpec,
    residual_band: Option<f64>,
) -> Result<FoldOutcome, WalkForwardError> {
    let mut failures = Vec::new();

    let artifacts = fit_members(inputs, fold.train, &mut failures);
    for artifact in &artifacts {
        check_disjoint(fold, artifact.trained_on())?;
    }

    let test_rows: Vec<&Example> = inputs
        .dataset
        .examples
        .iter()
        .filter(|e| fold.tests(e.quarter()) && e.target.is_some())
        .collect();

    let mut reports = Vec::new();
    for artifact in &artifacts {
        let rows: Vec<ScoredRow> = test_rows
            .iter()
            .filter_map(|e| {
                let est = artifact.predict(e).ok()?;
                Some(scored(e, est.point))
            })
            .collect();
        reports.push(EvaluationReport::for_fold(
            Subject::Model(artifact.family()),
            artifact.version().to_string(),
            fold.index,
            fold.window(),
            &rows,
            inputs.generated_at,
        ));
    }

    if artifacts.is_empty() {
        warn!(fold = fold.index, "no family trained; fold not scored");
        return Ok(FoldOutcome {
            spec: *fold,
            reports,
            predictions: Vec::new(),
            ensemble: None,
            failures,
        });
    }

    let oof = validation_rows(inputs, fold.train);
    let members: Vec<MemberRef> = artifacts
        .iter()
        .map(|a| MemberRef {
            family: a.family(),
            version: a.version().clone(),
        })
        .collect();
    let weights = Stacker::fit(&inputs.ensemble.policy, members, &oof)
        .map_err(|source| WalkForwardError::Stack { fold: fold.index, source })?;

    let mut predictions = Vec::new();
    let mut ensemble_rows = Vec::new();
    for example in &test_rows {
        let estimates: Vec<Estimate> = artifacts.iter().filter_map(|a| a.predict(example).ok()).collect();
        match Stacker::combine(
            &weights,
            &estimates,
            example.target_key(),
            example.previous_actual,
            residual_band,
            inputs.ensemble,
            inputs.dataset.feature_set.clone(),
            inputs.generated_at,
        ) {
            Ok(prediction) => {
                ensemble_rows.push(scored(example, prediction.point_estimate));
                predictions.push(prediction);
            }
            Err(e) => warn!(fold = fold.index, key = %example.key, error = %e, "ensemble forecast skipped"),
        }
    }
    reports.push(EvaluationReport::for_fold(
        Subject::Ensemble,
        weights.version.to_string(),
        fold.index,
        fold.window(),
        &ensemble_rows,
        inputs.generated_at,
    ));

    Ok(FoldOutcome {
        spec: *fold,
        reports,
        predictions,
        ensemble: Some(weights),
        failures,
    })
}

/// Train (or reuse) every family on `window` in parallel; failures go to
/// `failures` and the family is left out.
fn fit_members(
    inputs: &WalkForwardInputs<'_>,
    window: TrainingWindow,
    failures: &mut Vec<(ModelFamily, String)>,
) -> Vec<ModelArtifact> {
    let results: Vec<(ModelFamily, Result<ModelArtifact, String>)> = inputs
        .models
        .par_iter()
        .map(|config| {
            let result = train_or_reuse(
                config,
                inputs.dataset,
                window,
                inputs.trainer,
                inputs.registry,
                inputs.generated_at,
            )
            .map_err(|e| e.to_string());
            (config.family(), result)
        })
        .collect();

    let mut artifacts = Vec::new();
    for (family, result) in results {
        match result {
            Ok(artifact) => artifacts.push(artifact),
            Err(e) => {
                warn!(%family, error = %e, "family excluded from fold");
                failures.push((family, e));
            }
        }
    }
    artifacts
}

/// Out-of-fold rows for the ensemble: refit on `window` minus its trailing
/// validation quarters, then predict those quarters. Empty for single-family
/// configurations, whose blend is the identity.
pub(crate) fn validation_rows(inputs: &WalkForwardInputs<'_>, window: TrainingWindow) -> Vec<OofRow> {
    if inputs.models.len() < 2 {
        return Vec::new();
    }
    let holdout = inputs.ensemble.validation_quarters as i32;
    let inner_last = window.last_quarter.offset(-holdout);
    if inner_last < window.first_quarter {
        return Vec::new();
    }
    let inner = TrainingWindow::new(window.first_quarter, inner_last);
    let mut ignored = Vec::new();
    let artifacts = fit_members(inputs, inner, &mut ignored);

    inputs
        .dataset
        .examples
        .iter()
        .filter(|e| e.quarter() > inner_last && e.quarter() <= window.last_quarter)
        .filter_map(|e| {
            let actual = e.target?;
            let members: BTreeMap<ModelFamily, f64> = artifacts
                .iter()
                .filter_map(|a| a.predict(e).ok().map(|est| (a.family(), est.point)))
                .collect();
            Some(OofRow {
                key: e.target_key(),
                previous_actual: e.previous_actual,
                actual,
                members,
            })
        })
        .collect()
}

fn scored(example: &Example, predicted: f64) -> ScoredRow {
    ScoredRow {
        key: example.target_key(),
        predicted,
        actual: example.target.unwrap_or(f64::NAN),
        previous_actual: Some(example.previous_actual),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> FiscalQuarter {
        s.parse().unwrap()
    }

    fn quarters(n: i32) -> Vec<FiscalQuarter> {
        (0..n).map(|i| q("2015Q1").offset(i)).collect()
    }

    #[test]
    fn expanding_folds_are_ordered_and_disjoint() {
        let config = WalkForwardConfig {
            min_train_quarters: 4,
            test_quarters: 2,
            ..WalkForwardConfig::default()
        };
        let folds = create_folds(&quarters(12), &config).unwrap();
        assert_eq!(folds.len(), 4);
        for fold in &folds {
            assert_eq!(fold.train.first_quarter, q("2015Q1"));
            assert!(fold.train.last_quarter < fold.test_first);
            assert!(fold.train.last_label_quarter() <= fold.test_first);
            assert!(check_disjoint(fold, &fold.train).is_ok());
        }
        for pair in folds.windows(2) {
            assert!(pair[0].test_last < pair[1].test_first);
        }
        assert_eq!(folds[0].test_first, q("2016Q1"));
    }

    #[test]
    fn rolling_window_and_embargo() {
        let config = WalkForwardConfig {
            window: WindowKind::Rolling { quarters: 4 },
            min_train_quarters: 4,
            embargo_quarters: 1,
            ..WalkForwardConfig::default()
        };
        let folds = create_folds(&quarters(10), &config).unwrap();
        let first = folds[0];
        assert_eq!(first.test_first, q("2016Q2"));
        assert_eq!(first.train, TrainingWindow::new(q("2015Q1"), q("2015Q4")));
        for fold in &folds {
            assert_eq!(fold.train.first_quarter.quarters_until(fold.train.last_quarter), 3);
            assert_eq!(fold.train.last_quarter.offset(2), fold.test_first);
        }
    }

    #[test]
    fn max_folds_keeps_most_recent() {
        let config = WalkForwardConfig {
            min_train_quarters: 2,
            max_folds: Some(2),
            ..WalkForwardConfig::default()
        };
        let folds = create_folds(&quarters(8), &config).unwrap();
        assert_eq!(folds.len(), 2);
        assert_eq!(folds[0].index, 0);
        assert_eq!(folds[1].test_first, q("2016Q4"));
    }

    #[test]
    fn too_short_history_fails() {
        let err = create_folds(&quarters(3), &WalkForwardConfig::default()).unwrap_err();
        assert!(matches!(err, WalkForwardError::InsufficientData { quarters: 3, .. }));
    }

    #[test]
    fn overlapping_training_is_leakage() {
        let fold = FoldSpec {
            index: 0,
            train: TrainingWindow::new(q("2015Q1"), q("2016Q1")),
            test_first: q("2016Q1"),
            test_last: q("2016Q1"),
        };
        assert!(matches!(
            check_disjoint(&fold, &fold.train),
            Err(WalkForwardError::Leakage { .. })
        ));
    }
}
