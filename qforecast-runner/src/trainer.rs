//! Model Trainer — fits one artifact per configured family.
//!
//! Rows below the coverage threshold are dropped before fitting; the remaining
//! count must reach `min_rows`. Families train concurrently on the same immutable
//! dataset and each produces its own artifact, so one family's failure never
//! affects another.

use std::time::Duration;

use chrono::NaiveDateTime;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use qforecast_core::model::{
    ArtifactSpec, Example, FitContext, ModelArtifact, ModelConfig, ModelError, ModelFamily,
    TrainingWindow,
};

use crate::dataset::Dataset;
use crate::registry::ArtifactRegistry;

// ─── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Minimum trainable rows per fit.
    pub min_rows: usize,
    /// Minimum share of observed (non-missing, non-imputed) features for a row
    /// to be trainable.
    pub min_feature_coverage: f64,
    /// Per-family wall-clock budget in seconds; `None` is unbounded.
    pub max_train_secs: Option<f64>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            min_rows: 8,
            min_feature_coverage: 0.8,
            max_train_secs: None,
        }
    }
}

impl TrainerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.min_rows == 0 {
            return Err("trainer.min_rows must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.min_feature_coverage) {
            return Err(format!(
                "trainer.min_feature_coverage must be within [0, 1], got {}",
                self.min_feature_coverage
            ));
        }
        if let Some(secs) = self.max_train_secs {
            if !(secs.is_finite() && secs > 0.0) {
                return Err(format!("trainer.max_train_secs must be positive, got {secs}"));
            }
        }
        Ok(())
    }

    fn fit_context(&self) -> FitContext {
        match self.max_train_secs {
            Some(secs) => FitContext::with_budget(Duration::from_secs_f64(secs)),
            None => FitContext::unbounded(),
        }
    }

    /// Labelled, sufficiently covered examples inside `window`.
    pub fn trainable<'a>(&self, dataset: &'a Dataset, window: &TrainingWindow) -> Vec<&'a Example> {
        dataset
            .in_window(window)
            .into_iter()
            .filter(|e| e.log_return().is_some())
            .filter(|e| e.coverage >= self.min_feature_coverage)
            .collect()
    }
}

// ─── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrainError {
    #[error("insufficient data for {family}: {rows} trainable rows, need {min}")]
    InsufficientData {
        family: ModelFamily,
        rows: usize,
        min: usize,
    },

    #[error(transparent)]
    Model(#[from] ModelError),
}

impl TrainError {
    pub fn family(&self) -> Option<ModelFamily> {
        match self {
            Self::InsufficientData { family, .. } => Some(*family),
            Self::Model(
                ModelError::InsufficientData { family, .. }
                | ModelError::Convergence { family, .. }
                | ModelError::Timeout { family, .. }
                | ModelError::NotFitted(family),
            ) => Some(*family),
            Self::Model(_) => None,
        }
    }
}

// ─── Training ────────────────────────────────────────────────────────

/// Artifact identity for a dataset/window pair under `trainer`'s row selection.
pub fn artifact_spec(dataset: &Dataset, window: TrainingWindow, trainer: &TrainerConfig) -> ArtifactSpec {
    spec_for_rows(dataset, window, &trainer.trainable(dataset, &window))
}

fn spec_for_rows(dataset: &Dataset, window: TrainingWindow, rows: &[&Example]) -> ArtifactSpec {
    ArtifactSpec {
        feature_set: dataset.feature_set.clone(),
        feature_names: dataset.feature_names.clone(),
        window,
        dataset_hash: dataset.dataset_hash.clone(),
        row_digest: ArtifactSpec::digest_rows(rows),
    }
}

/// Train one family on the examples whose origin quarter lies in `window`.
pub fn train(
    config: &ModelConfig,
    dataset: &Dataset,
    window: TrainingWindow,
    trainer: &TrainerConfig,
    trained_at: NaiveDateTime,
) -> Result<ModelArtifact, TrainError> {
    let family = config.family();
    let rows = trainer.trainable(dataset, &window);
    if rows.len() < trainer.min_rows {
        return Err(TrainError::InsufficientData {
            family,
            rows: rows.len(),
            min: trainer.min_rows,
        });
    }
    let dropped = dataset
        .in_window(&window)
        .iter()
        .filter(|e| e.log_return().is_some())
        .count()
        - rows.len();
    if dropped > 0 {
        info!(%family, dropped, threshold = trainer.min_feature_coverage, "low-coverage rows dropped");
    }

    let artifact = ModelArtifact::fit(
        config,
        &rows,
        spec_for_rows(dataset, window, &rows),
        &trainer.fit_context(),
        trained_at,
    )?;
    Ok(artifact)
}

/// Reuse a stored artifact trained on exactly this configuration, window,
/// dataset and row selection; otherwise train and store a new one. Registry failures are logged
/// and never fail the training itself.
pub fn train_or_reuse(
    config: &ModelConfig,
    dataset: &Dataset,
    window: TrainingWindow,
    trainer: &TrainerConfig,
    registry: Option<&ArtifactRegistry>,
    trained_at: NaiveDateTime,
) -> Result<ModelArtifact, TrainError> {
    let family = config.family();
    if let Some(registry) = registry {
        match registry.find_reusable(config, &artifact_spec(dataset, window, trainer)) {
            Ok(Some(artifact)) => {
                debug!(%family, version = %artifact.version(), "reusing stored artifact");
                return Ok(artifact);
            }
            Ok(None) => {}
            Err(e) => warn!(%family, error = %e, "artifact lookup failed; retraining"),
        }
    }

    let artifact = train(config, dataset, window, trainer, trained_at)?;
    if let Some(registry) = registry {
        if let Err(e) = registry.put_model(&artifact) {
            warn!(%family, version = %artifact.version(), error = %e, "artifact not stored");
        }
    }
    Ok(artifact)
}

/// Train every configured family concurrently. Results are returned in
/// configuration order; failures are logged and returned, never propagated.
pub fn train_families(
    configs: &[ModelConfig],
    dataset: &Dataset,
    window: TrainingWindow,
    trainer: &TrainerConfig,
    registry: Option<&ArtifactRegistry>,
    trained_at: NaiveDateTime,
) -> Vec<(ModelFamily, Result<ModelArtifact, TrainError>)> {
    configs
        .par_iter()
        .map(|config| {
            let result = train_or_reuse(config, dataset, window, trainer, registry, trained_at);
            if let Err(e) = &result {
                warn!(family = %config.family(), error = %e, "training aborted");
            }
            (config.family(), result)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{sample_config, synthetic_dataset};
    use qforecast_core::model::TreeParams;

    fn now() -> NaiveDateTime {
        NaiveDateTime::default()
    }

    #[test]
    fn trains_every_family() {
        let config = sample_config();
        let dataset = synthetic_dataset(&config, 24);
        let quarters = dataset.labelled_quarters();
        let window = TrainingWindow::new(quarters[0], *quarters.last().unwrap());
        let results = train_families(&config.models, &dataset, window, &config.trainer, None, now());
        assert_eq!(results.len(), config.models.len());
        for (family, result) in results {
            let artifact = result.unwrap();
            assert_eq!(artifact.family(), family);
            assert!(artifact.row_count() >= config.trainer.min_rows);
            assert_eq!(artifact.trained_on(), &window);
        }
    }

    #[test]
    fn too_few_rows_is_insufficient_data() {
        let config = sample_config();
        let dataset = synthetic_dataset(&config, 24);
        let first = dataset.quarters()[0];
        let window = TrainingWindow::new(first, first);
        let trainer = TrainerConfig {
            min_rows: 50,
            ..TrainerConfig::default()
        };
        let err = train(
            &ModelConfig::TreeEnsemble(TreeParams::default()),
            &dataset,
            window,
            &trainer,
            now(),
        )
        .unwrap_err();
        assert!(matches!(err, TrainError::InsufficientData { rows, min: 50, .. } if rows < 50));
        assert_eq!(err.family(), Some(ModelFamily::TreeEnsemble));
    }

    #[test]
    fn coverage_threshold_filters_rows() {
        let config = sample_config();
        let mut dataset = synthetic_dataset(&config, 16);
        for e in dataset.examples.iter_mut().step_by(2) {
            e.coverage = 0.5;
        }
        let window = TrainingWindow::new(dataset.quarters()[0], *dataset.quarters().last().unwrap());
        let all = dataset
            .in_window(&window)
            .iter()
            .filter(|e| e.log_return().is_some())
            .count();
        let kept = config.trainer.trainable(&dataset, &window).len();
        assert!(kept < all);
        assert!(config
            .trainer
            .trainable(&dataset, &window)
            .iter()
            .all(|e| e.coverage >= 0.8));
    }

    #[test]
    fn changed_coverage_threshold_retrains() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ArtifactRegistry::new(dir.path());
        let config = sample_config();
        let mut dataset = synthetic_dataset(&config, 20);
        for e in dataset.examples.iter_mut().step_by(3) {
            e.coverage = 0.5;
        }
        let window = TrainingWindow::new(dataset.quarters()[0], *dataset.quarters().last().unwrap());
        let model = &config.models[0];
        let strict = TrainerConfig {
            min_feature_coverage: 1.0,
            min_rows: 2,
            ..TrainerConfig::default()
        };
        let lax = TrainerConfig {
            min_feature_coverage: 0.0,
            ..strict.clone()
        };

        let first = train_or_reuse(model, &dataset, window, &strict, Some(&registry), now()).unwrap();
        let second = train_or_reuse(model, &dataset, window, &lax, Some(&registry), now()).unwrap();
        assert_ne!(first.version(), second.version());
        assert_eq!(first.row_count(), strict.trainable(&dataset, &window).len());
        assert_eq!(second.row_count(), lax.trainable(&dataset, &window).len());
        assert!(second.row_count() > first.row_count());

        // Same selection again is a reuse.
        let again = train_or_reuse(model, &dataset, window, &strict, Some(&registry), now()).unwrap();
        assert_eq!(again.version(), first.version());
    }

    #[test]
    fn validate_rejects_bad_coverage() {
        let bad = TrainerConfig {
            min_feature_coverage: 1.5,
            ..TrainerConfig::default()
        };
        assert!(bad.validate().is_err());
        assert!(TrainerConfig::default().validate().is_ok());
    }
}
