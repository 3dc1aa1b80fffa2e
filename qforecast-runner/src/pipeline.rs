//! Retraining entry points — `train → evaluate → (conditionally) promote → predict`.
//!
//! The pipeline holds no timers; an external scheduler calls `run_retraining`
//! or `evaluate` with an observation snapshot and the current instant. A run
//! either completes and leaves new immutable artifacts, reports and
//! predictions behind, or fails cleanly with prior state untouched.
//!
//! On-disk layout under the data directory:
//! - `observations.jsonl` (owned by the ingest side)
//! - `registry/` model artifacts and ensemble weights
//! - `reports.jsonl` evaluation reports
//! - `promotions.jsonl` gate decisions
//! - `store/` predictions and release events

use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use qforecast_core::domain::{DatasetHash, EnsembleVersion, FiscalQuarter, Prediction};
use qforecast_core::model::{Estimate, ModelArtifact, ModelFamily, TrainingWindow};
use qforecast_core::{FeatureError, FeatureSet, ObservationSnapshot};

use crate::config::{ConfigError, PipelineConfig};
use crate::dataset::{build_dataset, Dataset};
use crate::journal::Journal;
use crate::promotion::{GateViolation, PromotionGate, PromotionRecord};
use crate::registry::{ArtifactRegistry, RegistryError};
use crate::report::{EvaluationReport, ReportLog, Subject};
use crate::stacker::{EnsembleWeights, MemberRef, StackError, Stacker};
use crate::store::{PredictionStore, Release, StoreError};
use crate::trainer::train_families;
use crate::walk_forward::{run_walk_forward, validation_rows, WalkForwardError, WalkForwardInputs, WalkForwardOutcome};

// ─── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("feature set: {0}")]
    Features(#[from] FeatureError),

    #[error("walk-forward: {0}")]
    WalkForward(#[from] WalkForwardError),

    #[error("ensemble: {0}")]
    Stack(#[from] StackError),

    #[error("registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("journal {path}: {source}")]
    Journal {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no quarter since {first} has closed by {now}")]
    NoClosedQuarter {
        first: FiscalQuarter,
        now: NaiveDateTime,
    },

    #[error("no labelled quarters in the dataset")]
    NoLabelledData,

    #[error("every model family failed to train: {0}")]
    NoTrainedModels(String),
}

// ─── Summaries ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct FamilyFailure {
    pub family: ModelFamily,
    pub error: String,
}

/// What happened at the promotion gate.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PromotionDecision {
    Promoted {
        release: Release,
    },
    Blocked {
        candidate: EnsembleVersion,
        reasons: Vec<GateViolation>,
        /// Release still serving, if any.
        serving: Option<EnsembleVersion>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrainSummary {
    pub dataset_hash: DatasetHash,
    pub examples: usize,
    pub folds: usize,
    pub aggregates: Vec<EvaluationReport>,
    pub members: Vec<MemberRef>,
    pub failures: Vec<FamilyFailure>,
    pub ensemble: EnsembleVersion,
    pub decision: PromotionDecision,
    pub predictions: Vec<Prediction>,
}

#[derive(Debug, Clone)]
pub struct EvaluationSummary {
    pub outcome: WalkForwardOutcome,
    /// Gate verdict for the ensemble aggregate (not acted upon).
    pub gate: Result<(), Vec<GateViolation>>,
}

// ─── Pipeline ────────────────────────────────────────────────────────

pub struct Pipeline {
    config: PipelineConfig,
    feature_set: FeatureSet,
    registry: ArtifactRegistry,
    reports: ReportLog,
    promotions: Journal<PromotionRecord>,
    store: PredictionStore,
    gate: PromotionGate,
}

impl Pipeline {
    /// Open the pipeline's persistent state under `data_dir`.
    pub fn open(config: PipelineConfig, data_dir: &Path) -> Result<Self, PipelineError> {
        config.validate()?;
        let feature_set = config.feature_set()?;
        let store = PredictionStore::open(&data_dir.join("store"), config.store.clone())?;
        Ok(Self {
            feature_set,
            registry: ArtifactRegistry::new(data_dir.join("registry")),
            reports: ReportLog::new(data_dir.join("reports.jsonl")),
            promotions: Journal::new(data_dir.join("promotions.jsonl")),
            gate: PromotionGate::new(config.promotion.clone()),
            store,
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &PredictionStore {
        &self.store
    }

    pub fn registry(&self) -> &ArtifactRegistry {
        &self.registry
    }

    pub fn reports(&self) -> &ReportLog {
        &self.reports
    }

    pub fn promotions(&self) -> Result<Vec<PromotionRecord>, PipelineError> {
        self.promotions.read_all().map_err(|source| PipelineError::Journal {
            path: self.promotions.path().to_path_buf(),
            source,
        })
    }

    /// Quarters from `first_quarter` through the last one whose decision cutoff
    /// has passed at `now`.
    pub fn closed_quarters(&self, now: NaiveDateTime) -> Result<Vec<FiscalQuarter>, PipelineError> {
        let first = self.config.first_quarter;
        let mut last = FiscalQuarter::containing(now.date());
        while self.config.alignment.cutoff(last) > now {
            last = last.prev();
        }
        if last < first {
            return Err(PipelineError::NoClosedQuarter { first, now });
        }
        Ok(FiscalQuarter::range(first, last))
    }

    pub fn build_dataset(
        &self,
        snapshot: &ObservationSnapshot,
        now: NaiveDateTime,
    ) -> Result<Dataset, PipelineError> {
        let quarters = self.closed_quarters(now)?;
        Ok(build_dataset(snapshot, &self.config, &self.feature_set, &quarters))
    }

    fn inputs<'a>(&'a self, dataset: &'a Dataset, now: NaiveDateTime) -> WalkForwardInputs<'a> {
        WalkForwardInputs {
            dataset,
            models: &self.config.models,
            trainer: &self.config.trainer,
            ensemble: &self.config.ensemble,
            config: &self.config.walk_forward,
            registry: Some(&self.registry),
            generated_at: now,
        }
    }

    fn append_reports(&self, reports: &[EvaluationReport]) -> Result<(), PipelineError> {
        self.reports
            .append_all(reports)
            .map_err(|source| PipelineError::Journal {
                path: self.reports.path().to_path_buf(),
                source,
            })
    }

    /// Walk-forward evaluation only: reports are recorded, nothing is promoted.
    pub fn evaluate(
        &self,
        snapshot: &ObservationSnapshot,
        now: NaiveDateTime,
    ) -> Result<EvaluationSummary, PipelineError> {
        let dataset = self.build_dataset(snapshot, now)?;
        let outcome = run_walk_forward(&self.inputs(&dataset, now))?;
        self.append_reports(&outcome.all_reports())?;
        let gate = match outcome.aggregate(Subject::Ensemble) {
            Some(report) => self.gate.check(report).map_err(|f| f.reasons),
            None => Err(vec![GateViolation::NotAggregate]),
        };
        Ok(EvaluationSummary { outcome, gate })
    }

    /// Retrain every family on all labelled history, evaluate walk-forward,
    /// promote the new ensemble if it clears the gate and record forecasts for
    /// the latest quarter from whichever release is serving.
    pub fn run_retraining(
        &self,
        snapshot: &ObservationSnapshot,
        now: NaiveDateTime,
    ) -> Result<RetrainSummary, PipelineError> {
        let dataset = self.build_dataset(snapshot, now)?;
        let inputs = self.inputs(&dataset, now);

        // Evaluate
        let outcome = run_walk_forward(&inputs)?;
        self.append_reports(&outcome.all_reports())?;

        // Train on the full labelled window
        let labelled = dataset.labelled_quarters();
        let (Some(&first), Some(&last)) = (labelled.first(), labelled.last()) else {
            return Err(PipelineError::NoLabelledData);
        };
        let window = TrainingWindow::new(first, last);
        let mut artifacts = Vec::new();
        let mut failures = Vec::new();
        for (family, result) in train_families(
            &self.config.models,
            &dataset,
            window,
            &self.config.trainer,
            Some(&self.registry),
            now,
        ) {
            match result {
                Ok(artifact) => artifacts.push(artifact),
                Err(e) => failures.push(FamilyFailure {
                    family,
                    error: e.to_string(),
                }),
            }
        }
        if artifacts.is_empty() {
            let detail = failures
                .iter()
                .map(|f| format!("{}: {}", f.family, f.error))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(PipelineError::NoTrainedModels(detail));
        }

        // Stack
        let members: Vec<MemberRef> = artifacts
            .iter()
            .map(|a| MemberRef {
                family: a.family(),
                version: a.version().clone(),
            })
            .collect();
        let oof = validation_rows(&inputs, window);
        let weights = Stacker::fit(&self.config.ensemble.policy, members.clone(), &oof)?;
        self.registry.put_ensemble(&weights)?;
        info!(ensemble = %weights.version, members = members.len(), oof_rows = oof.len(), "candidate ensemble fitted");

        // Gate
        let aggregate = outcome.aggregate(Subject::Ensemble);
        let report_version = aggregate.map(|r| r.version.clone()).unwrap_or_default();
        let verdict = match aggregate {
            Some(report) => self.gate.check(report).map_err(|f| f.reasons),
            None => Err(vec![GateViolation::NotAggregate]),
        };
        self.promotions
            .append(&PromotionRecord {
                candidate: weights.version.clone(),
                report_version: report_version.clone(),
                passed: verdict.is_ok(),
                reasons: verdict.clone().err().unwrap_or_default(),
                decided_at: now,
            })
            .map_err(|source| PipelineError::Journal {
                path: self.promotions.path().to_path_buf(),
                source,
            })?;

        let (decision, serving) = match verdict {
            Ok(()) => {
                let release = Release {
                    version: weights.version.clone(),
                    feature_set: dataset.feature_set.clone(),
                    report_version,
                    mape: aggregate.and_then(|r| r.mape),
                    directional_accuracy: aggregate.and_then(|r| r.directional_accuracy),
                    promoted_at: now,
                };
                self.store.promote(release.clone())?;
                let band = aggregate.and_then(|r| r.residual_band);
                (
                    PromotionDecision::Promoted { release },
                    Some((weights.clone(), artifacts, band)),
                )
            }
            Err(reasons) => {
                let current = self.store.current_release();
                warn!(
                    candidate = %weights.version,
                    serving = ?current.as_ref().map(|r| r.version.to_string()),
                    reasons = %reasons.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "),
                    "promotion blocked"
                );
                let serving = match &current {
                    Some(release) => self.load_release(release, &dataset)?,
                    None => None,
                };
                (
                    PromotionDecision::Blocked {
                        candidate: weights.version.clone(),
                        reasons,
                        serving: current.map(|r| r.version),
                    },
                    serving,
                )
            }
        };

        // Predict
        let predictions = match serving {
            Some((serving_weights, serving_artifacts, band)) => {
                let predictions = self.forecast_latest(&dataset, &serving_weights, &serving_artifacts, band, now);
                self.store.record_all(&predictions)?;
                predictions
            }
            None => Vec::new(),
        };
        info!(predictions = predictions.len(), "retraining run complete");

        Ok(RetrainSummary {
            dataset_hash: dataset.dataset_hash.clone(),
            examples: dataset.len(),
            folds: outcome.folds.len(),
            aggregates: outcome.aggregates,
            members,
            failures,
            ensemble: weights.version,
            decision,
            predictions,
        })
    }

    /// Reload a promoted release's ensemble and member artifacts, with the
    /// residual band of the report that promoted it.
    #[allow(clippy::type_complexity)]
    fn load_release(
        &self,
        release: &Release,
        dataset: &Dataset,
    ) -> Result<Option<(EnsembleWeights, Vec<ModelArtifact>, Option<f64>)>, PipelineError> {
        if release.feature_set != dataset.feature_set {
            warn!(
                release = %release.version,
                release_features = %release.feature_set,
                current_features = %dataset.feature_set,
                "serving release uses another feature set; no new forecasts"
            );
            return Ok(None);
        }
        let Some(weights) = self.registry.get_ensemble(&release.version)? else {
            warn!(release = %release.version, "serving ensemble missing from registry");
            return Ok(None);
        };
        let mut artifacts = Vec::with_capacity(weights.members.len());
        for member in &weights.members {
            match self.registry.get_model(member.family, &member.version)? {
                Some(artifact) => artifacts.push(artifact),
                None => warn!(family = %member.family, version = %member.version, "serving member missing"),
            }
        }
        let band = self
            .reports
            .read_all()
            .map_err(|source| PipelineError::Journal {
                path: self.reports.path().to_path_buf(),
                source,
            })?
            .into_iter()
            .rev()
            .find(|r| r.is_aggregate() && r.version == release.report_version)
            .and_then(|r| r.residual_band);
        Ok(Some((weights, artifacts, band)))
    }

    /// One forecast per ticker from its latest origin quarter. Tickers whose
    /// members all fail are skipped.
    fn forecast_latest(
        &self,
        dataset: &Dataset,
        weights: &EnsembleWeights,
        artifacts: &[ModelArtifact],
        residual_band: Option<f64>,
        now: NaiveDateTime,
    ) -> Vec<Prediction> {
        let mut predictions = Vec::new();
        for example in dataset.latest_per_ticker() {
            let estimates: Vec<Estimate> = artifacts
                .iter()
                .filter_map(|a| match a.predict(example) {
                    Ok(est) => Some(est),
                    Err(e) => {
                        warn!(family = %a.family(), key = %example.key, error = %e, "member forecast failed");
                        None
                    }
                })
                .collect();
            match Stacker::combine(
                weights,
                &estimates,
                example.target_key(),
                example.previous_actual,
                residual_band,
                &self.config.ensemble,
                dataset.feature_set.clone(),
                now,
            ) {
                Ok(prediction) => predictions.push(prediction),
                Err(e) => warn!(key = %example.key, error = %e, "no forecast"),
            }
        }
        predictions
    }
}
