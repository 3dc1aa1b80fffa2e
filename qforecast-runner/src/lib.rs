//! qforecast runner — training, stacking, walk-forward evaluation and serving.
//!
//! This crate builds on `qforecast-core` to provide:
//! - Pipeline configuration (TOML) and observation CSV/JSONL I/O
//! - Dataset assembly, parallel per ticker
//! - Model Trainer orchestration, parallel per family, with artifact reuse
//! - Ensemble Stacker (constrained linear blend or ridge meta-learner)
//! - Walk-forward Backtester/Evaluator with sample-weighted aggregates
//! - Promotion gate, artifact registry and the Prediction Store
//! - The `train → evaluate → promote → predict` retraining entry point

pub mod config;
pub mod dataset;
pub mod journal;
pub mod metrics;
pub mod observation_io;
pub mod pipeline;
pub mod promotion;
pub mod registry;
pub mod report;
pub mod stacker;
pub mod store;
pub mod synthetic;
pub mod trainer;
pub mod walk_forward;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{ConfigError, FeatureSetConfig, PipelineConfig};
pub use dataset::{build_dataset, Dataset};
pub use metrics::{ForecastMetrics, ScoredRow};
pub use observation_io::{read_csv, read_csv_file, CsvBatch, ObservationIoError, ObservationStore};
pub use pipeline::{
    EvaluationSummary, FamilyFailure, Pipeline, PipelineError, PromotionDecision, RetrainSummary,
};
pub use promotion::{GateViolation, PromotionConfig, PromotionGate, PromotionGateFailure, PromotionRecord};
pub use registry::{ArtifactRegistry, RegistryError};
pub use report::{EvaluationReport, ReportLog, ReportScope, Subject};
pub use stacker::{BlendPolicy, EnsembleConfig, EnsembleWeights, MemberRef, OofRow, StackError, Stacker};
pub use store::{
    PredictionOutcome, PredictionStore, Release, ReleaseEvent, ServedPrediction, StoreConfig, StoreError,
};
pub use trainer::{train, train_families, train_or_reuse, TrainError, TrainerConfig};
pub use walk_forward::{
    create_folds, run_walk_forward, FoldOutcome, FoldSpec, WalkForwardConfig, WalkForwardError,
    WalkForwardInputs, WalkForwardOutcome, WindowKind,
};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn store_is_shareable_across_threads() {
        assert_send::<PredictionStore>();
        assert_sync::<PredictionStore>();
        assert_send::<ServedPrediction>();
        assert_sync::<ServedPrediction>();
    }

    #[test]
    fn pipeline_is_send_sync() {
        assert_send::<Pipeline>();
        assert_sync::<Pipeline>();
    }

    #[test]
    fn config_types_are_send_sync() {
        assert_send::<PipelineConfig>();
        assert_sync::<PipelineConfig>();
        assert_send::<EnsembleWeights>();
        assert_sync::<EnsembleWeights>();
    }

    #[test]
    fn dataset_is_send_sync() {
        assert_send::<Dataset>();
        assert_sync::<Dataset>();
    }
}
