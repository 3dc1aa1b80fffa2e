//! Pipeline configuration (TOML).
//!
//! One document describes the whole run: universe, input series, cutoff policy,
//! feature set, model families, trainer limits, ensemble policy, walk-forward
//! layout, promotion thresholds and store staleness. Every section has defaults;
//! `validate` rejects the configurations that would make the whole run fatal.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use qforecast_core::align::validate_specs;
use qforecast_core::domain::{FiscalQuarter, Ticker, Universe, UniverseError};
use qforecast_core::model::ModelConfig;
use qforecast_core::{AlignError, AlignmentPolicy, FeatureDef, FeatureError, FeatureSet, SeriesSpec};

use crate::promotion::PromotionConfig;
use crate::stacker::EnsembleConfig;
use crate::store::StoreConfig;
use crate::trainer::TrainerConfig;
use crate::walk_forward::WalkForwardConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("universe: {0}")]
    Universe(#[from] UniverseError),

    #[error("feature set: {0}")]
    Features(#[from] FeatureError),

    #[error("series: {0}")]
    Series(#[from] AlignError),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Feature-set definition as written in the config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSetConfig {
    pub label: String,
    #[serde(default)]
    pub defs: Vec<FeatureDef>,
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// First forecast-origin quarter considered.
    pub first_quarter: FiscalQuarter,
    /// Slot name of the price series being forecast.
    #[serde(default = "default_target_series")]
    pub target_series: String,
    pub universe: Vec<Ticker>,
    pub series: Vec<SeriesSpec>,
    #[serde(default)]
    pub alignment: AlignmentPolicy,
    pub features: FeatureSetConfig,
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub trainer: TrainerConfig,
    #[serde(default)]
    pub ensemble: EnsembleConfig,
    #[serde(default)]
    pub walk_forward: WalkForwardConfig,
    #[serde(default)]
    pub promotion: PromotionConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

fn default_target_series() -> String {
    "close".to_string()
}

impl PipelineConfig {
    /// Load and validate a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn feature_set(&self) -> Result<FeatureSet, FeatureError> {
        FeatureSet::new(&self.features.label, self.features.defs.clone())
    }

    pub fn ticker_universe(&self) -> Result<Universe, UniverseError> {
        Universe::from_tickers(self.universe.iter().cloned())
    }

    /// Feature rows each example carries: the longest history any family reads.
    pub fn window_rows(&self) -> usize {
        self.models
            .iter()
            .map(ModelConfig::history_rows)
            .max()
            .unwrap_or(1)
    }

    /// Reject configurations that cannot produce a meaningful run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let universe = self.ticker_universe()?;
        if universe.is_empty() {
            return Err(ConfigError::Invalid("universe is empty".into()));
        }
        if self.series.is_empty() {
            return Err(ConfigError::Invalid("no input series configured".into()));
        }
        validate_specs(&self.series)?;

        let slots: BTreeSet<String> = self.series.iter().flat_map(|s| s.slot_names()).collect();
        if !self.series.iter().any(|s| s.name == self.target_series) {
            return Err(ConfigError::Invalid(format!(
                "target series '{}' is not a configured series",
                self.target_series
            )));
        }

        let set = self.feature_set()?;
        for def in set.defs() {
            if !slots.contains(def.slot()) {
                return Err(ConfigError::Invalid(format!(
                    "feature '{}' reads unknown slot '{}'",
                    def.name(),
                    def.slot()
                )));
            }
        }

        if self.models.is_empty() {
            return Err(ConfigError::Invalid("no model family configured".into()));
        }
        let mut families = BTreeSet::new();
        for model in &self.models {
            if !families.insert(model.family()) {
                return Err(ConfigError::Invalid(format!(
                    "model family '{}' configured twice",
                    model.family()
                )));
            }
        }

        self.trainer.validate().map_err(ConfigError::Invalid)?;
        self.ensemble.validate().map_err(ConfigError::Invalid)?;
        self.walk_forward.validate().map_err(ConfigError::Invalid)?;
        self.promotion.validate().map_err(ConfigError::Invalid)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qforecast_core::model::ModelFamily;

    const SAMPLE: &str = r#"
first_quarter = "2015Q1"

[[universe]]
symbol = "7203.T"
sector = "Automobiles"
market = "TSE"

[[universe]]
symbol = "6758.T"
sector = "Electronics"
market = "TSE"

[[series]]
name = "close"
series_id = "price:{ticker}"
required = true
kind = { type = "daily", aggregation = "quarter_end_close" }

[[series]]
name = "cpi"
series_id = "macro:jp_cpi"
kind = { type = "periodic" }

[[series]]
name = "policy_score"
series_id = "policy:score"
kind = { type = "policy_event" }

[features]
label = "macro-v1"

[[features.defs]]
kind = "pct_change"
name = "ret1"
slot = "close"
periods = 1

[[features.defs]]
kind = "event_count"
name = "policy_events"
slot = "policy_score_events"

[[models]]
family = "tree_ensemble"
max_depth = 3

[[models]]
family = "sequence"
sequence_length = 6

[promotion]
max_mape = 0.08
min_directional_accuracy = 0.55
"#;

    #[test]
    fn parses_sample() {
        let config = PipelineConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.universe.len(), 2);
        assert_eq!(config.target_series, "close");
        assert_eq!(config.models[0].family(), ModelFamily::TreeEnsemble);
        assert_eq!(config.window_rows(), 6);
        assert_eq!(config.trainer, TrainerConfig::default());
        assert_eq!(config.feature_set().unwrap().len(), 2);
    }

    #[test]
    fn duplicate_ticker_rejected() {
        let doubled = SAMPLE.replace("6758.T", "7203.T");
        assert!(matches!(
            PipelineConfig::from_toml(&doubled),
            Err(ConfigError::Universe(UniverseError::Duplicate(_)))
        ));
    }

    #[test]
    fn missing_feature_set_is_fatal() {
        let no_defs = SAMPLE
            .split("[[features.defs]]")
            .next()
            .unwrap()
            .to_string()
            + "\n[[models]]\nfamily = \"tree_ensemble\"\n";
        assert!(matches!(
            PipelineConfig::from_toml(&no_defs),
            Err(ConfigError::Features(FeatureError::EmptyFeatureSet(_)))
        ));
    }

    #[test]
    fn unknown_slot_rejected() {
        let bad = SAMPLE.replace("slot = \"close\"", "slot = \"open\"");
        assert!(matches!(
            PipelineConfig::from_toml(&bad),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn duplicate_family_rejected() {
        let bad = SAMPLE.replace("family = \"sequence\"", "family = \"tree_ensemble\"");
        assert!(matches!(
            PipelineConfig::from_toml(&bad),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn from_file_reports_path() {
        let err = PipelineConfig::from_file(Path::new("/nonexistent/pipeline.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/pipeline.toml"));
    }

    #[test]
    fn shipped_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/pipeline.toml");
        let config = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(config.universe.len(), 3);
        assert_eq!(config.models.len(), 3);
        assert_eq!(config.store.grace_days, 7);
    }
}
