//! Immutable, versioned model artifacts.
//!
//! A `ModelArtifact` bundles a fitted base model with everything needed to use and
//! audit it: the standardiser, the feature schema, the training window and the
//! dataset hash. Fields are private and there are no mutators; retraining yields a
//! new artifact with a new version.
//!
//! Models are fitted on log returns `ln(next / previous)`; `predict` maps back to
//! price space and carries the variance through the delta method.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{BaseModel, Example, FitContext, Forecaster, ModelConfig, ModelError, ModelFamily};
use super::scaler::Standardizer;
use crate::domain::{DatasetHash, FeatureSetVersion, FiscalQuarter, ModelVersion};

/// Inclusive range of forecast-origin quarters the artifact was trained on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrainingWindow {
    pub first_quarter: FiscalQuarter,
    pub last_quarter: FiscalQuarter,
}

impl TrainingWindow {
    pub fn new(first_quarter: FiscalQuarter, last_quarter: FiscalQuarter) -> Self {
        Self {
            first_quarter,
            last_quarter,
        }
    }

    /// Latest quarter whose *realised price* was used as a label.
    pub fn last_label_quarter(&self) -> FiscalQuarter {
        self.last_quarter.next()
    }

    pub fn contains(&self, quarter: FiscalQuarter) -> bool {
        quarter >= self.first_quarter && quarter <= self.last_quarter
    }
}

/// What an artifact is trained against.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactSpec {
    pub feature_set: FeatureSetVersion,
    pub feature_names: Vec<String>,
    pub window: TrainingWindow,
    pub dataset_hash: DatasetHash,
    /// Digest of the keys of the rows selected for fitting (see `digest_rows`).
    /// Two selections from the same dataset and window are different artifacts.
    pub row_digest: String,
}

impl ArtifactSpec {
    /// Order-sensitive BLAKE3 digest of the example keys a fit will see.
    pub fn digest_rows(examples: &[&Example]) -> String {
        let mut hasher = blake3::Hasher::new();
        for example in examples {
            hasher.update(example.key.to_string().as_bytes());
            hasher.update(b"\n");
        }
        hasher.finalize().to_hex().to_string()
    }
}

/// One family's forecast for one example, in price space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub family: ModelFamily,
    pub version: ModelVersion,
    pub point: f64,
    pub log_return: f64,
    pub variance: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    version: ModelVersion,
    family: ModelFamily,
    hyperparameters: ModelConfig,
    trained_on: TrainingWindow,
    row_count: usize,
    tickers: Vec<String>,
    feature_set: FeatureSetVersion,
    feature_names: Vec<String>,
    scaler: Standardizer,
    model: BaseModel,
    imputed_cells: usize,
    trained_at: NaiveDateTime,
    dataset_hash: DatasetHash,
}

/// Canonical identity used for the version hash.
#[derive(Serialize)]
struct VersionInput<'a> {
    family: ModelFamily,
    hyperparameters: &'a ModelConfig,
    trained_on: &'a TrainingWindow,
    feature_set: &'a FeatureSetVersion,
    dataset_hash: &'a DatasetHash,
    rows: &'a str,
}

impl ModelArtifact {
    /// Deterministic version for a training request; lets callers look up an
    /// existing artifact before fitting.
    pub fn version_for(config: &ModelConfig, spec: &ArtifactSpec) -> Result<ModelVersion, ModelError> {
        let input = VersionInput {
            family: config.family(),
            hyperparameters: config,
            trained_on: &spec.window,
            feature_set: &spec.feature_set,
            dataset_hash: &spec.dataset_hash,
            rows: &spec.row_digest,
        };
        let canonical =
            serde_json::to_vec(&input).map_err(|e| ModelError::Serialization(e.to_string()))?;
        Ok(ModelVersion::from_bytes(&canonical))
    }

    /// Fit a new artifact. Examples must be labelled and inside `spec.window`;
    /// unlabelled examples are ignored.
    pub fn fit(
        config: &ModelConfig,
        examples: &[&Example],
        spec: ArtifactSpec,
        ctx: &FitContext,
        trained_at: NaiveDateTime,
    ) -> Result<Self, ModelError> {
        let family = config.family();
        let width = spec.feature_names.len();
        let rows = config.history_rows();

        let labelled: Vec<(&Example, f64)> = examples
            .iter()
            .filter(|e| spec.window.contains(e.quarter()))
            .filter_map(|e| e.log_return().map(|r| (*e, r)))
            .collect();

        let last_rows: Vec<Vec<Option<f64>>> =
            labelled.iter().map(|(e, _)| e.features().to_vec()).collect();
        let scaler = Standardizer::fit(&last_rows, width);

        let mut imputed_cells = 0;
        let mut windows = Vec::with_capacity(labelled.len());
        let mut targets = Vec::with_capacity(labelled.len());
        for (example, target) in &labelled {
            let (window, filled) = standardize_window(&scaler, example, rows, width)?;
            imputed_cells += filled;
            windows.push(window);
            targets.push(*target);
        }

        let mut model = BaseModel::from_config(config);
        model.fit(&windows, &targets, ctx)?;

        let mut tickers: Vec<String> = labelled.iter().map(|(e, _)| e.key.ticker.clone()).collect();
        tickers.sort();
        tickers.dedup();

        let version = Self::version_for(config, &spec)?;
        info!(
            %family,
            %version,
            rows = labelled.len(),
            imputed_cells,
            window = %format!("{}..={}", spec.window.first_quarter, spec.window.last_quarter),
            "model artifact trained"
        );

        Ok(Self {
            version,
            family,
            hyperparameters: config.clone(),
            trained_on: spec.window,
            row_count: labelled.len(),
            tickers,
            feature_set: spec.feature_set,
            feature_names: spec.feature_names,
            scaler,
            model,
            imputed_cells,
            trained_at,
            dataset_hash: spec.dataset_hash,
        })
    }

    /// Price-space estimate for the quarter after `example`'s quarter.
    pub fn predict(&self, example: &Example) -> Result<Estimate, ModelError> {
        let (window, _) = standardize_window(
            &self.scaler,
            example,
            self.hyperparameters.history_rows(),
            self.feature_names.len(),
        )?;
        let (log_return, variance) = self.model.predict_with_variance(&window)?;
        let point = example.previous_actual * log_return.exp();
        if !point.is_finite() {
            return Err(ModelError::Convergence {
                family: self.family,
                detail: format!("non-finite estimate for {}", example.key),
            });
        }
        Ok(Estimate {
            family: self.family,
            version: self.version.clone(),
            point,
            log_return,
            variance: variance.map(|v| point * point * v),
        })
    }

    pub fn to_json(&self) -> Result<String, ModelError> {
        serde_json::to_string_pretty(self).map_err(|e| ModelError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, ModelError> {
        serde_json::from_str(json).map_err(|e| ModelError::Serialization(e.to_string()))
    }

    pub fn version(&self) -> &ModelVersion {
        &self.version
    }

    pub fn family(&self) -> ModelFamily {
        self.family
    }

    pub fn hyperparameters(&self) -> &ModelConfig {
        &self.hyperparameters
    }

    pub fn trained_on(&self) -> &TrainingWindow {
        &self.trained_on
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn tickers(&self) -> &[String] {
        &self.tickers
    }

    pub fn feature_set(&self) -> &FeatureSetVersion {
        &self.feature_set
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn imputed_cells(&self) -> usize {
        self.imputed_cells
    }

    pub fn trained_at(&self) -> NaiveDateTime {
        self.trained_at
    }

    pub fn dataset_hash(&self) -> &DatasetHash {
        &self.dataset_hash
    }

    /// Named, normalised split-gain importances (tree ensemble only), highest first.
    pub fn feature_importance(&self) -> Option<Vec<(String, f64)>> {
        let BaseModel::TreeEnsemble(tree) = &self.model else {
            return None;
        };
        let mut named: Vec<(String, f64)> = self
            .feature_names
            .iter()
            .cloned()
            .zip(tree.feature_importance().iter().copied())
            .collect();
        named.sort_by(|a, b| b.1.total_cmp(&a.1));
        Some(named)
    }
}

/// Last `rows` feature rows of the example, standardised; missing leading rows
/// (short histories) become all-zero rows. Returns the window and the number of
/// cells filled in the current-quarter row.
fn standardize_window(
    scaler: &Standardizer,
    example: &Example,
    rows: usize,
    width: usize,
) -> Result<(Vec<Vec<f64>>, usize), ModelError> {
    if example.window.iter().any(|r| r.len() != width) {
        return Err(ModelError::ShapeMismatch {
            expected: format!("{width} features per row"),
            got: format!("ragged window for {}", example.key),
        });
    }
    let available = example.window.len().min(rows);
    let mut window = vec![vec![0.0; width]; rows - available];
    let mut filled_last = 0;
    let tail = &example.window[example.window.len() - available..];
    for (i, raw) in tail.iter().enumerate() {
        let (dense, filled) = scaler.transform(raw);
        if i + 1 == tail.len() {
            filled_last = filled;
        }
        window.push(dense);
    }
    Ok((window, filled_last))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::QuarterKey;
    use crate::model::TreeParams;

    fn q(s: &str) -> FiscalQuarter {
        s.parse().unwrap()
    }

    fn examples() -> Vec<Example> {
        let mut out = Vec::new();
        let mut quarter = q("2018Q1");
        for i in 0..24 {
            let momentum = if i % 2 == 0 { 0.05 } else { -0.05 };
            let price = 100.0 + i as f64;
            out.push(Example {
                key: QuarterKey::new("7203.T", quarter),
                window: vec![vec![Some(momentum), if i % 5 == 0 { None } else { Some(1.0) }]],
                previous_actual: price,
                target: Some(price * (1.0 + momentum)),
                coverage: 1.0,
            });
            quarter = quarter.next();
        }
        out
    }

    fn spec() -> ArtifactSpec {
        ArtifactSpec {
            feature_set: FeatureSetVersion::from_definition("t", b"[]"),
            feature_names: vec!["momentum".into(), "flag".into()],
            window: TrainingWindow::new(q("2018Q1"), q("2022Q4")),
            dataset_hash: DatasetHash::from_bytes(b"snap"),
            row_digest: String::new(),
        }
    }

    fn trained_at() -> NaiveDateTime {
        NaiveDateTime::default()
    }

    #[test]
    fn fit_predict_and_round_trip() {
        let ex = examples();
        let refs: Vec<&Example> = ex.iter().collect();
        let config = ModelConfig::TreeEnsemble(TreeParams::default());
        let artifact =
            ModelArtifact::fit(&config, &refs, spec(), &FitContext::unbounded(), trained_at())
                .unwrap();
        // 2018Q1..=2022Q4 is 20 quarters; the last four examples are outside.
        assert_eq!(artifact.row_count(), 20);
        assert_eq!(artifact.imputed_cells(), 4);
        assert_eq!(artifact.tickers(), ["7203.T".to_string()]);

        let probe = &ex[22];
        let est = artifact.predict(probe).unwrap();
        assert!(est.point > probe.previous_actual);
        assert_eq!(est.variance, None);

        let back = ModelArtifact::from_json(&artifact.to_json().unwrap()).unwrap();
        assert_eq!(back.version(), artifact.version());
        assert_eq!(back.predict(probe).unwrap().point, est.point);
    }

    #[test]
    fn version_is_deterministic_and_sensitive() {
        let config = ModelConfig::TreeEnsemble(TreeParams::default());
        let a = ModelArtifact::version_for(&config, &spec()).unwrap();
        assert_eq!(a, ModelArtifact::version_for(&config, &spec()).unwrap());
        let mut other = spec();
        other.window = TrainingWindow::new(q("2018Q1"), q("2022Q3"));
        assert_ne!(a, ModelArtifact::version_for(&config, &other).unwrap());

        let ex = examples();
        let all: Vec<&Example> = ex.iter().collect();
        let mut fewer = spec();
        fewer.row_digest = ArtifactSpec::digest_rows(&all[1..]);
        let mut more = spec();
        more.row_digest = ArtifactSpec::digest_rows(&all);
        assert_ne!(
            ModelArtifact::version_for(&config, &fewer).unwrap(),
            ModelArtifact::version_for(&config, &more).unwrap()
        );
    }

    #[test]
    fn importance_is_named() {
        let ex = examples();
        let refs: Vec<&Example> = ex.iter().collect();
        let config = ModelConfig::TreeEnsemble(TreeParams::default());
        let artifact =
            ModelArtifact::fit(&config, &refs, spec(), &FitContext::unbounded(), trained_at())
                .unwrap();
        let imp = artifact.feature_importance().unwrap();
        assert_eq!(imp[0].0, "momentum");
    }

    #[test]
    fn short_window_is_padded() {
        let scaler = Standardizer::fit(&[vec![Some(1.0)]], 1);
        let ex = Example {
            key: QuarterKey::new("X", q("2020Q1")),
            window: vec![vec![Some(2.0)]],
            previous_actual: 1.0,
            target: None,
            coverage: 1.0,
        };
        let (window, _) = standardize_window(&scaler, &ex, 3, 1).unwrap();
        assert_eq!(window.len(), 3);
        assert_eq!(window[0], vec![0.0]);
    }
}
