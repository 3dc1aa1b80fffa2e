//! Dataset assembly: snapshot → aligned history → features → supervised examples.
//!
//! Tickers are processed in parallel; each reads the same immutable snapshot and
//! produces its own rows, so there is no shared mutable state. A failure for one
//! (ticker, quarter) is logged and skipped without affecting the rest.

use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use qforecast_core::domain::{DatasetHash, FeatureSetVersion, FiscalQuarter};
use qforecast_core::model::{Example, TrainingWindow};
use qforecast_core::{align_ticker, build_features, AlignError, FeatureSet, ObservationSnapshot};

use crate::config::PipelineConfig;

/// Supervised examples for a run, ordered by (origin quarter, ticker).
#[derive(Debug, Clone)]
pub struct Dataset {
    pub examples: Vec<Example>,
    pub feature_names: Vec<String>,
    pub feature_set: FeatureSetVersion,
    pub dataset_hash: DatasetHash,
    /// Per-quarter alignment failures, kept for reporting.
    pub gaps: Vec<AlignError>,
}

#[derive(Serialize)]
struct DatasetIdentity<'a> {
    snapshot: &'a str,
    feature_set: &'a FeatureSetVersion,
    quarters: (FiscalQuarter, FiscalQuarter),
    tickers: Vec<&'a str>,
    target_series: &'a str,
    issue_lag_days: u32,
    window_rows: usize,
}

impl Dataset {
    /// Distinct origin quarters, ascending.
    pub fn quarters(&self) -> Vec<FiscalQuarter> {
        let mut quarters: Vec<FiscalQuarter> = self.examples.iter().map(|e| e.quarter()).collect();
        quarters.dedup();
        quarters
    }

    /// Origin quarters whose examples carry a realised target.
    pub fn labelled_quarters(&self) -> Vec<FiscalQuarter> {
        let mut quarters: Vec<FiscalQuarter> = self
            .examples
            .iter()
            .filter(|e| e.target.is_some())
            .map(|e| e.quarter())
            .collect();
        quarters.dedup();
        quarters
    }

    /// Examples whose origin quarter lies inside `window`.
    pub fn in_window(&self, window: &TrainingWindow) -> Vec<&Example> {
        self.examples
            .iter()
            .filter(|e| window.contains(e.quarter()))
            .collect()
    }

    /// Examples for one origin quarter.
    pub fn at(&self, quarter: FiscalQuarter) -> Vec<&Example> {
        self.examples.iter().filter(|e| e.quarter() == quarter).collect()
    }

    /// Latest example per ticker (the forecast origin for live predictions).
    pub fn latest_per_ticker(&self) -> Vec<&Example> {
        let mut latest: BTreeMap<&str, &Example> = BTreeMap::new();
        for e in &self.examples {
            latest.insert(e.key.ticker.as_str(), e);
        }
        latest.into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }
}

/// Build examples for every configured ticker over `quarters`.
///
/// The target of an example at quarter Q is the aligned price at Q+1; the
/// example for the last aligned quarter stays unlabelled and serves as the live
/// forecast origin.
pub fn build_dataset(
    snapshot: &ObservationSnapshot,
    config: &PipelineConfig,
    feature_set: &FeatureSet,
    quarters: &[FiscalQuarter],
) -> Dataset {
    let names = feature_set.names();
    let width = names.len();
    let window_rows = config.window_rows();
    let target = config.target_series.as_str();

    let per_ticker: Vec<(Vec<Example>, Vec<AlignError>)> = config
        .universe
        .par_iter()
        .map(|ticker| {
            let symbol = ticker.symbol.as_str();
            let history = align_ticker(snapshot, symbol, quarters, &config.series, &config.alignment);

            let mut dense: BTreeMap<FiscalQuarter, (Vec<Option<f64>>, f64)> = BTreeMap::new();
            for quarter in history.quarters() {
                match build_features(&history, quarter, feature_set) {
                    Ok(fv) => {
                        dense.insert(quarter, (fv.to_dense(&names), fv.coverage()));
                    }
                    Err(e) => warn!(ticker = symbol, %quarter, error = %e, "features not built"),
                }
            }

            let mut examples = Vec::new();
            for row in &history.rows {
                let Some((_, coverage)) = dense.get(&row.quarter) else {
                    continue;
                };
                let Some(previous) = row.get(target).filter(|p| *p > 0.0) else {
                    debug!(ticker = symbol, quarter = %row.quarter, "no positive price; row skipped");
                    continue;
                };
                let window: Vec<Vec<Option<f64>>> = (0..window_rows)
                    .rev()
                    .map(|back| {
                        dense
                            .get(&row.quarter.offset(-(back as i32)))
                            .map(|(v, _)| v.clone())
                            .unwrap_or_else(|| vec![None; width])
                    })
                    .collect();
                let label = history
                    .row(row.quarter.next())
                    .and_then(|next| next.get(target));
                examples.push(Example {
                    key: row.key.clone(),
                    window,
                    previous_actual: previous,
                    target: label,
                    coverage: *coverage,
                });
            }
            (examples, history.gaps)
        })
        .collect();

    let mut examples = Vec::new();
    let mut gaps = Vec::new();
    for (e, g) in per_ticker {
        examples.extend(e);
        gaps.extend(g);
    }
    examples.sort_by(|a, b| (a.quarter(), &a.key.ticker).cmp(&(b.quarter(), &b.key.ticker)));

    let snapshot_hash = snapshot.dataset_hash();
    let identity = DatasetIdentity {
        snapshot: &snapshot_hash.0,
        feature_set: feature_set.version(),
        quarters: (
            quarters.iter().copied().min().unwrap_or(config.first_quarter),
            quarters.iter().copied().max().unwrap_or(config.first_quarter),
        ),
        tickers: config.universe.iter().map(|t| t.symbol.as_str()).collect(),
        target_series: target,
        issue_lag_days: config.alignment.issue_lag_days,
        window_rows,
    };
    let dataset_hash = match serde_json::to_vec(&identity) {
        Ok(bytes) => DatasetHash::from_bytes(&bytes),
        Err(_) => snapshot_hash.combine(&feature_set.version().to_string()),
    };

    info!(
        examples = examples.len(),
        labelled = examples.iter().filter(|e| e.target.is_some()).count(),
        gaps = gaps.len(),
        tickers = config.universe.len(),
        "dataset built"
    );

    Dataset {
        examples,
        feature_names: names,
        feature_set: feature_set.version().clone(),
        dataset_hash,
        gaps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{sample_config, synthetic_snapshot};

    #[test]
    fn labels_come_from_next_quarter() {
        let config = sample_config();
        let snapshot = synthetic_snapshot(&config, 12);
        let set = config.feature_set().unwrap();
        let quarters = FiscalQuarter::range(config.first_quarter, config.first_quarter.offset(11));
        let ds = build_dataset(&snapshot, &config, &set, &quarters);

        assert_eq!(ds.len(), 12 * config.universe.len());
        for pair in ds.examples.windows(2) {
            assert!(pair[0].quarter() <= pair[1].quarter());
        }
        let by_key: BTreeMap<_, _> = ds.examples.iter().map(|e| (e.key.clone(), e)).collect();
        for e in &ds.examples {
            match by_key.get(&e.target_key()) {
                Some(next) => assert_eq!(e.target, Some(next.previous_actual)),
                None => assert_eq!(e.target, None),
            }
            assert_eq!(e.window.len(), config.window_rows());
        }
        assert_eq!(ds.latest_per_ticker().len(), config.universe.len());
        assert!(ds.latest_per_ticker().iter().all(|e| e.target.is_none()));
    }

    #[test]
    fn hash_is_stable_and_snapshot_sensitive() {
        let config = sample_config();
        let set = config.feature_set().unwrap();
        let quarters = FiscalQuarter::range(config.first_quarter, config.first_quarter.offset(7));
        let a = build_dataset(&synthetic_snapshot(&config, 8), &config, &set, &quarters);
        let b = build_dataset(&synthetic_snapshot(&config, 8), &config, &set, &quarters);
        let c = build_dataset(&synthetic_snapshot(&config, 9), &config, &set, &quarters);
        assert_eq!(a.dataset_hash, b.dataset_hash);
        assert_ne!(a.dataset_hash, c.dataset_hash);
    }
}
