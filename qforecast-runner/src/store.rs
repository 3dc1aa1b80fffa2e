//! Prediction Store — append-only prediction log, latest-per-ticker lookup with
//! staleness, and the promoted-release pointer.
//!
//! Writes go to the JSONL journal first and only then become visible: the
//! in-memory state is an immutable snapshot behind an `Arc`, rebuilt by the
//! single writer and swapped in one step. Readers clone the `Arc` and never
//! observe a half-applied write.
//!
//! Promotion and rollback are journal events too, so the release pointer and
//! its lineage survive restarts and every transition is auditable.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use qforecast_core::domain::{EnsembleVersion, FeatureSetVersion, FiscalQuarter, Prediction, QuarterKey};

use crate::journal::Journal;

// ─── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Days after the target quarter closes before an unrefreshed prediction is
    /// flagged stale.
    pub grace_days: i64,
}

// ─── Types ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("prediction store I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no prediction recorded for {0}")]
    NotFound(String),

    #[error("no earlier release to roll back to")]
    NoPreviousRelease,
}

/// A promoted ensemble generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub version: EnsembleVersion,
    pub feature_set: FeatureSetVersion,
    /// Version of the aggregate evaluation report that passed the gate.
    pub report_version: String,
    pub mape: Option<f64>,
    pub directional_accuracy: Option<f64>,
    pub promoted_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReleaseEvent {
    Promoted { release: Release },
    RolledBack {
        from: EnsembleVersion,
        to: EnsembleVersion,
        at: NaiveDateTime,
    },
}

/// A served prediction with its staleness flag.
#[derive(Debug, Clone, PartialEq)]
pub struct ServedPrediction {
    pub prediction: Arc<Prediction>,
    pub stale: bool,
}

/// A past prediction joined with the realised price, when known.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionOutcome {
    pub prediction: Prediction,
    pub actual: Option<f64>,
    pub error_pct: Option<f64>,
}

#[derive(Debug, Default)]
struct StoreState {
    /// Per ticker, ordered by (target quarter, generated_at).
    by_ticker: BTreeMap<String, Vec<Arc<Prediction>>>,
    /// Active release lineage; the last entry is serving.
    lineage: Vec<Release>,
}

impl StoreState {
    fn with_predictions(&self, new: &[Prediction]) -> Self {
        let mut by_ticker = self.by_ticker.clone();
        for p in new {
            let list = by_ticker.entry(p.key.ticker.clone()).or_default();
            if list.iter().any(|existing| existing.as_ref() == p) {
                continue;
            }
            let pos = list.partition_point(|e| {
                (e.key.quarter(), e.generated_at) <= (p.key.quarter(), p.generated_at)
            });
            list.insert(pos, Arc::new(p.clone()));
        }
        Self {
            by_ticker,
            lineage: self.lineage.clone(),
        }
    }

    fn apply(&mut self, event: &ReleaseEvent) {
        match event {
            ReleaseEvent::Promoted { release } => {
                if self.current().map(|r| &r.version) != Some(&release.version) {
                    self.lineage.push(release.clone());
                }
            }
            ReleaseEvent::RolledBack { to, .. } => {
                while self.lineage.last().is_some_and(|r| &r.version != to) {
                    self.lineage.pop();
                }
            }
        }
    }

    fn current(&self) -> Option<&Release> {
        self.lineage.last()
    }
}

/// Newest by generation time among the predictions `keep` accepts.
fn newest_where(
    list: &[Arc<Prediction>],
    keep: impl Fn(&Prediction) -> bool,
) -> Option<&Arc<Prediction>> {
    list.iter()
        .filter(|p| keep(p.as_ref()))
        .max_by_key(|p| (p.generated_at, p.key.quarter()))
}

// ─── Store ───────────────────────────────────────────────────────────

pub struct PredictionStore {
    config: StoreConfig,
    predictions: Journal<Prediction>,
    releases: Journal<ReleaseEvent>,
    state: RwLock<Arc<StoreState>>,
    writer: Mutex<()>,
}

impl PredictionStore {
    /// Open (or create) a store under `dir`, replaying both journals.
    pub fn open(dir: &Path, config: StoreConfig) -> Result<Self, StoreError> {
        let predictions: Journal<Prediction> = Journal::new(dir.join("predictions.jsonl"));
        let releases: Journal<ReleaseEvent> = Journal::new(dir.join("releases.jsonl"));

        let recorded = predictions.read_all().map_err(|source| StoreError::Io {
            path: predictions.path().to_path_buf(),
            source,
        })?;
        let events = releases.read_all().map_err(|source| StoreError::Io {
            path: releases.path().to_path_buf(),
            source,
        })?;

        let mut state = StoreState::default().with_predictions(&recorded);
        for event in &events {
            state.apply(event);
        }
        info!(
            predictions = recorded.len(),
            release_events = events.len(),
            release = ?state.current().map(|r| r.version.to_string()),
            "prediction store opened"
        );

        Ok(Self {
            config,
            predictions,
            releases,
            state: RwLock::new(Arc::new(state)),
            writer: Mutex::new(()),
        })
    }

    fn snapshot(&self) -> Arc<StoreState> {
        Arc::clone(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn swap(&self, next: StoreState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
    }

    pub fn record(&self, prediction: Prediction) -> Result<(), StoreError> {
        self.record_all(&[prediction])
    }

    /// Append predictions; already-recorded identical predictions are skipped.
    pub fn record_all(&self, predictions: &[Prediction]) -> Result<(), StoreError> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.snapshot();
        let fresh: Vec<Prediction> = predictions
            .iter()
            .filter(|p| {
                !current
                    .by_ticker
                    .get(p.ticker())
                    .is_some_and(|list| list.iter().any(|e| e.as_ref() == *p))
            })
            .cloned()
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }
        self.predictions
            .append_all(&fresh)
            .map_err(|source| StoreError::Io {
                path: self.predictions.path().to_path_buf(),
                source,
            })?;
        self.swap(current.with_predictions(&fresh));
        Ok(())
    }

    /// Latest prediction for `ticker` by generation time. While a release is
    /// promoted its predictions are served first. A ticker the current release
    /// has not forecast yet falls back to its last-known-good prediction (newest
    /// from the release lineage, else newest overall), flagged stale.
    /// `NotFound` only when the ticker has never been forecast.
    pub fn latest(&self, ticker: &str, now: NaiveDateTime) -> Result<ServedPrediction, StoreError> {
        let state = self.snapshot();
        let list = state
            .by_ticker
            .get(ticker)
            .filter(|list| !list.is_empty())
            .ok_or_else(|| StoreError::NotFound(ticker.to_string()))?;
        let Some(release) = state.current() else {
            let newest = newest_where(list, |_| true)
                .ok_or_else(|| StoreError::NotFound(ticker.to_string()))?;
            return Ok(self.serve(ticker, newest, now));
        };
        if let Some(newest) = newest_where(list, |p| p.ensemble_version == release.version) {
            return Ok(self.serve(ticker, newest, now));
        }

        let fallback = newest_where(list, |p| {
            state.lineage.iter().any(|r| r.version == p.ensemble_version)
        })
        .or_else(|| newest_where(list, |_| true))
        .ok_or_else(|| StoreError::NotFound(ticker.to_string()))?;
        warn!(
            ticker,
            release = %release.version,
            serving = %fallback.ensemble_version,
            "no forecast under the current release; serving last known good"
        );
        Ok(ServedPrediction {
            prediction: Arc::clone(fallback),
            stale: true,
        })
    }

    fn serve(&self, ticker: &str, prediction: &Arc<Prediction>, now: NaiveDateTime) -> ServedPrediction {
        let stale = self.is_stale(prediction, now);
        if stale {
            warn!(ticker, target = %prediction.key, generated_at = %prediction.generated_at, "serving stale prediction");
        }
        ServedPrediction {
            prediction: Arc::clone(prediction),
            stale,
        }
    }

    /// Batch lookup; one ticker's absence does not affect the others.
    pub fn latest_many(
        &self,
        tickers: &[String],
        now: NaiveDateTime,
    ) -> Vec<(String, Result<ServedPrediction, StoreError>)> {
        tickers
            .iter()
            .map(|t| (t.clone(), self.latest(t, now)))
            .collect()
    }

    /// Stale once the target quarter has closed (plus grace) without a refresh.
    pub fn is_stale(&self, prediction: &Prediction, now: NaiveDateTime) -> bool {
        now > prediction.key.quarter().end_instant() + Duration::days(self.config.grace_days)
    }

    /// Predictions for `ticker` whose target quarter lies in `range` (inclusive),
    /// ordered by target quarter then generation time.
    pub fn history(
        &self,
        ticker: &str,
        range: Option<(FiscalQuarter, FiscalQuarter)>,
    ) -> Vec<Arc<Prediction>> {
        let state = self.snapshot();
        state
            .by_ticker
            .get(ticker)
            .map(|list| {
                list.iter()
                    .filter(|p| {
                        range.map_or(true, |(first, last)| {
                            p.key.quarter() >= first && p.key.quarter() <= last
                        })
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// History joined with realised prices.
    pub fn history_with_outcomes(
        &self,
        ticker: &str,
        range: Option<(FiscalQuarter, FiscalQuarter)>,
        actuals: &BTreeMap<QuarterKey, f64>,
    ) -> Vec<PredictionOutcome> {
        self.history(ticker, range)
            .into_iter()
            .map(|prediction| {
                let actual = actuals.get(&prediction.key).copied();
                let error_pct = actual.and_then(|a| prediction.error_pct(a));
                PredictionOutcome {
                    prediction: prediction.as_ref().clone(),
                    actual,
                    error_pct,
                }
            })
            .collect()
    }

    /// Point the store at a new release. Promoting the release that is already
    /// serving is a no-op and leaves the lineage unchanged.
    pub fn promote(&self, release: Release) -> Result<(), StoreError> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let version = release.version.clone();
        if self.snapshot().current().map(|r| &r.version) == Some(&version) {
            info!(%version, "release already serving");
            return Ok(());
        }
        let event = ReleaseEvent::Promoted { release };
        self.append_event(&event)?;
        let current = self.snapshot();
        let mut next = StoreState {
            by_ticker: current.by_ticker.clone(),
            lineage: current.lineage.clone(),
        };
        next.apply(&event);
        self.swap(next);
        info!(%version, "release promoted");
        Ok(())
    }

    pub fn current_release(&self) -> Option<Release> {
        self.snapshot().current().cloned()
    }

    /// Every release in the active lineage, oldest first.
    pub fn lineage(&self) -> Vec<Release> {
        self.snapshot().lineage.clone()
    }

    /// Restore the most recent release that differs from the current one.
    pub fn rollback(&self, at: NaiveDateTime) -> Result<Release, StoreError> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.snapshot();
        let from = current
            .current()
            .map(|r| r.version.clone())
            .ok_or(StoreError::NoPreviousRelease)?;
        let target = current
            .lineage
            .iter()
            .rev()
            .find(|r| r.version != from)
            .cloned()
            .ok_or(StoreError::NoPreviousRelease)?;
        let event = ReleaseEvent::RolledBack {
            from: from.clone(),
            to: target.version.clone(),
            at,
        };
        self.append_event(&event)?;
        let mut next = StoreState {
            by_ticker: current.by_ticker.clone(),
            lineage: current.lineage.clone(),
        };
        next.apply(&event);
        self.swap(next);
        info!(%from, to = %target.version, "release rolled back");
        Ok(target)
    }

    fn append_event(&self, event: &ReleaseEvent) -> Result<(), StoreError> {
        self.releases.append(event).map_err(|source| StoreError::Io {
            path: self.releases.path().to_path_buf(),
            source,
        })
    }
}
