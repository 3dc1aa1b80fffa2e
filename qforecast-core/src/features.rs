//! Feature Builder — versioned, pure transforms from aligned history to features.
//!
//! A `FeatureSet` is a validated list of typed `FeatureDef`s. Its version is the
//! label plus a BLAKE3 hash of the canonical JSON of the definitions, so any change
//! to feature logic produces a new version.
//!
//! `build_features` sees only rows with quarter ≤ the target quarter, and lags are
//! resolved by quarter arithmetic rather than row position, so a hole in the
//! history yields a missing lag instead of silently reading an older row.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::align::{AlignedHistory, AlignedRow};
use crate::domain::{FeatureSetVersion, FiscalQuarter, QuarterKey};

// ─── Definitions ─────────────────────────────────────────────────────

/// Longest history a feature may read, in quarters (a century).
pub const MAX_LOOKBACK: u32 = 400;

/// A single engineered feature over one aligned slot.
///
/// Percentage change over several periods doubles as a momentum feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeatureDef {
    /// Slot value `lag` quarters back (0 = current quarter).
    Level { name: String, slot: String, lag: u32 },
    /// `v[t] / v[t - periods] - 1`.
    PctChange { name: String, slot: String, periods: u32 },
    /// `v[t] - v[t - periods]`.
    Difference { name: String, slot: String, periods: u32 },
    /// `v[t] / mean(v[t - window + 1 ..= t])`.
    MovingAverageRatio { name: String, slot: String, window: u32 },
    /// Sample standard deviation of the last `window` quarterly log returns.
    Volatility { name: String, slot: String, window: u32 },
    /// Relative strength index over the last `window` quarterly changes, 0–100.
    Rsi { name: String, slot: String, window: u32 },
    /// Event count slot; a missing count falls back to 0 and is recorded as imputed.
    EventCount { name: String, slot: String },
}

impl FeatureDef {
    pub fn name(&self) -> &str {
        match self {
            Self::Level { name, .. }
            | Self::PctChange { name, .. }
            | Self::Difference { name, .. }
            | Self::MovingAverageRatio { name, .. }
            | Self::Volatility { name, .. }
            | Self::Rsi { name, .. }
            | Self::EventCount { name, .. } => name,
        }
    }

    pub fn slot(&self) -> &str {
        match self {
            Self::Level { slot, .. }
            | Self::PctChange { slot, .. }
            | Self::Difference { slot, .. }
            | Self::MovingAverageRatio { slot, .. }
            | Self::Volatility { slot, .. }
            | Self::Rsi { slot, .. }
            | Self::EventCount { slot, .. } => slot,
        }
    }

    /// Quarters of history (beyond the current one) this feature reads.
    pub fn lookback(&self) -> u32 {
        match self {
            Self::Level { lag, .. } => *lag,
            Self::PctChange { periods, .. } | Self::Difference { periods, .. } => *periods,
            Self::MovingAverageRatio { window, .. } => window.saturating_sub(1),
            Self::Volatility { window, .. } | Self::Rsi { window, .. } => *window,
            Self::EventCount { .. } => 0,
        }
    }

    fn validate(&self) -> Result<(), FeatureError> {
        let invalid = |reason: &str| {
            Err(FeatureError::InvalidWindow {
                name: self.name().to_string(),
                reason: reason.to_string(),
            })
        };
        if self.lookback() > MAX_LOOKBACK {
            return invalid(&format!(
                "reads {} quarters back, more than {MAX_LOOKBACK}",
                self.lookback()
            ));
        }
        match self {
            Self::PctChange { periods, .. } | Self::Difference { periods, .. } if *periods == 0 => {
                invalid("periods must be at least 1")
            }
            Self::MovingAverageRatio { window, .. } | Self::Rsi { window, .. } if *window == 0 => {
                invalid("window must be at least 1")
            }
            Self::Volatility { window, .. } if *window < 2 => invalid("window must be at least 2"),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeatureError {
    #[error("feature set '{0}' has no features")]
    EmptyFeatureSet(String),

    #[error("duplicate feature name '{0}'")]
    DuplicateName(String),

    #[error("feature '{name}': {reason}")]
    InvalidWindow { name: String, reason: String },

    #[error("no aligned row for {0}")]
    MissingRow(QuarterKey),

    #[error("cannot serialize feature definitions: {0}")]
    Serialization(String),
}

// ─── Feature set ─────────────────────────────────────────────────────

/// Validated, versioned list of feature definitions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureSet {
    version: FeatureSetVersion,
    defs: Vec<FeatureDef>,
}

impl FeatureSet {
    pub fn new(label: &str, defs: Vec<FeatureDef>) -> Result<Self, FeatureError> {
        if defs.is_empty() {
            return Err(FeatureError::EmptyFeatureSet(label.to_string()));
        }
        let mut names = BTreeSet::new();
        for def in &defs {
            if !names.insert(def.name()) {
                return Err(FeatureError::DuplicateName(def.name().to_string()));
            }
            def.validate()?;
        }
        let canonical =
            serde_json::to_vec(&defs).map_err(|e| FeatureError::Serialization(e.to_string()))?;
        Ok(Self {
            version: FeatureSetVersion::from_definition(label, &canonical),
            defs,
        })
    }

    pub fn version(&self) -> &FeatureSetVersion {
        &self.version
    }

    pub fn defs(&self) -> &[FeatureDef] {
        &self.defs
    }

    /// Feature names in definition order (the dense column order).
    pub fn names(&self) -> Vec<String> {
        self.defs.iter().map(|d| d.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// Longest history any feature reads.
    pub fn max_lookback(&self) -> u32 {
        self.defs.iter().map(FeatureDef::lookback).max().unwrap_or(0)
    }
}

// ─── Feature vectors ─────────────────────────────────────────────────

/// Features for one QuarterKey. `None` marks a missing feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub key: QuarterKey,
    pub feature_set: FeatureSetVersion,
    pub values: BTreeMap<String, Option<f64>>,
    /// Features filled by an explicit fallback rather than observed data.
    pub imputed: BTreeSet<String>,
}

impl FeatureVector {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied().flatten()
    }

    /// Fraction of features with an observed (non-imputed) value.
    pub fn coverage(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let observed = self
            .values
            .iter()
            .filter(|(k, v)| v.is_some() && !self.imputed.contains(*k))
            .count();
        observed as f64 / self.values.len() as f64
    }

    /// Values in the given column order.
    pub fn to_dense(&self, names: &[String]) -> Vec<Option<f64>> {
        names.iter().map(|n| self.get(n)).collect()
    }
}

/// Visible history for one target quarter.
struct View<'a> {
    rows: BTreeMap<FiscalQuarter, &'a AlignedRow>,
    target: FiscalQuarter,
}

impl View<'_> {
    fn value(&self, slot: &str, back: u32) -> Option<f64> {
        let back = i32::try_from(back).ok()?;
        let quarter = self.target.offset(-back);
        if quarter > self.target {
            return None;
        }
        self.rows.get(&quarter).and_then(|r| r.get(slot))
    }

    /// `count + 1` consecutive values ending at the target, oldest first.
    fn trailing(&self, slot: &str, count: u32) -> Option<Vec<f64>> {
        (0..=count).rev().map(|back| self.value(slot, back)).collect()
    }
}

fn eval(def: &FeatureDef, view: &View<'_>) -> Option<f64> {
    let finite = |v: f64| v.is_finite().then_some(v);
    match def {
        FeatureDef::Level { slot, lag, .. } => view.value(slot, *lag),
        FeatureDef::PctChange { slot, periods, .. } => {
            let now = view.value(slot, 0)?;
            let base = view.value(slot, *periods)?;
            if base == 0.0 {
                return None;
            }
            finite(now / base - 1.0)
        }
        FeatureDef::Difference { slot, periods, .. } => {
            Some(view.value(slot, 0)? - view.value(slot, *periods)?)
        }
        FeatureDef::MovingAverageRatio { slot, window, .. } => {
            let values = view.trailing(slot, window - 1)?;
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            if mean == 0.0 {
                return None;
            }
            finite(values[values.len() - 1] / mean)
        }
        FeatureDef::Volatility { slot, window, .. } => {
            let values = view.trailing(slot, *window)?;
            if values.iter().any(|v| *v <= 0.0) {
                return None;
            }
            let returns: Vec<f64> = values.windows(2).map(|w| (w[1] / w[0]).ln()).collect();
            let mean = returns.iter().sum::<f64>() / returns.len() as f64;
            let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>()
                / (returns.len() - 1) as f64;
            finite(var.sqrt())
        }
        FeatureDef::Rsi { slot, window, .. } => {
            let values = view.trailing(slot, *window)?;
            let (gain, loss) = values.windows(2).fold((0.0, 0.0), |(g, l), w| {
                let d = w[1] - w[0];
                if d > 0.0 {
                    (g + d, l)
                } else {
                    (g, l - d)
                }
            });
            if gain + loss == 0.0 {
                return Some(50.0);
            }
            finite(100.0 * gain / (gain + loss))
        }
        FeatureDef::EventCount { slot, .. } => view.value(slot, 0),
    }
}

/// Build the feature vector for `quarter` from a ticker's aligned history.
///
/// Pure and deterministic: the same history and feature set always give the same
/// vector. Rows after `quarter` are never read.
pub fn build_features(
    history: &AlignedHistory,
    quarter: FiscalQuarter,
    set: &FeatureSet,
) -> Result<FeatureVector, FeatureError> {
    let key = QuarterKey::new(history.ticker.as_str(), quarter);
    if history.row(quarter).is_none() {
        return Err(FeatureError::MissingRow(key));
    }
    let view = View {
        rows: history
            .rows_through(quarter)
            .iter()
            .map(|r| (r.quarter, r))
            .collect(),
        target: quarter,
    };

    let mut values = BTreeMap::new();
    let mut imputed = BTreeSet::new();
    for def in set.defs() {
        let mut value = eval(def, &view);
        if value.is_none() && matches!(def, FeatureDef::EventCount { .. }) {
            value = Some(0.0);
            imputed.insert(def.name().to_string());
        }
        values.insert(def.name().to_string(), value);
    }

    Ok(FeatureVector {
        key,
        feature_set: set.version().clone(),
        values,
        imputed,
    })
}

/// Feature vectors for every aligned quarter of a ticker.
pub fn build_history_features(history: &AlignedHistory, set: &FeatureSet) -> Vec<FeatureVector> {
    history
        .quarters()
        .filter_map(|q| build_features(history, q, set).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn q(s: &str) -> FiscalQuarter {
        s.parse().unwrap()
    }

    fn row(quarter: &str, close: Option<f64>) -> AlignedRow {
        let quarter = q(quarter);
        let mut values = BTreeMap::new();
        values.insert("close".to_string(), close);
        AlignedRow {
            key: QuarterKey::new("7203.T", quarter),
            quarter,
            cutoff: NaiveDateTime::default(),
            values,
        }
    }

    fn history(rows: Vec<AlignedRow>) -> AlignedHistory {
        AlignedHistory {
            ticker: "7203.T".into(),
            rows,
            gaps: vec![],
        }
    }

    fn set() -> FeatureSet {
        FeatureSet::new(
            "test",
            vec![
                FeatureDef::Level { name: "close".into(), slot: "close".into(), lag: 0 },
                FeatureDef::Level { name: "close_l1".into(), slot: "close".into(), lag: 1 },
                FeatureDef::PctChange { name: "ret1".into(), slot: "close".into(), periods: 1 },
                FeatureDef::MovingAverageRatio { name: "ma2".into(), slot: "close".into(), window: 2 },
                FeatureDef::EventCount { name: "boj_n".into(), slot: "boj_events".into() },
            ],
        )
        .unwrap()
    }

    #[test]
    fn lags_and_ratios() {
        let h = history(vec![row("2023Q1", Some(100.0)), row("2023Q2", Some(110.0))]);
        let fv = build_features(&h, q("2023Q2"), &set()).unwrap();
        assert_eq!(fv.get("close"), Some(110.0));
        assert_eq!(fv.get("close_l1"), Some(100.0));
        assert!((fv.get("ret1").unwrap() - 0.1).abs() < 1e-12);
        assert!((fv.get("ma2").unwrap() - 110.0 / 105.0).abs() < 1e-12);
    }

    #[test]
    fn future_rows_never_read() {
        let h = history(vec![row("2023Q1", Some(100.0)), row("2023Q2", Some(110.0))]);
        let fv = build_features(&h, q("2023Q1"), &set()).unwrap();
        assert_eq!(fv.get("close"), Some(100.0));
        assert_eq!(fv.get("close_l1"), None);
        assert_eq!(fv.get("ret1"), None);
    }

    #[test]
    fn lag_resolved_by_quarter_not_position() {
        // 2023Q2 is missing: the lag for Q3 must not read Q1.
        let h = history(vec![row("2023Q1", Some(100.0)), row("2023Q3", Some(120.0))]);
        let fv = build_features(&h, q("2023Q3"), &set()).unwrap();
        assert_eq!(fv.get("close_l1"), None);
    }

    #[test]
    fn event_count_fallback_is_recorded() {
        let h = history(vec![row("2023Q1", Some(100.0))]);
        let fv = build_features(&h, q("2023Q1"), &set()).unwrap();
        assert_eq!(fv.get("boj_n"), Some(0.0));
        assert!(fv.imputed.contains("boj_n"));
        // close present; close_l1, ret1, ma2 missing; boj_n imputed.
        assert!((fv.coverage() - 0.2).abs() < 1e-12);
    }

    #[test]
    fn rebuild_is_idempotent() {
        let h = history(vec![row("2023Q1", Some(100.0)), row("2023Q2", None)]);
        let a = build_features(&h, q("2023Q2"), &set()).unwrap();
        let b = build_features(&h, q("2023Q2"), &set()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn missing_row_is_error() {
        let h = history(vec![row("2023Q1", Some(100.0))]);
        assert!(matches!(
            build_features(&h, q("2023Q4"), &set()),
            Err(FeatureError::MissingRow(_))
        ));
    }

    #[test]
    fn version_tracks_definitions() {
        let a = set();
        let b = FeatureSet::new(
            "test",
            vec![FeatureDef::Level { name: "close".into(), slot: "close".into(), lag: 1 }],
        )
        .unwrap();
        assert_eq!(a.version().label, b.version().label);
        assert_ne!(a.version(), b.version());
        assert_eq!(a.version(), set().version());
    }

    #[test]
    fn invalid_sets_rejected() {
        assert!(matches!(
            FeatureSet::new("x", vec![]),
            Err(FeatureError::EmptyFeatureSet(_))
        ));
        let dup = vec![
            FeatureDef::Level { name: "a".into(), slot: "close".into(), lag: 0 },
            FeatureDef::Level { name: "a".into(), slot: "close".into(), lag: 1 },
        ];
        assert_eq!(
            FeatureSet::new("x", dup),
            Err(FeatureError::DuplicateName("a".into()))
        );
        let vol = vec![FeatureDef::Volatility { name: "v".into(), slot: "close".into(), window: 1 }];
        assert!(matches!(
            FeatureSet::new("x", vol),
            Err(FeatureError::InvalidWindow { .. })
        ));
    }

    #[test]
    fn oversized_lookback_rejected() {
        for def in [
            FeatureDef::Level { name: "l".into(), slot: "close".into(), lag: u32::MAX },
            FeatureDef::PctChange { name: "p".into(), slot: "close".into(), periods: 1 << 31 },
            FeatureDef::Rsi { name: "r".into(), slot: "close".into(), window: MAX_LOOKBACK + 1 },
        ] {
            assert!(matches!(
                FeatureSet::new("x", vec![def]),
                Err(FeatureError::InvalidWindow { .. })
            ));
        }
        let edge = FeatureDef::Level { name: "l".into(), slot: "close".into(), lag: MAX_LOOKBACK };
        let fs = FeatureSet::new("x", vec![edge]).unwrap();
        let h = history(vec![row("2023Q1", Some(1.0))]);
        let v = build_features(&h, q("2023Q1"), &fs).unwrap();
        assert_eq!(v.get("l"), None);
    }

    #[test]
    fn unreachable_lag_reads_nothing() {
        let h = history(vec![row("2023Q1", Some(1.0))]);
        let view = View {
            rows: h.rows.iter().map(|r| (r.quarter, r)).collect(),
            target: q("2023Q1"),
        };
        assert_eq!(view.value("close", u32::MAX), None);
        assert_eq!(view.value("close", 0), Some(1.0));
    }

    #[test]
    fn zero_window_rejected() {
        let vol = vec![FeatureDef::Volatility { name: "v".into(), slot: "close".into(), window: 1 }];
        assert!(matches!(
            FeatureSet::new("x", vol),
            Err(FeatureError::InvalidWindow { .. })
        ));
    }

    #[test]
    fn volatility_and_rsi() {
        let h = history(vec![
            row("2023Q1", Some(100.0)),
            row("2023Q2", Some(110.0)),
            row("2023Q3", Some(99.0)),
        ]);
        let fs = FeatureSet::new(
            "t",
            vec![
                FeatureDef::Volatility { name: "vol".into(), slot: "close".into(), window: 2 },
                FeatureDef::Rsi { name: "rsi".into(), slot: "close".into(), window: 2 },
            ],
        )
        .unwrap();
        let fv = build_features(&h, q("2023Q3"), &fs).unwrap();
        assert!(fv.get("vol").unwrap() > 0.0);
        assert!((fv.get("rsi").unwrap() - 100.0 * 10.0 / 21.0).abs() < 1e-9);
    }
}
