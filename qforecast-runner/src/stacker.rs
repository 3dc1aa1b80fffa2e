//! Ensemble Stacker — blends base-model estimates into one `Prediction`.
//!
//! Two learned policies:
//! - **Linear**: weights on member point estimates fitted on out-of-fold rows,
//!   constrained to sum to 1 (optionally non-negative).
//! - **Meta-learner**: ridge regression from member log-returns to the realised
//!   log-return, fitted on out-of-fold rows only.
//!
//! With a single member the stacker is the identity but still versions itself.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use qforecast_core::domain::prediction::{change_pct, confidence_score};
use qforecast_core::domain::{
    EnsembleVersion, FeatureSetVersion, Interval, MemberEstimate, ModelVersion, Prediction,
    QuarterKey,
};
use qforecast_core::model::linalg::{self, RidgeFit};
use qforecast_core::model::{Estimate, ModelFamily};

// ─── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlendPolicy {
    Linear {
        #[serde(default = "default_true")]
        non_negative: bool,
        #[serde(default)]
        ridge: f64,
    },
    MetaLearner {
        #[serde(default = "default_meta_ridge")]
        ridge: f64,
    },
}

fn default_true() -> bool {
    true
}

fn default_meta_ridge() -> f64 {
    1e-2
}

impl Default for BlendPolicy {
    fn default() -> Self {
        Self::Linear {
            non_negative: true,
            ridge: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    pub policy: BlendPolicy,
    /// Trailing origin quarters of each training window held out to produce
    /// out-of-fold rows for the blend.
    pub validation_quarters: usize,
    /// Normal quantile used for the interval half-width.
    pub interval_z: f64,
    /// Smallest half-width as a fraction of the point estimate. Applies when
    /// members report no variance and no residual history exists yet.
    pub min_interval_band: f64,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            policy: BlendPolicy::default(),
            validation_quarters: 4,
            interval_z: 1.645,
            min_interval_band: 0.02,
        }
    }
}

impl EnsembleConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.validation_quarters == 0 {
            return Err("ensemble.validation_quarters must be at least 1".into());
        }
        if !(self.interval_z.is_finite() && self.interval_z > 0.0) {
            return Err(format!("ensemble.interval_z must be positive, got {}", self.interval_z));
        }
        if !(self.min_interval_band.is_finite() && self.min_interval_band >= 0.0) {
            return Err(format!(
                "ensemble.min_interval_band must be non-negative, got {}",
                self.min_interval_band
            ));
        }
        let ridge = match self.policy {
            BlendPolicy::Linear { ridge, .. } | BlendPolicy::MetaLearner { ridge } => ridge,
        };
        if !(ridge.is_finite() && ridge >= 0.0) {
            return Err(format!("ensemble ridge must be non-negative, got {ridge}"));
        }
        Ok(())
    }
}

// ─── Types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StackError {
    #[error("ensemble has no members")]
    NoMembers,

    #[error("no member estimate available for {0}")]
    NoEstimates(QuarterKey),

    #[error("ensemble version serialization failed: {0}")]
    Serialization(String),
}

/// One out-of-fold row: every member's estimate for a target quarter whose
/// price is now known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OofRow {
    pub key: QuarterKey,
    pub previous_actual: f64,
    pub actual: f64,
    pub members: BTreeMap<ModelFamily, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRef {
    pub family: ModelFamily,
    pub version: ModelVersion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Blend {
    Identity,
    Linear { weights: BTreeMap<ModelFamily, f64> },
    Meta { families: Vec<ModelFamily>, fit: RidgeFit },
}

/// Versioned blend over a fixed set of model artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleWeights {
    pub version: EnsembleVersion,
    pub members: Vec<MemberRef>,
    pub blend: Blend,
    /// Out-of-fold rows the blend was fitted on.
    pub fitted_on: usize,
}

#[derive(Serialize)]
struct VersionInput<'a> {
    members: &'a [MemberRef],
    blend: &'a Blend,
}

impl EnsembleWeights {
    fn new(members: Vec<MemberRef>, blend: Blend, fitted_on: usize) -> Result<Self, StackError> {
        let canonical = serde_json::to_vec(&VersionInput {
            members: &members,
            blend: &blend,
        })
        .map_err(|e| StackError::Serialization(e.to_string()))?;
        Ok(Self {
            version: EnsembleVersion::from_bytes(&canonical),
            members,
            blend,
            fitted_on,
        })
    }

    /// Linear weight per family; `None` for meta-learner blends.
    pub fn weights(&self) -> Option<BTreeMap<ModelFamily, f64>> {
        match &self.blend {
            Blend::Identity => Some(self.members.iter().map(|m| (m.family, 1.0)).collect()),
            Blend::Linear { weights } => Some(weights.clone()),
            Blend::Meta { .. } => None,
        }
    }

    pub fn families(&self) -> Vec<ModelFamily> {
        self.members.iter().map(|m| m.family).collect()
    }
}

// ─── Stacker ─────────────────────────────────────────────────────────

pub struct Stacker;

impl Stacker {
    /// Fit blend parameters on out-of-fold rows. Rows missing any member are
    /// ignored; too few rows fall back to equal weights.
    pub fn fit(
        policy: &BlendPolicy,
        members: Vec<MemberRef>,
        oof_rows: &[OofRow],
    ) -> Result<EnsembleWeights, StackError> {
        if members.is_empty() {
            return Err(StackError::NoMembers);
        }
        if members.len() == 1 {
            return EnsembleWeights::new(members, Blend::Identity, 0);
        }

        let families: Vec<ModelFamily> = members.iter().map(|m| m.family).collect();
        let rows: Vec<&OofRow> = oof_rows
            .iter()
            .filter(|r| r.previous_actual > 0.0 && r.actual > 0.0)
            .filter(|r| families.iter().all(|f| r.members.get(f).is_some_and(|p| *p > 0.0)))
            .collect();

        let blend = match policy {
            BlendPolicy::Linear { non_negative, ridge } => {
                let weights = if rows.len() < families.len() {
                    warn!(rows = rows.len(), members = families.len(), "too few out-of-fold rows; equal weights");
                    equal_weights(families.len())
                } else {
                    let (x, y) = relative_design(&families, &rows);
                    fit_simplex_weights(&x, &y, *non_negative, *ridge)
                };
                Blend::Linear {
                    weights: families.iter().copied().zip(weights).collect(),
                }
            }
            BlendPolicy::MetaLearner { ridge } => {
                let (x, y) = log_return_design(&families, &rows);
                match (rows.len() > families.len())
                    .then(|| linalg::ridge(&x, &y, *ridge))
                    .flatten()
                {
                    Some(fit) => Blend::Meta {
                        families: families.clone(),
                        fit,
                    },
                    None => {
                        warn!(rows = rows.len(), members = families.len(), "meta-learner not fitted; equal weights");
                        Blend::Linear {
                            weights: families
                                .iter()
                                .copied()
                                .zip(equal_weights(families.len()))
                                .collect(),
                        }
                    }
                }
            }
        };
        debug!(?blend, rows = rows.len(), "ensemble fitted");
        EnsembleWeights::new(members, blend, rows.len())
    }

    /// Blend member estimates for `key` (the target quarter) into a Prediction.
    ///
    /// Members without an estimate are dropped and the remaining linear weights
    /// renormalised; a meta-learner missing an input falls back to the mean.
    #[allow(clippy::too_many_arguments)]
    pub fn combine(
        weights: &EnsembleWeights,
        estimates: &[Estimate],
        key: QuarterKey,
        previous_actual: f64,
        residual_band: Option<f64>,
        config: &EnsembleConfig,
        feature_set: FeatureSetVersion,
        generated_at: NaiveDateTime,
    ) -> Result<Prediction, StackError> {
        let by_family: BTreeMap<ModelFamily, &Estimate> = estimates
            .iter()
            .filter(|e| weights.families().contains(&e.family))
            .map(|e| (e.family, e))
            .collect();
        if by_family.is_empty() {
            return Err(StackError::NoEstimates(key));
        }

        let (point, blend_weights) = match &weights.blend {
            Blend::Identity => {
                let only = by_family.values().next().copied();
                match only {
                    Some(e) => (e.point, vec![(e.family, 1.0)]),
                    None => return Err(StackError::NoEstimates(key)),
                }
            }
            Blend::Linear { weights: w } => linear_point(w, &by_family),
            Blend::Meta { families, fit } => {
                let complete = families.iter().all(|f| by_family.contains_key(f));
                if complete && previous_actual > 0.0 {
                    let x: Vec<f64> = families
                        .iter()
                        .filter_map(|f| by_family.get(f))
                        .map(|e| e.log_return)
                        .collect();
                    let point = previous_actual * fit.predict(&x).exp();
                    let share = 1.0 / families.len() as f64;
                    (point, families.iter().map(|f| (*f, share)).collect())
                } else {
                    warn!(%key, "meta-learner input incomplete; averaging available members");
                    let equal: BTreeMap<ModelFamily, f64> =
                        by_family.keys().map(|f| (*f, 1.0)).collect();
                    linear_point(&equal, &by_family)
                }
            }
        };

        let half_width = interval_half_width(point, &blend_weights, &by_family, residual_band, config);
        let interval = Interval::around(point, half_width);

        Ok(Prediction {
            key,
            point_estimate: point,
            interval,
            ensemble_version: weights.version.clone(),
            feature_set,
            generated_at,
            previous_actual,
            members: by_family
                .values()
                .map(|e| MemberEstimate {
                    family: e.family,
                    version: e.version.clone(),
                    point: e.point,
                    variance: e.variance,
                })
                .collect(),
            confidence_score: confidence_score(point, &interval),
            change_pct: change_pct(point, previous_actual),
        })
    }
}

// ─── Weight fitting ──────────────────────────────────────────────────

fn equal_weights(n: usize) -> Vec<f64> {
    vec![1.0 / n as f64; n]
}

/// Member estimates and actuals normalised by the previous price, so tickers
/// with different price levels weigh equally.
fn relative_design(families: &[ModelFamily], rows: &[&OofRow]) -> (Vec<Vec<f64>>, Vec<f64>) {
    let x = rows
        .iter()
        .map(|r| {
            families
                .iter()
                .map(|f| r.members.get(f).copied().unwrap_or(0.0) / r.previous_actual)
                .collect()
        })
        .collect();
    let y = rows.iter().map(|r| r.actual / r.previous_actual).collect();
    (x, y)
}

fn log_return_design(families: &[ModelFamily], rows: &[&OofRow]) -> (Vec<Vec<f64>>, Vec<f64>) {
    let x = rows
        .iter()
        .map(|r| {
            families
                .iter()
                .map(|f| (r.members.get(f).copied().unwrap_or(r.previous_actual) / r.previous_actual).ln())
                .collect()
        })
        .collect();
    let y = rows.iter().map(|r| (r.actual / r.previous_actual).ln()).collect();
    (x, y)
}

/// Least squares `min ‖Xw − y‖² + λ‖w‖²` subject to Σw = 1, and w ≥ 0 when
/// `non_negative`. Falls back to equal weights when the system is singular.
pub(crate) fn fit_simplex_weights(x: &[Vec<f64>], y: &[f64], non_negative: bool, ridge: f64) -> Vec<f64> {
    let d = x.first().map(Vec::len).unwrap_or(0);
    if d == 0 {
        return Vec::new();
    }
    let mut gram = vec![vec![0.0; d]; d];
    let mut xty = vec![0.0; d];
    for (row, &target) in x.iter().zip(y) {
        for i in 0..d {
            xty[i] += row[i] * target;
            for j in 0..d {
                gram[i][j] += row[i] * row[j];
            }
        }
    }
    for (i, row) in gram.iter_mut().enumerate() {
        row[i] += ridge.max(1e-10);
    }

    // KKT system [G 1; 1ᵀ 0] [w; μ] = [Xᵀy; 1].
    let mut a = vec![vec![0.0; d + 1]; d + 1];
    let mut b = vec![0.0; d + 1];
    for i in 0..d {
        a[i][..d].copy_from_slice(&gram[i]);
        a[i][d] = 1.0;
        a[d][i] = 1.0;
        b[i] = xty[i];
    }
    b[d] = 1.0;
    let constrained = linalg::solve(a, b).map(|sol| sol[..d].to_vec());

    let weights = match constrained {
        Some(w) if !non_negative => w,
        Some(w) if w.iter().all(|wi| *wi >= -1e-9) => w.iter().map(|wi| wi.max(0.0)).collect(),
        _ if non_negative => projected_gradient(&gram, &xty),
        _ => equal_weights(d),
    };

    let total: f64 = weights.iter().sum();
    if weights.iter().all(|w| w.is_finite()) && total.abs() > 1e-12 {
        weights.iter().map(|w| w / total).collect()
    } else {
        equal_weights(d)
    }
}

/// Projected gradient descent on `½wᵀGw − bᵀw` over the probability simplex.
fn projected_gradient(gram: &[Vec<f64>], xty: &[f64]) -> Vec<f64> {
    let d = xty.len();
    let trace: f64 = (0..d).map(|i| gram[i][i]).sum();
    let step = 1.0 / trace.max(1e-12);
    let mut w = equal_weights(d);
    for _ in 0..20_000 {
        let grad: Vec<f64> = (0..d)
            .map(|i| linalg::dot(&gram[i], &w) - xty[i])
            .collect();
        let next: Vec<f64> = w.iter().zip(&grad).map(|(wi, g)| wi - step * g).collect();
        let next = project_to_simplex(&next);
        let moved: f64 = next.iter().zip(&w).map(|(a, b)| (a - b).abs()).sum();
        w = next;
        if moved < 1e-12 {
            break;
        }
    }
    w
}

/// Euclidean projection onto `{w : w ≥ 0, Σw = 1}`.
pub(crate) fn project_to_simplex(v: &[f64]) -> Vec<f64> {
    let mut sorted = v.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));
    let mut cumulative = 0.0;
    let mut theta = 0.0;
    for (i, u) in sorted.iter().enumerate() {
        cumulative += u;
        let candidate = (cumulative - 1.0) / (i + 1) as f64;
        if u - candidate > 0.0 {
            theta = candidate;
        }
    }
    v.iter().map(|x| (x - theta).max(0.0)).collect()
}

// ─── Combination ─────────────────────────────────────────────────────

fn linear_point(
    weights: &BTreeMap<ModelFamily, f64>,
    by_family: &BTreeMap<ModelFamily, &Estimate>,
) -> (f64, Vec<(ModelFamily, f64)>) {
    let available: Vec<(ModelFamily, f64)> = weights
        .iter()
        .filter(|(f, _)| by_family.contains_key(f))
        .map(|(f, w)| (*f, *w))
        .collect();
    let total: f64 = available.iter().map(|(_, w)| w).sum();
    let normalised: Vec<(ModelFamily, f64)> = if total > 1e-12 {
        available.iter().map(|(f, w)| (*f, w / total)).collect()
    } else {
        let share = 1.0 / available.len().max(1) as f64;
        available.iter().map(|(f, _)| (*f, share)).collect()
    };
    let point = normalised
        .iter()
        .filter_map(|(f, w)| by_family.get(f).map(|e| w * e.point))
        .sum();
    (point, normalised)
}

/// `z · sqrt(disagreement + mean member variance)` when any member reports a
/// variance; otherwise the recent relative residual band widened to cover the
/// disagreement; otherwise disagreement alone.
fn interval_half_width(
    point: f64,
    weights: &[(ModelFamily, f64)],
    by_family: &BTreeMap<ModelFamily, &Estimate>,
    residual_band: Option<f64>,
    config: &EnsembleConfig,
) -> f64 {
    let z = config.interval_z;
    let disagreement: f64 = weights
        .iter()
        .filter_map(|(f, w)| by_family.get(f).map(|e| w * (e.point - point).powi(2)))
        .sum();
    let variances: Vec<f64> = by_family.values().filter_map(|e| e.variance).collect();

    if !variances.is_empty() {
        let mean_variance = variances.iter().sum::<f64>() / variances.len() as f64;
        z * (disagreement + mean_variance).sqrt()
    } else if let Some(band) = residual_band {
        (band * point.abs()).max(z * disagreement.sqrt())
    } else {
        (config.min_interval_band * point.abs()).max(z * disagreement.sqrt())
    }
}
