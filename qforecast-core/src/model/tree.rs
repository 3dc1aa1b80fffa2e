//! Gradient-boosted regression trees (squared loss).
//!
//! Each round fits a depth-limited tree to the current residuals on a random row
//! subsample and column subsample, then adds it with shrinkage. Trees are stored as
//! flat node vectors so the fitted ensemble serialises into the artifact as plain
//! JSON. Split gains are accumulated per feature and exposed as importances.

use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{check_training_shape, FitContext, Forecaster, ModelError, ModelFamily};

const FAMILY: ModelFamily = ModelFamily::TreeEnsemble;

/// Hyperparameters for the tree ensemble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeParams {
    pub n_estimators: usize,
    pub max_depth: usize,
    pub learning_rate: f64,
    pub min_samples_leaf: usize,
    /// Fraction of rows sampled per round.
    pub subsample: f64,
    /// Fraction of features considered per round.
    pub colsample: f64,
    pub seed: u64,
}

impl Default for TreeParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: 4,
            learning_rate: 0.1,
            min_samples_leaf: 2,
            subsample: 0.8,
            colsample: 0.8,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        value: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RegressionTree {
    nodes: Vec<Node>,
}

impl RegressionTree {
    fn predict(&self, x: &[f64]) -> f64 {
        let mut idx = 0;
        loop {
            match self.nodes.get(idx) {
                Some(Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                }) => {
                    let v = x.get(*feature).copied().unwrap_or(0.0);
                    idx = if v <= *threshold { *left } else { *right };
                }
                Some(Node::Leaf { value }) => return *value,
                None => return 0.0,
            }
        }
    }
}

struct Builder<'a> {
    x: &'a [&'a [f64]],
    residual: &'a [f64],
    features: &'a [usize],
    params: &'a TreeParams,
    nodes: Vec<Node>,
    gains: Vec<f64>,
}

struct BestSplit {
    feature: usize,
    threshold: f64,
    gain: f64,
    left: Vec<usize>,
    right: Vec<usize>,
}

impl Builder<'_> {
    fn leaf(&mut self, rows: &[usize]) -> usize {
        let value = rows.iter().map(|&i| self.residual[i]).sum::<f64>() / rows.len().max(1) as f64;
        self.nodes.push(Node::Leaf { value });
        self.nodes.len() - 1
    }

    fn best_split(&self, rows: &[usize]) -> Option<BestSplit> {
        let min_leaf = self.params.min_samples_leaf.max(1);
        let n = rows.len() as f64;
        let total: f64 = rows.iter().map(|&i| self.residual[i]).sum();
        let parent_score = total * total / n;
        let mut best: Option<(usize, f64, f64)> = None;

        for &f in self.features {
            let mut sorted = rows.to_vec();
            sorted.sort_by(|&a, &b| self.x[a][f].total_cmp(&self.x[b][f]));
            let mut left_sum = 0.0;
            for k in 0..sorted.len() - 1 {
                left_sum += self.residual[sorted[k]];
                let n_left = k + 1;
                let n_right = sorted.len() - n_left;
                if n_left < min_leaf || n_right < min_leaf {
                    continue;
                }
                let here = self.x[sorted[k]][f];
                let next = self.x[sorted[k + 1]][f];
                if here == next {
                    continue;
                }
                let right_sum = total - left_sum;
                let gain = left_sum * left_sum / n_left as f64
                    + right_sum * right_sum / n_right as f64
                    - parent_score;
                if best.map_or(true, |(_, _, g)| gain > g) {
                    best = Some((f, (here + next) / 2.0, gain));
                }
            }
        }

        let (feature, threshold, gain) = best?;
        if gain <= 1e-12 {
            return None;
        }
        let (left, right) = rows
            .iter()
            .partition(|&&i| self.x[i][feature] <= threshold);
        Some(BestSplit {
            feature,
            threshold,
            gain,
            left,
            right,
        })
    }

    fn build(&mut self, rows: &[usize], depth: usize) -> usize {
        if depth >= self.params.max_depth || rows.len() < 2 * self.params.min_samples_leaf.max(1) {
            return self.leaf(rows);
        }
        let Some(split) = self.best_split(rows) else {
            return self.leaf(rows);
        };
        self.gains[split.feature] += split.gain;

        let at = self.nodes.len();
        self.nodes.push(Node::Leaf { value: 0.0 });
        let left = self.build(&split.left, depth + 1);
        let right = self.build(&split.right, depth + 1);
        self.nodes[at] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        at
    }
}

/// Boosted tree ensemble over the current-quarter feature row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeEnsemble {
    params: TreeParams,
    base: f64,
    trees: Vec<RegressionTree>,
    importance: Vec<f64>,
    width: usize,
    fitted: bool,
}

impl TreeEnsemble {
    pub fn new(params: TreeParams) -> Self {
        Self {
            params,
            base: 0.0,
            trees: Vec::new(),
            importance: Vec::new(),
            width: 0,
            fitted: false,
        }
    }

    pub fn params(&self) -> &TreeParams {
        &self.params
    }

    /// Normalised split-gain importance per feature column (sums to 1 when any
    /// split was made).
    pub fn feature_importance(&self) -> &[f64] {
        &self.importance
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    fn raw_predict(&self, x: &[f64]) -> f64 {
        self.base
            + self
                .trees
                .iter()
                .map(|t| self.params.learning_rate * t.predict(x))
                .sum::<f64>()
    }
}

fn mse(y: &[f64], pred: &[f64]) -> f64 {
    y.iter().zip(pred).map(|(a, b)| (a - b).powi(2)).sum::<f64>() / y.len().max(1) as f64
}

impl Forecaster for TreeEnsemble {
    fn family(&self) -> ModelFamily {
        FAMILY
    }

    fn fit(
        &mut self,
        windows: &[Vec<Vec<f64>>],
        targets: &[f64],
        ctx: &FitContext,
    ) -> Result<(), ModelError> {
        let min_rows = 2 * self.params.min_samples_leaf.max(1);
        let width = check_training_shape(FAMILY, windows, targets, min_rows)?;
        let x: Vec<&[f64]> = windows
            .iter()
            .map(|w| w.last().map(|r| r.as_slice()).unwrap_or(&[]))
            .collect();
        let n = x.len();

        let mut rng = StdRng::seed_from_u64(self.params.seed);
        let base = targets.iter().sum::<f64>() / n as f64;
        let mut pred = vec![base; n];
        let initial_loss = mse(targets, &pred);
        let mut gains = vec![0.0; width];
        let mut trees = Vec::with_capacity(self.params.n_estimators);

        let n_rows = ((n as f64 * self.params.subsample.clamp(0.0, 1.0)).round() as usize).clamp(1, n);
        let n_cols = ((width as f64 * self.params.colsample.clamp(0.0, 1.0)).round() as usize)
            .clamp(1, width.max(1));

        for round in 0..self.params.n_estimators {
            ctx.check(FAMILY)?;
            let residual: Vec<f64> = targets.iter().zip(&pred).map(|(y, p)| y - p).collect();
            let mut rows = sample(&mut rng, n, n_rows).into_vec();
            rows.sort_unstable();
            let mut features = if width == 0 {
                Vec::new()
            } else {
                sample(&mut rng, width, n_cols).into_vec()
            };
            features.sort_unstable();

            let mut builder = Builder {
                x: &x,
                residual: &residual,
                features: &features,
                params: &self.params,
                nodes: Vec::new(),
                gains: vec![0.0; width],
            };
            builder.build(&rows, 0);
            let tree = RegressionTree {
                nodes: builder.nodes,
            };
            for (g, add) in gains.iter_mut().zip(builder.gains) {
                *g += add;
            }

            for (p, xi) in pred.iter_mut().zip(&x) {
                *p += self.params.learning_rate * tree.predict(xi);
            }
            trees.push(tree);

            let loss = mse(targets, &pred);
            if !loss.is_finite() || loss > initial_loss.max(1e-12) * 1e3 {
                return Err(ModelError::Convergence {
                    family: FAMILY,
                    detail: format!("training loss {loss} diverged at round {round}"),
                });
            }
        }

        let total_gain: f64 = gains.iter().sum();
        if total_gain > 0.0 {
            gains.iter_mut().for_each(|g| *g /= total_gain);
        }
        debug!(
            trees = trees.len(),
            rows = n,
            features = width,
            loss = mse(targets, &pred),
            "tree ensemble fitted"
        );

        self.base = base;
        self.trees = trees;
        self.importance = gains;
        self.width = width;
        self.fitted = true;
        Ok(())
    }

    fn predict(&self, window: &[Vec<f64>]) -> Result<f64, ModelError> {
        if !self.fitted {
            return Err(ModelError::NotFitted(FAMILY));
        }
        let x = window.last().ok_or_else(|| ModelError::ShapeMismatch {
            expected: "at least one feature row".into(),
            got: "empty window".into(),
        })?;
        if x.len() != self.width {
            return Err(ModelError::ShapeMismatch {
                expected: format!("{} features", self.width),
                got: x.len().to_string(),
            });
        }
        Ok(self.raw_predict(x))
    }
}
