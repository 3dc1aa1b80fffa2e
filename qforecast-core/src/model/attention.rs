//! Attention model over multiple lag horizons.
//!
//! For horizons `h₁..hₖ` the model scores each lagged feature row
//! `s_h = q · x_{t-h} + b_h`, takes `α = softmax(s)` and regresses the target on the
//! attended context `c = Σ α_h x_{t-h}`:
//!
//! ```text
//! ŷ = β · c + β₀
//! ```
//!
//! Trained by full-batch gradient descent on mean squared error with L2 on `q`
//! and `β`, clipping the global gradient norm.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::linalg::dot;
use super::{check_training_shape, FitContext, Forecaster, ModelError, ModelFamily};

const FAMILY: ModelFamily = ModelFamily::Attention;
const MAX_GRAD_NORM: f64 = 5.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionParams {
    /// Lags (in quarters) attended over; 0 is the current quarter.
    pub horizons: Vec<usize>,
    pub epochs: usize,
    pub learning_rate: f64,
    pub l2: f64,
    pub seed: u64,
}

impl Default for AttentionParams {
    fn default() -> Self {
        Self {
            horizons: vec![0, 1, 2, 4],
            epochs: 300,
            learning_rate: 0.05,
            l2: 1e-3,
            seed: 11,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttentionModel {
    params: AttentionParams,
    query: Vec<f64>,
    horizon_bias: Vec<f64>,
    beta: Vec<f64>,
    intercept: f64,
    fitted: bool,
}

struct Forward {
    alpha: Vec<f64>,
    context: Vec<f64>,
    output: f64,
}

impl AttentionModel {
    pub fn new(params: AttentionParams) -> Self {
        Self {
            params,
            query: Vec::new(),
            horizon_bias: Vec::new(),
            beta: Vec::new(),
            intercept: 0.0,
            fitted: false,
        }
    }

    pub fn params(&self) -> &AttentionParams {
        &self.params
    }

    fn lagged<'w>(&self, window: &'w [Vec<f64>]) -> Result<Vec<&'w [f64]>, ModelError> {
        let needed = self.params.horizons.iter().copied().max().unwrap_or(0) + 1;
        if window.len() < needed {
            return Err(ModelError::ShapeMismatch {
                expected: format!("{needed} feature rows"),
                got: window.len().to_string(),
            });
        }
        let last = window.len() - 1;
        Ok(self
            .params
            .horizons
            .iter()
            .map(|&h| window[last - h].as_slice())
            .collect())
    }

    fn forward(&self, rows: &[&[f64]]) -> Forward {
        let scores: Vec<f64> = rows
            .iter()
            .zip(&self.horizon_bias)
            .map(|(x, b)| dot(&self.query, x) + b)
            .collect();
        let alpha = softmax(&scores);
        let width = self.beta.len();
        let mut context = vec![0.0; width];
        for (a, x) in alpha.iter().zip(rows) {
            for (c, v) in context.iter_mut().zip(x.iter()) {
                *c += a * v;
            }
        }
        let output = dot(&self.beta, &context) + self.intercept;
        Forward {
            alpha,
            context,
            output,
        }
    }

    /// Attention weights per horizon for one window (interpretability).
    pub fn attention_weights(&self, window: &[Vec<f64>]) -> Result<Vec<(usize, f64)>, ModelError> {
        if !self.fitted {
            return Err(ModelError::NotFitted(FAMILY));
        }
        let rows = self.lagged(window)?;
        let f = self.forward(&rows);
        Ok(self.params.horizons.iter().copied().zip(f.alpha).collect())
    }
}

fn softmax(scores: &[f64]) -> Vec<f64> {
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}

impl Forecaster for AttentionModel {
    fn family(&self) -> ModelFamily {
        FAMILY
    }

    fn fit(
        &mut self,
        windows: &[Vec<Vec<f64>>],
        targets: &[f64],
        ctx: &FitContext,
    ) -> Result<(), ModelError> {
        if self.params.horizons.is_empty() {
            return Err(ModelError::ShapeMismatch {
                expected: "at least one horizon".into(),
                got: "none".into(),
            });
        }
        let width = check_training_shape(FAMILY, windows, targets, 3)?;
        let lagged: Vec<Vec<&[f64]>> = windows
            .iter()
            .map(|w| self.lagged(w))
            .collect::<Result<_, _>>()?;

        let k = self.params.horizons.len();
        let n = windows.len() as f64;
        let mut rng = StdRng::seed_from_u64(self.params.seed);
        self.query = (0..width).map(|_| rng.gen_range(-0.1..0.1)).collect();
        self.beta = (0..width).map(|_| rng.gen_range(-0.1..0.1)).collect();
        self.horizon_bias = vec![0.0; k];
        self.intercept = targets.iter().sum::<f64>() / n;

        let lr = self.params.learning_rate;
        let l2 = self.params.l2;
        let mut loss = f64::INFINITY;

        for epoch in 0..self.params.epochs {
            ctx.check(FAMILY)?;
            let mut g_query = vec![0.0; width];
            let mut g_beta = vec![0.0; width];
            let mut g_bias = vec![0.0; k];
            let mut g_intercept = 0.0;
            let mut sse = 0.0;

            for (rows, &y) in lagged.iter().zip(targets) {
                let f = self.forward(rows);
                let err = f.output - y;
                sse += err * err;
                let g = 2.0 * err / n;

                g_intercept += g;
                for (gb, c) in g_beta.iter_mut().zip(&f.context) {
                    *gb += g * c;
                }
                // dL/dα_h = g β·x_h, then back through the softmax.
                let d_alpha: Vec<f64> = rows.iter().map(|x| g * dot(&self.beta, x)).collect();
                let mean_d = dot(&f.alpha, &d_alpha);
                for (h, x) in rows.iter().enumerate() {
                    let ds = f.alpha[h] * (d_alpha[h] - mean_d);
                    g_bias[h] += ds;
                    for (gq, v) in g_query.iter_mut().zip(x.iter()) {
                        *gq += ds * v;
                    }
                }
            }

            loss = sse / n;
            if !loss.is_finite() {
                return Err(ModelError::Convergence {
                    family: FAMILY,
                    detail: format!("loss became non-finite at epoch {epoch}"),
                });
            }

            for (g, w) in g_query.iter_mut().zip(&self.query) {
                *g += 2.0 * l2 * w;
            }
            for (g, w) in g_beta.iter_mut().zip(&self.beta) {
                *g += 2.0 * l2 * w;
            }

            let norm = (g_query.iter().chain(&g_beta).chain(&g_bias).map(|g| g * g).sum::<f64>()
                + g_intercept * g_intercept)
                .sqrt();
            let clip = if norm > MAX_GRAD_NORM { MAX_GRAD_NORM / norm } else { 1.0 };

            for (w, g) in self.query.iter_mut().zip(&g_query) {
                *w -= lr * clip * g;
            }
            for (w, g) in self.beta.iter_mut().zip(&g_beta) {
                *w -= lr * clip * g;
            }
            for (w, g) in self.horizon_bias.iter_mut().zip(&g_bias) {
                *w -= lr * clip * g;
            }
            self.intercept -= lr * clip * g_intercept;
        }

        debug!(rows = windows.len(), horizons = k, loss, "attention model fitted");
        self.fitted = true;
        Ok(())
    }

    fn predict(&self, window: &[Vec<f64>]) -> Result<f64, ModelError> {
        if !self.fitted {
            return Err(ModelError::NotFitted(FAMILY));
        }
        let rows = self.lagged(window)?;
        Ok(self.forward(&rows).output)
    }
}
