//! Sequence model: a leaky echo-state reservoir over a ticker's ordered quarterly
//! feature history, with a ridge readout.
//!
//! The reservoir weights are random (seeded) and fixed; only the linear readout on
//! the final reservoir state is trained, which keeps fitting closed-form and stable
//! on the short histories a quarterly grid provides.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::linalg::{ridge, variance, RidgeFit};
use super::{check_training_shape, FitContext, Forecaster, ModelError, ModelFamily};

const FAMILY: ModelFamily = ModelFamily::Sequence;
const POWER_ITERATIONS: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceParams {
    /// Reservoir size.
    pub hidden_size: usize,
    /// Number of trailing quarters fed through the reservoir.
    pub sequence_length: usize,
    pub spectral_radius: f64,
    pub leaking_rate: f64,
    pub input_scaling: f64,
    /// Fraction of non-zero recurrent connections.
    pub sparsity: f64,
    /// Readout ridge penalty.
    pub ridge: f64,
    pub seed: u64,
}

impl Default for SequenceParams {
    fn default() -> Self {
        Self {
            hidden_size: 32,
            sequence_length: 4,
            spectral_radius: 0.9,
            leaking_rate: 0.5,
            input_scaling: 0.5,
            sparsity: 0.2,
            ridge: 1e-2,
            seed: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceModel {
    params: SequenceParams,
    w_in: Vec<Vec<f64>>,
    w: Vec<Vec<f64>>,
    readout: Option<RidgeFit>,
    residual_variance: f64,
}

impl SequenceModel {
    pub fn new(params: SequenceParams) -> Self {
        Self {
            params,
            w_in: Vec::new(),
            w: Vec::new(),
            readout: None,
            residual_variance: 0.0,
        }
    }

    pub fn params(&self) -> &SequenceParams {
        &self.params
    }

    fn init_reservoir(&mut self, input_dim: usize) {
        let n = self.params.hidden_size.max(1);
        let mut rng = StdRng::seed_from_u64(self.params.seed);

        self.w_in = (0..n)
            .map(|_| {
                (0..input_dim)
                    .map(|_| rng.gen_range(-1.0..1.0) * self.params.input_scaling)
                    .collect()
            })
            .collect();

        let mut w: Vec<Vec<f64>> = (0..n)
            .map(|_| {
                (0..n)
                    .map(|_| {
                        if rng.gen::<f64>() < self.params.sparsity {
                            rng.gen_range(-1.0..1.0)
                        } else {
                            0.0
                        }
                    })
                    .collect()
            })
            .collect();

        let radius = spectral_radius(&w, &mut rng);
        if radius > 1e-10 {
            let scale = self.params.spectral_radius / radius;
            w.iter_mut().flatten().for_each(|v| *v *= scale);
        }
        self.w = w;
    }

    /// Final reservoir state after running the trailing `sequence_length` rows.
    fn final_state(&self, window: &[Vec<f64>]) -> Vec<f64> {
        let n = self.w.len();
        let a = self.params.leaking_rate.clamp(0.0, 1.0);
        let take = self.params.sequence_length.max(1).min(window.len());
        let mut h = vec![0.0; n];

        for x in &window[window.len() - take..] {
            let next: Vec<f64> = (0..n)
                .map(|i| {
                    let input: f64 = self.w_in[i].iter().zip(x).map(|(w, v)| w * v).sum();
                    let recurrent: f64 = self.w[i].iter().zip(&h).map(|(w, v)| w * v).sum();
                    (1.0 - a) * h[i] + a * (input + recurrent).tanh()
                })
                .collect();
            h = next;
        }
        h
    }
}

/// Estimate of the largest eigenvalue magnitude by power iteration.
fn spectral_radius(m: &[Vec<f64>], rng: &mut StdRng) -> f64 {
    let n = m.len();
    let mut v: Vec<f64> = (0..n).map(|_| rng.gen_range(0.0..1.0)).collect();
    let mut radius = 0.0;
    for _ in 0..POWER_ITERATIONS {
        let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm < 1e-12 {
            return 0.0;
        }
        v.iter_mut().for_each(|x| *x /= norm);
        let next: Vec<f64> = m
            .iter()
            .map(|row| row.iter().zip(&v).map(|(a, b)| a * b).sum())
            .collect();
        radius = next.iter().map(|x| x * x).sum::<f64>().sqrt();
        v = next;
    }
    radius
}

impl Forecaster for SequenceModel {
    fn family(&self) -> ModelFamily {
        FAMILY
    }

    fn fit(
        &mut self,
        windows: &[Vec<Vec<f64>>],
        targets: &[f64],
        ctx: &FitContext,
    ) -> Result<(), ModelError> {
        let width = check_training_shape(FAMILY, windows, targets, 3)?;
        self.init_reservoir(width);
        ctx.check(FAMILY)?;

        let mut states = Vec::with_capacity(windows.len());
        for window in windows {
            let state = self.final_state(window);
            if state.iter().any(|v| !v.is_finite()) {
                return Err(ModelError::Convergence {
                    family: FAMILY,
                    detail: "reservoir state became non-finite".into(),
                });
            }
            states.push(state);
        }
        ctx.check(FAMILY)?;

        let readout = ridge(&states, targets, self.params.ridge).ok_or_else(|| {
            ModelError::Convergence {
                family: FAMILY,
                detail: "readout system is singular".into(),
            }
        })?;
        let residuals: Vec<f64> = states
            .iter()
            .zip(targets)
            .map(|(s, y)| y - readout.predict(s))
            .collect();
        let residual_variance = variance(&residuals);
        if !residual_variance.is_finite() {
            return Err(ModelError::Convergence {
                family: FAMILY,
                detail: "non-finite residual variance".into(),
            });
        }
        debug!(
            rows = windows.len(),
            hidden = self.w.len(),
            residual_variance,
            "sequence model fitted"
        );

        self.readout = Some(readout);
        self.residual_variance = residual_variance;
        Ok(())
    }

    fn predict(&self, window: &[Vec<f64>]) -> Result<f64, ModelError> {
        self.predict_with_variance(window).map(|(p, _)| p)
    }

    fn predict_with_variance(&self, window: &[Vec<f64>]) -> Result<(f64, Option<f64>), ModelError> {
        let readout = self.readout.as_ref().ok_or(ModelError::NotFitted(FAMILY))?;
        if window.is_empty() {
            return Err(ModelError::ShapeMismatch {
                expected: "at least one feature row".into(),
                got: "empty window".into(),
            });
        }
        let state = self.final_state(window);
        Ok((readout.predict(&state), Some(self.residual_variance)))
    }
}
