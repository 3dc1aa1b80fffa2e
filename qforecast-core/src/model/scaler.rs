//! Per-feature standardisation fitted on the training rows.

use serde::{Deserialize, Serialize};

/// Column means and scales. Missing inputs map to the training mean (0 after scaling).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standardizer {
    means: Vec<f64>,
    scales: Vec<f64>,
}

impl Standardizer {
    /// Fit on rows of possibly-missing values. A column with no observed value
    /// gets mean 0 and scale 1.
    pub fn fit(rows: &[Vec<Option<f64>>], width: usize) -> Self {
        let mut means = Vec::with_capacity(width);
        let mut scales = Vec::with_capacity(width);
        for j in 0..width {
            let col: Vec<f64> = rows.iter().filter_map(|r| r.get(j).copied().flatten()).collect();
            if col.is_empty() {
                means.push(0.0);
                scales.push(1.0);
                continue;
            }
            let m = col.iter().sum::<f64>() / col.len() as f64;
            let var = col.iter().map(|v| (v - m).powi(2)).sum::<f64>() / col.len() as f64;
            let sd = var.sqrt();
            means.push(m);
            scales.push(if sd > 1e-12 { sd } else { 1.0 });
        }
        Self { means, scales }
    }

    pub fn width(&self) -> usize {
        self.means.len()
    }

    /// Standardise one row; returns the dense row and how many cells were filled.
    pub fn transform(&self, row: &[Option<f64>]) -> (Vec<f64>, usize) {
        let mut filled = 0;
        let dense = self
            .means
            .iter()
            .zip(&self.scales)
            .enumerate()
            .map(|(j, (m, s))| match row.get(j).copied().flatten() {
                Some(v) => (v - m) / s,
                None => {
                    filled += 1;
                    0.0
                }
            })
            .collect();
        (dense, filled)
    }
}
