//! Small dense linear-algebra kernels shared by the model families and the stacker.

use serde::{Deserialize, Serialize};

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Sample variance (n − 1 denominator); 0 for fewer than two values.
pub fn variance(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let m = mean(xs);
    xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() - 1) as f64
}

/// Solve `a · x = b` by Gaussian elimination with partial pivoting.
/// Returns `None` for singular or non-finite systems.
pub fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    if a.len() != n || a.iter().any(|row| row.len() != n) {
        return None;
    }

    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < 1e-12 || !a[pivot][col].is_finite() {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    x.iter().all(|v| v.is_finite()).then_some(x)
}

/// Linear model with an unpenalised intercept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RidgeFit {
    pub weights: Vec<f64>,
    pub intercept: f64,
}

impl RidgeFit {
    pub fn predict(&self, x: &[f64]) -> f64 {
        self.intercept + dot(&self.weights, x)
    }
}

/// Ridge regression: minimise `‖y − Xw − c‖² + λ‖w‖²`. Columns are centred so
/// the intercept is not shrunk.
pub fn ridge(x: &[Vec<f64>], y: &[f64], lambda: f64) -> Option<RidgeFit> {
    let n = x.len();
    if n == 0 || n != y.len() {
        return None;
    }
    let d = x[0].len();
    let col_means: Vec<f64> = (0..d)
        .map(|j| x.iter().map(|row| row[j]).sum::<f64>() / n as f64)
        .collect();
    let y_mean = mean(y);

    let mut gram = vec![vec![0.0; d]; d];
    let mut rhs = vec![0.0; d];
    for (row, &target) in x.iter().zip(y) {
        let centred: Vec<f64> = row.iter().zip(&col_means).map(|(v, m)| v - m).collect();
        for i in 0..d {
            rhs[i] += centred[i] * (target - y_mean);
            for j in 0..d {
                gram[i][j] += centred[i] * centred[j];
            }
        }
    }
    for (i, row) in gram.iter_mut().enumerate() {
        row[i] += lambda.max(1e-9);
    }

    let weights = solve(gram, rhs)?;
    let intercept = y_mean - dot(&weights, &col_means);
    Some(RidgeFit { weights, intercept })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solve_small_system() {
        let a = vec![vec![2.0, 1.0], vec![1.0, 3.0]];
        let x = solve(a, vec![3.0, 5.0]).unwrap();
        assert!((x[0] - 0.8).abs() < 1e-12);
        assert!((x[1] - 1.4).abs() < 1e-12);
    }

    #[test]
    fn singular_system_is_none() {
        let a = vec![vec![1.0, 2.0], vec![2.0, 4.0]];
        assert!(solve(a, vec![1.0, 2.0]).is_none());
    }

    #[test]
    fn ridge_recovers_linear_relation() {
        let x: Vec<Vec<f64>> = (0..20).map(|i| vec![i as f64, (i % 3) as f64]).collect();
        let y: Vec<f64> = x.iter().map(|r| 1.5 + 2.0 * r[0] - 0.5 * r[1]).collect();
        let fit = ridge(&x, &y, 1e-8).unwrap();
        assert!((fit.weights[0] - 2.0).abs() < 1e-5);
        assert!((fit.weights[1] + 0.5).abs() < 1e-5);
        assert!((fit.intercept - 1.5).abs() < 1e-4);
    }

    #[test]
    fn sample_variance() {
        assert_eq!(variance(&[1.0]), 0.0);
        assert!((variance(&[1.0, 2.0, 3.0]) - 1.0).abs() < 1e-12);
    }
}
