use serde::{Deserialize, Serialize};

use crate::error::SimError;

pub const CV_FOLDS: usize = 5;
/// Geometric grid for the L2 strength search.
pub const LAMBDA_GRID: [f64; 6] = [1e-3, 1e-2, 1e-1, 1.0, 10.0, 100.0];

const MAX_ITERS: usize = 600;
const LR_START: f64 = 0.5;

/// L2-regularized logistic regression over standardized features. The
/// coefficients live in standardized space, so their magnitudes double as
/// importance scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogisticModel {
    pub feature_means: Vec<f64>,
    pub feature_stds: Vec<f64>,
    pub coeffs: Vec<f64>,
    pub intercept: f64,
    pub lambda: f64,
}

impl LogisticModel {
    /// Log-odds for one raw feature row.
    pub fn margin(&self, row: &[f64]) -> f64 {
        let mut z = self.intercept;
        for (i, &x) in row.iter().enumerate() {
            z += self.coeffs[i] * standardize(x, self.feature_means[i], self.feature_stds[i]);
        }
        z
    }

    pub fn predict_proba(&self, row: &[f64]) -> f64 {
        sigmoid(self.margin(row))
    }

    /// Closed-form additive attribution in log-odds space:
    /// `phi_i = beta_i * (z_i - E[z_i])`, with `E[z] = 0` by construction of
    /// the training standardization. Sums with `base_value` to the margin.
    pub fn shap(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .enumerate()
            .map(|(i, &x)| {
                self.coeffs[i] * standardize(x, self.feature_means[i], self.feature_stds[i])
            })
            .collect()
    }

    pub fn base_value(&self) -> f64 {
        self.intercept
    }

    /// Absolute standardized coefficients, the importance scores for this
    /// model family.
    pub fn importance_scores(&self) -> Vec<f64> {
        self.coeffs.iter().map(|c| c.abs()).collect()
    }
}

/// Fit with the L2 strength chosen by k-fold cross-validated log-loss, then
/// refit on the full training set.
pub fn cv_fit(rows: &[&[f64]], y: &[u8]) -> Result<LogisticModel, SimError> {
    if rows.is_empty() || rows.len() != y.len() {
        return Err(SimError::ModelFitFailure(
            "logistic regression requires a non-empty training set".into(),
        ));
    }

    let folds = CV_FOLDS.min(rows.len());
    let mut best_lambda = LAMBDA_GRID[0];
    let mut best_loss = f64::INFINITY;

    for &lambda in &LAMBDA_GRID {
        let mut loss_sum = 0.0;
        let mut loss_n = 0usize;
        for fold in 0..folds {
            let train: Vec<usize> = (0..rows.len()).filter(|i| i % folds != fold).collect();
            let val: Vec<usize> = (0..rows.len()).filter(|i| i % folds == fold).collect();
            if train.is_empty() || val.is_empty() {
                continue;
            }
            let train_rows: Vec<&[f64]> = train.iter().map(|&i| rows[i]).collect();
            let train_y: Vec<u8> = train.iter().map(|&i| y[i]).collect();
            let model = fit(&train_rows, &train_y, lambda)?;
            for &i in &val {
                let p = model.predict_proba(rows[i]).clamp(1e-12, 1.0 - 1e-12);
                let p_true = if y[i] == 1 { p } else { 1.0 - p };
                loss_sum += -p_true.ln();
                loss_n += 1;
            }
        }
        if loss_n == 0 {
            continue;
        }
        let loss = loss_sum / loss_n as f64;
        if loss < best_loss {
            best_loss = loss;
            best_lambda = lambda;
        }
    }

    fit(rows, y, best_lambda)
}

/// Full-batch gradient descent on the mean log-loss with a decayed step,
/// L2 applied to coefficients but not the intercept.
pub fn fit(rows: &[&[f64]], y: &[u8], lambda: f64) -> Result<LogisticModel, SimError> {
    let n = rows.len();
    if n == 0 {
        return Err(SimError::ModelFitFailure("empty training set".into()));
    }
    let d = rows[0].len();
    let (means, stds) = norm_stats(rows, d);

    // Standardize once up front; the hot loop then touches contiguous data.
    let mut z = vec![0.0f64; n * d];
    for (r, row) in rows.iter().enumerate() {
        for j in 0..d {
            z[r * d + j] = standardize(row[j], means[j], stds[j]);
        }
    }

    let mut coeffs = vec![0.0f64; d];
    let mut intercept = 0.0f64;

    for iter in 0..MAX_ITERS {
        let mut grad = vec![0.0f64; d];
        let mut grad0 = 0.0f64;

        for r in 0..n {
            let zr = &z[r * d..(r + 1) * d];
            let mut m = intercept;
            for j in 0..d {
                m += coeffs[j] * zr[j];
            }
            let dz = sigmoid(m) - f64::from(y[r]);
            grad0 += dz;
            for j in 0..d {
                grad[j] += dz * zr[j];
            }
        }

        let lr = LR_START / (1.0 + iter as f64 * 0.01);
        let n_f = n as f64;
        intercept -= lr * grad0 / n_f;
        for j in 0..d {
            coeffs[j] -= lr * (grad[j] / n_f + lambda * coeffs[j] / n_f);
        }

        if !intercept.is_finite() || coeffs.iter().any(|c| !c.is_finite()) {
            return Err(SimError::ModelFitFailure(format!(
                "non-finite coefficients at iteration {iter}"
            )));
        }
    }

    Ok(LogisticModel {
        feature_means: means,
        feature_stds: stds,
        coeffs,
        intercept,
        lambda,
    })
}

fn norm_stats(rows: &[&[f64]], d: usize) -> (Vec<f64>, Vec<f64>) {
    let n = rows.len() as f64;
    let mut means = vec![0.0; d];
    for row in rows {
        for j in 0..d {
            means[j] += row[j];
        }
    }
    for m in &mut means {
        *m /= n;
    }

    let mut stds = vec![0.0; d];
    for row in rows {
        for j in 0..d {
            let diff = row[j] - means[j];
            stds[j] += diff * diff;
        }
    }
    for s in &mut stds {
        *s = (*s / n).sqrt().max(1e-6);
    }
    (means, stds)
}

fn standardize(x: f64, mean: f64, std: f64) -> f64 {
    (x - mean) / std
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}
