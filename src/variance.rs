use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde_derive::{Deserialize, Serialize};

use crate::data::DataMatrix;
use crate::error::{EbmfError, Result};
use crate::utils::LN_2PI;

/// Stop the Kronecker alternation once the objective improves by less than this.
const KRONECKER_TOL: f64 = 1e-8;
const KRONECKER_MAX_ITER: usize = 100;

/// The assumed shape of the residual precision `tau_ij`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarianceType {
    /// A single precision for the whole matrix.
    #[default]
    Constant,
    /// One precision per row.
    ByRow,
    /// One precision per column.
    ByColumn,
    /// `tau_ij = tau1_i * tau2_j`. Requires an iterative fit at every variance update, and is
    /// therefore much slower than the other estimated structures.
    Kronecker,
    /// `tau_ij = 1 / s_ij^2` for the standard errors attached to the data. Never re-estimated.
    Fixed,
}

/// Current values of the noise precision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NoiseParams {
    Constant(f64),
    ByRow(DVector<f64>),
    ByColumn(DVector<f64>),
    Kronecker {
        rows: DVector<f64>,
        cols: DVector<f64>,
    },
    /// Precisions come straight from the standard errors of the data.
    Fixed,
}

impl NoiseParams {
    pub fn variance_type(&self) -> VarianceType {
        match self {
            NoiseParams::Constant(_) => VarianceType::Constant,
            NoiseParams::ByRow(_) => VarianceType::ByRow,
            NoiseParams::ByColumn(_) => VarianceType::ByColumn,
            NoiseParams::Kronecker { .. } => VarianceType::Kronecker,
            NoiseParams::Fixed => VarianceType::Fixed,
        }
    }

    /// The `n x p` matrix of precisions, with zeros on missing entries.
    pub fn precision_matrix(&self, data: &DataMatrix) -> DMatrix<f64> {
        let (n, p) = data.shape();
        let mask = data.mask();
        let columns = (0..p)
            .into_par_iter()
            .map(|j| {
                (0..n)
                    .map(|i| {
                        if !mask.is_set(i, j) {
                            return 0.0;
                        }
                        match self {
                            NoiseParams::Constant(tau) => *tau,
                            NoiseParams::ByRow(tau) => tau[i],
                            NoiseParams::ByColumn(tau) => tau[j],
                            NoiseParams::Kronecker { rows, cols } => rows[i] * cols[j],
                            NoiseParams::Fixed => data
                                .standard_errors()
                                .map(|s| s.get(i, j).powi(-2))
                                .unwrap_or(1.0),
                        }
                    })
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();

        DMatrix::from_fn(n, p, |i, j| columns[j][i])
    }
}

/// Turns a sum of squares over `count` observations into a precision, flooring the variance.
fn floored_precision(sum_squares: f64, count: f64, min_variance: f64) -> Result<f64> {
    if !sum_squares.is_finite() {
        return Err(EbmfError::NumericDegeneracy(format!(
            "non-finite residual sum of squares: {sum_squares}"
        )));
    }
    if count == 0.0 {
        return Ok(1.0);
    }
    let variance = sum_squares / count;
    if variance < min_variance {
        log::debug!("Residual variance {variance:e} floored to {min_variance:e}");
    }
    Ok(1.0 / variance.max(min_variance))
}

fn floored_precisions(
    sums: &DVector<f64>,
    counts: &DVector<f64>,
    min_variance: f64,
) -> Result<DVector<f64>> {
    Ok(sums
        .iter()
        .zip(counts.iter())
        .map(|(&sum, &count)| floored_precision(sum, count, min_variance))
        .collect::<Result<Vec<_>>>()?
        .into())
}

/// `sum_obs 0.5 * log(tau1_i * tau2_j) - 0.5 * tau1_i * tau2_j * R2_ij`.
fn kronecker_objective(
    rows: &DVector<f64>,
    cols: &DVector<f64>,
    r2: &DMatrix<f64>,
    row_counts: &DVector<f64>,
    col_counts: &DVector<f64>,
) -> f64 {
    let log_part = row_counts.dot(&rows.map(f64::ln)) + col_counts.dot(&cols.map(f64::ln));
    0.5 * log_part - 0.5 * rows.dot(&(r2 * cols))
}

/// Estimates the noise precision from the expected squared residuals `r2` (zero on missing
/// entries). `previous` seeds the Kronecker alternation so that successive fits stay monotone.
pub(crate) fn estimate_noise(
    variance_type: VarianceType,
    r2: &DMatrix<f64>,
    data: &DataMatrix,
    previous: Option<&NoiseParams>,
    min_variance: f64,
) -> Result<NoiseParams> {
    let mask = data.mask();
    match variance_type {
        VarianceType::Fixed => Ok(NoiseParams::Fixed),
        VarianceType::Constant => Ok(NoiseParams::Constant(floored_precision(
            r2.sum(),
            mask.n_observed() as f64,
            min_variance,
        )?)),
        VarianceType::ByRow => Ok(NoiseParams::ByRow(floored_precisions(
            &r2.column_sum(),
            &mask.row_counts(),
            min_variance,
        )?)),
        VarianceType::ByColumn => Ok(NoiseParams::ByColumn(floored_precisions(
            &r2.row_sum().transpose(),
            &mask.col_counts(),
            min_variance,
        )?)),
        VarianceType::Kronecker => {
            let row_counts = mask.row_counts();
            let col_counts = mask.col_counts();
            let (mut rows, mut cols) = match previous {
                Some(NoiseParams::Kronecker { rows, cols })
                    if rows.len() == r2.nrows() && cols.len() == r2.ncols() =>
                {
                    (rows.clone(), cols.clone())
                }
                _ => (
                    DVector::from_element(r2.nrows(), 1.0),
                    floored_precisions(&r2.row_sum().transpose(), &col_counts, min_variance)?,
                ),
            };

            let mut objective = kronecker_objective(&rows, &cols, r2, &row_counts, &col_counts);
            for _ in 0..KRONECKER_MAX_ITER {
                rows = floored_precisions(&(r2 * &cols), &row_counts, min_variance)?;
                cols = floored_precisions(&r2.tr_mul(&rows), &col_counts, min_variance)?;
                let new_objective =
                    kronecker_objective(&rows, &cols, r2, &row_counts, &col_counts);
                if !new_objective.is_finite() {
                    return Err(EbmfError::NumericDegeneracy(
                        "non-finite Kronecker variance objective".to_string(),
                    ));
                }
                let improvement = new_objective - objective;
                objective = new_objective;
                if improvement < KRONECKER_TOL {
                    break;
                }
            }

            Ok(NoiseParams::Kronecker { rows, cols })
        }
    }
}

/// The expected log-likelihood of the observed data, `sum_obs E[log N(y_ij | (LF')_ij,
/// 1 / tau_ij)]`, given the expected squared residuals `r2`.
pub(crate) fn expected_loglik(noise: &NoiseParams, r2: &DMatrix<f64>, data: &DataMatrix) -> f64 {
    let tau = noise.precision_matrix(data);
    let mask = data.mask();
    (0..r2.ncols())
        .into_par_iter()
        .map(|j| {
            (0..r2.nrows())
                .filter(|&i| mask.is_set(i, j))
                .map(|i| {
                    let tau_ij = tau[(i, j)];
                    -0.5 * LN_2PI + 0.5 * tau_ij.ln() - 0.5 * tau_ij * r2[(i, j)]
                })
                .sum::<f64>()
        })
        .sum()
}
