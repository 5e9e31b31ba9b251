use bit_vec::BitVec;
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde_derive::{Deserialize, Serialize};

pub(crate) const LN_2PI: f64 = 1.8378770664093453;

#[cfg(test)]
pub(crate) fn standard_noise_matrix<R: rand::Rng + ?Sized>(
    rows: usize,
    cols: usize,
    rng: &mut R,
) -> DMatrix<f64> {
    use rand::distributions::Distribution;
    DMatrix::from_fn(rows, cols, |_, _| rand_distr::StandardNormal.sample(rng))
}

/// `log(exp(a) + exp(b))` without overflow. Handles `-inf` on either side.
pub(crate) fn log_add_exp(a: f64, b: f64) -> f64 {
    let max = a.max(b);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    max + ((a - max).exp() + (b - max).exp()).ln()
}

/// Log-density of `N(mean, variance)` at `x`.
pub(crate) fn normal_log_density(x: f64, mean: f64, variance: f64) -> f64 {
    -0.5 * (LN_2PI + variance.ln() + (x - mean).powi(2) / variance)
}

/// Cosine of the angle between two vectors; zero if either one vanishes.
pub fn cosine_similarity(a: &DVector<f64>, b: &DVector<f64>) -> f64 {
    let norms = a.norm() * b.norm();
    if norms > 0.0 {
        a.dot(b) / norms
    } else {
        0.0
    }
}

/// Which entries of an `n x p` data matrix are observed. Stored column-major, like
/// `nalgebra` stores its matrices. An entry is missing if its bit is `false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mask {
    nrows: usize,
    ncols: usize,
    bits: BitVec,
}

impl Mask {
    /// A mask where every entry is observed.
    pub fn unmasked(nrows: usize, ncols: usize) -> Mask {
        Mask {
            nrows,
            ncols,
            bits: BitVec::from_elem(nrows * ncols, true),
        }
    }

    /// Builds a mask from a predicate on `(row, column)`.
    pub fn from_fn<F>(nrows: usize, ncols: usize, mut observed: F) -> Mask
    where
        F: FnMut(usize, usize) -> bool,
    {
        let mut bits = BitVec::from_elem(nrows * ncols, false);
        for j in 0..ncols {
            for i in 0..nrows {
                if observed(i, j) {
                    bits.set(j * nrows + i, true);
                }
            }
        }
        Mask { nrows, ncols, bits }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.nrows, self.ncols)
    }

    /// Returns whether entry `(i, j)` is observed.
    ///
    /// # Panics
    ///
    /// This function panics if `(i, j)` is out of bounds.
    pub fn is_set(&self, i: usize, j: usize) -> bool {
        assert!(i < self.nrows && j < self.ncols, "index out of bounds");
        self.bits[j * self.nrows + i]
    }

    /// The total number of observed entries.
    pub fn n_observed(&self) -> usize {
        self.bits.iter().filter(|&selected| selected).count()
    }

    pub fn is_complete(&self) -> bool {
        self.bits.all()
    }

    /// Zeroes all missing entries of `matrix`.
    pub(crate) fn fillna(&self, matrix: &DMatrix<f64>) -> DMatrix<f64> {
        DMatrix::from_fn(self.nrows, self.ncols, |i, j| {
            if self.bits[j * self.nrows + i] {
                matrix[(i, j)]
            } else {
                0.0
            }
        })
    }

    /// The mask as a `0.0 / 1.0` matrix.
    pub(crate) fn as_matrix(&self) -> DMatrix<f64> {
        DMatrix::from_fn(self.nrows, self.ncols, |i, j| {
            self.bits[j * self.nrows + i] as i8 as f64
        })
    }

    /// Number of observed entries in each row.
    pub(crate) fn row_counts(&self) -> DVector<f64> {
        (0..self.nrows)
            .into_par_iter()
            .map(|i| {
                (0..self.ncols)
                    .filter(|&j| self.bits[j * self.nrows + i])
                    .count() as f64
            })
            .collect::<Vec<_>>()
            .into()
    }

    /// Number of observed entries in each column.
    pub(crate) fn col_counts(&self) -> DVector<f64> {
        (0..self.ncols)
            .into_par_iter()
            .map(|j| {
                (0..self.nrows)
                    .filter(|&i| self.bits[j * self.nrows + i])
                    .count() as f64
            })
            .collect::<Vec<_>>()
            .into()
    }
}
