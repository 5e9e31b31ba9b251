use nalgebra::DMatrix;
use serde_derive::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{EbmfError, Result};
use crate::utils::Mask;

/// Known standard errors of the observations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StandardErrors {
    /// The same standard error for every entry.
    Scalar(f64),
    /// One standard error per entry, with the same shape as the data.
    Matrix(Arc<DMatrix<f64>>),
}

impl StandardErrors {
    pub(crate) fn get(&self, i: usize, j: usize) -> f64 {
        match self {
            StandardErrors::Scalar(s) => *s,
            StandardErrors::Matrix(s) => s[(i, j)],
        }
    }
}

/// The data matrix `Y` to be factored, with potentially missing entries and, optionally,
/// known standard errors.
///
/// Missing entries are stored as zeros and masked off; they never enter residuals,
/// variance estimates nor the ELBO.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataMatrix {
    y: Arc<DMatrix<f64>>,
    mask: Mask,
    standard_errors: Option<StandardErrors>,
}

impl DataMatrix {
    /// Creates a fully observed data matrix. All entries must be finite.
    pub fn new(y: DMatrix<f64>) -> Result<DataMatrix> {
        if let Some(((i, j), _)) = y
            .iter()
            .enumerate()
            .map(|(idx, v)| ((idx % y.nrows(), idx / y.nrows()), v))
            .find(|(_, v)| !v.is_finite())
        {
            return Err(EbmfError::InvalidInput(format!(
                "entry ({i}, {j}) is not finite; use `DataMatrix::mask_non_finite` for missing data"
            )));
        }
        let mask = Mask::unmasked(y.nrows(), y.ncols());
        Ok(DataMatrix {
            y: Arc::new(y),
            mask,
            standard_errors: None,
        })
    }

    /// Creates a data matrix, masking all entries which are not finite (e.g., `NaN` and `inf`).
    pub fn mask_non_finite(y: DMatrix<f64>) -> DataMatrix {
        let mask = Mask::from_fn(y.nrows(), y.ncols(), |i, j| y[(i, j)].is_finite());
        let y = mask.fillna(&y);
        DataMatrix {
            y: Arc::new(y),
            mask,
            standard_errors: None,
        }
    }

    /// Creates a data matrix from data and an explicit mask. Entries whose mask bit is `false`
    /// are considered missing, whatever their value; observed entries must be finite.
    pub fn with_mask(y: DMatrix<f64>, mask: Mask) -> Result<DataMatrix> {
        if mask.shape() != y.shape() {
            return Err(EbmfError::DimensionMismatch {
                what: "observation mask",
                expected: y.shape(),
                got: mask.shape(),
            });
        }
        let y = mask.fillna(&y);
        if !y.iter().all(|v| v.is_finite()) {
            return Err(EbmfError::InvalidInput(
                "observed entries must be finite".to_string(),
            ));
        }
        Ok(DataMatrix {
            y: Arc::new(y),
            mask,
            standard_errors: None,
        })
    }

    /// Attaches a per-entry matrix of standard errors. Every observed entry must have a
    /// strictly positive, finite standard error.
    pub fn with_standard_errors(mut self, s: DMatrix<f64>) -> Result<DataMatrix> {
        if s.shape() != self.y.shape() {
            return Err(EbmfError::DimensionMismatch {
                what: "standard errors",
                expected: self.y.shape(),
                got: s.shape(),
            });
        }
        for j in 0..s.ncols() {
            for i in 0..s.nrows() {
                let sij = s[(i, j)];
                if self.mask.is_set(i, j) && !(sij > 0.0 && sij.is_finite()) {
                    return Err(EbmfError::InvalidInput(format!(
                        "standard error at ({i}, {j}) must be positive and finite, got {sij}"
                    )));
                }
            }
        }
        self.standard_errors = Some(StandardErrors::Matrix(Arc::new(s)));
        Ok(self)
    }

    /// Attaches a single standard error shared by all entries.
    pub fn with_standard_error(mut self, s: f64) -> Result<DataMatrix> {
        if !(s > 0.0 && s.is_finite()) {
            return Err(EbmfError::InvalidInput(format!(
                "standard error must be positive and finite, got {s}"
            )));
        }
        self.standard_errors = Some(StandardErrors::Scalar(s));
        Ok(self)
    }

    /// The data, with missing entries set to zero.
    pub fn y(&self) -> &DMatrix<f64> {
        &self.y
    }

    pub fn mask(&self) -> &Mask {
        &self.mask
    }

    pub fn standard_errors(&self) -> Option<&StandardErrors> {
        self.standard_errors.as_ref()
    }

    pub fn nrows(&self) -> usize {
        self.y.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.y.ncols()
    }

    pub fn shape(&self) -> (usize, usize) {
        self.y.shape()
    }

    pub fn n_observed(&self) -> usize {
        self.mask.n_observed()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use nalgebra::dmatrix;

    #[test]
    fn test_new_rejects_non_finite() {
        let result = DataMatrix::new(dmatrix![1.0, f64::NAN; 0.0, 2.0]);
        assert!(matches!(result, Err(EbmfError::InvalidInput(_))));
    }

    #[test]
    fn test_mask_non_finite() {
        let data = DataMatrix::mask_non_finite(dmatrix![1.0, f64::NAN; f64::INFINITY, 2.0]);
        assert_eq!(data.n_observed(), 2);
        assert!(!data.mask().is_set(0, 1));
        assert!(!data.mask().is_set(1, 0));
        assert_eq!(data.y()[(0, 1)], 0.0);
        assert_eq!(data.y()[(1, 1)], 2.0);
    }

    #[test]
    fn test_standard_errors_validation() {
        let data = DataMatrix::new(dmatrix![1.0, 2.0; 3.0, 4.0]).unwrap();
        assert!(matches!(
            data.clone().with_standard_errors(dmatrix![1.0, 0.0; 1.0, 1.0]),
            Err(EbmfError::InvalidInput(_))
        ));
        assert!(matches!(
            data.clone().with_standard_errors(DMatrix::from_element(3, 2, 1.0)),
            Err(EbmfError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            data.clone().with_standard_error(-1.0),
            Err(EbmfError::InvalidInput(_))
        ));
        assert!(data.with_standard_error(0.5).is_ok());
    }

    #[test]
    fn test_missing_standard_errors_are_ignored() {
        let data = DataMatrix::mask_non_finite(dmatrix![1.0, f64::NAN; 3.0, 4.0]);
        assert!(data
            .with_standard_errors(dmatrix![1.0, -1.0; 1.0, 1.0])
            .is_ok());
    }
}
