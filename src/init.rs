use nalgebra::{DMatrix, DVector};
use ordered_float::NotNan;

use crate::data::DataMatrix;
use crate::error::{EbmfError, Result};

/// Seeds for components added to a fit before backfitting.
#[derive(Debug, Clone)]
pub enum Initialization {
    /// Explicit means for `L` (`n x K`) and `F` (`p x K`).
    Factors {
        loadings: DMatrix<f64>,
        factors: DMatrix<f64>,
    },
    /// An SVD-like triple `U * diag(d) * V^T`, with `U` of size `n x K` and `V` of size `p x K`.
    /// The singular values are split evenly between both sides.
    Svd {
        u: DMatrix<f64>,
        d: DVector<f64>,
        v: DMatrix<f64>,
    },
}

impl Initialization {
    /// The leading `rank` singular triples of the data, missing entries read as zeros.
    pub fn truncated_svd(data: &DataMatrix, rank: usize) -> Result<Initialization> {
        let max_rank = data.nrows().min(data.ncols());
        if rank == 0 || rank > max_rank {
            return Err(EbmfError::InvalidInput(format!(
                "SVD rank must be between 1 and {max_rank}, got {rank}"
            )));
        }
        let svd = data.y().clone().svd(true, true);
        let (u, v_t) = svd.u.zip(svd.v_t).ok_or_else(|| {
            EbmfError::NumericDegeneracy("SVD of the data did not converge".to_string())
        })?;

        Ok(Initialization::Svd {
            u: u.columns(0, rank).into_owned(),
            d: svd.singular_values.rows(0, rank).into_owned(),
            v: v_t.rows(0, rank).transpose(),
        })
    }

    /// Checks the shapes against an `nrows x ncols` data matrix and returns `(L, F)`.
    pub(crate) fn into_columns(
        self,
        nrows: usize,
        ncols: usize,
    ) -> Result<(DMatrix<f64>, DMatrix<f64>)> {
        let (loadings, factors) = match self {
            Initialization::Factors { loadings, factors } => (loadings, factors),
            Initialization::Svd { u, d, v } => {
                if u.ncols() != d.len() || v.ncols() != d.len() {
                    return Err(EbmfError::DimensionMismatch {
                        what: "SVD initialization",
                        expected: (d.len(), d.len()),
                        got: (u.ncols(), v.ncols()),
                    });
                }
                if d.iter().any(|&di| !(di >= 0.0)) {
                    return Err(EbmfError::InvalidInput(
                        "singular values must be non-negative".to_string(),
                    ));
                }
                let root = DMatrix::from_diagonal(&d.map(f64::sqrt));
                (u * &root, v * root)
            }
        };

        if loadings.nrows() != nrows {
            return Err(EbmfError::DimensionMismatch {
                what: "initial loadings",
                expected: (nrows, loadings.ncols()),
                got: loadings.shape(),
            });
        }
        if factors.shape() != (ncols, loadings.ncols()) {
            return Err(EbmfError::DimensionMismatch {
                what: "initial factors",
                expected: (ncols, loadings.ncols()),
                got: factors.shape(),
            });
        }
        if loadings.iter().chain(factors.iter()).any(|v| !v.is_finite()) {
            return Err(EbmfError::InvalidInput(
                "initial loadings and factors must be finite".to_string(),
            ));
        }

        Ok((loadings, factors))
    }
}

fn safe_ratio(numerator: &DVector<f64>, denominator: &DVector<f64>) -> DVector<f64> {
    numerator.zip_map(denominator, |a, b| if b > 0.0 { a / b } else { 0.0 })
}

fn unit(v: &DVector<f64>) -> DVector<f64> {
    v / v.norm()
}

/// Proposes a rank-one approximation `u * v^T` of the residual by alternating least squares on
/// the observed entries (`observed` is the `0 / 1` mask). The two vectors come back with equal
/// norms. Returns `None` if the residual offers no direction at all.
pub(crate) fn rank_one(
    residual: &DMatrix<f64>,
    observed: &DMatrix<f64>,
    max_iter: usize,
    tol: f64,
) -> Option<(DVector<f64>, DVector<f64>)> {
    let start = residual
        .row_iter()
        .enumerate()
        .filter_map(|(i, row)| NotNan::new(row.norm()).ok().map(|norm| (norm, i)))
        .max()?;
    if start.0.into_inner() == 0.0 {
        return None;
    }

    let mut v: DVector<f64> = residual.row(start.1).transpose();
    let mut u = DVector::zeros(residual.nrows());
    for _ in 0..max_iter {
        u = safe_ratio(&(residual * &v), &(observed * v.map(|x| x * x)));
        let new_v = safe_ratio(&residual.tr_mul(&u), &observed.tr_mul(&u.map(|x| x * x)));
        let new_norm = new_v.norm();
        if !(new_norm > 0.0 && new_norm.is_finite()) {
            return None;
        }
        let change = (unit(&new_v) - unit(&v)).amax();
        v = new_v;
        if change < tol {
            break;
        }
    }

    let (u_norm, v_norm) = (u.norm(), v.norm());
    if !(u_norm > 0.0 && u_norm.is_finite()) {
        return None;
    }
    let scale = (u_norm * v_norm).sqrt();
    Some((u * (scale / u_norm), v * (scale / v_norm)))
}

#[cfg(test)]
mod test {
    use super::*;
    use nalgebra::{dmatrix, dvector};

    #[test]
    fn test_rank_one_recovers_outer_product() {
        let u = dvector![1.0, -2.0, 0.5, 3.0];
        let v = dvector![2.0, 1.0, -1.0];
        let residual = &u * v.transpose();
        let observed = DMatrix::from_element(4, 3, 1.0);
        let (found_u, found_v) = rank_one(&residual, &observed, 100, 1e-10).unwrap();
        approx::assert_relative_eq!(&found_u * found_v.transpose(), residual, epsilon = 1e-8);
        approx::assert_relative_eq!(found_u.norm(), found_v.norm(), epsilon = 1e-10);
    }

    #[test]
    fn test_rank_one_with_missing_entries() {
        let u = dvector![1.0, 2.0, 3.0];
        let v = dvector![1.0, -1.0, 2.0];
        let observed = dmatrix![1.0, 1.0, 1.0; 1.0, 0.0, 1.0; 1.0, 1.0, 0.0];
        let residual = (&u * v.transpose()).component_mul(&observed);
        let (found_u, found_v) = rank_one(&residual, &observed, 500, 1e-12).unwrap();
        let fitted = &found_u * found_v.transpose();
        approx::assert_relative_eq!(fitted[(1, 1)], -2.0, epsilon = 1e-6);
        approx::assert_relative_eq!(fitted[(2, 2)], 6.0, epsilon = 1e-6);
    }

    #[test]
    fn test_rank_one_degenerate() {
        let zeros = DMatrix::zeros(3, 2);
        assert!(rank_one(&zeros, &DMatrix::from_element(3, 2, 1.0), 10, 1e-8).is_none());
    }

    #[test]
    fn test_svd_initialization() {
        let y = dmatrix![3.0, 0.0; 0.0, 2.0; 0.0, 0.0];
        let data = DataMatrix::new(y.clone()).unwrap();
        let init = Initialization::truncated_svd(&data, 2).unwrap();
        let (loadings, factors) = init.into_columns(3, 2).unwrap();
        approx::assert_relative_eq!(loadings * factors.transpose(), y, epsilon = 1e-10);
        assert!(Initialization::truncated_svd(&data, 3).is_err());
    }

    #[test]
    fn test_shape_validation() {
        let init = Initialization::Factors {
            loadings: DMatrix::zeros(3, 2),
            factors: DMatrix::zeros(4, 1),
        };
        assert!(matches!(
            init.into_columns(3, 4),
            Err(EbmfError::DimensionMismatch { .. })
        ));
        let init = Initialization::Svd {
            u: DMatrix::zeros(3, 1),
            d: dvector![-1.0],
            v: DMatrix::zeros(4, 1),
        };
        assert!(matches!(
            init.into_columns(3, 4),
            Err(EbmfError::InvalidInput(_))
        ));
    }
}
