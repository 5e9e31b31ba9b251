use nalgebra::DVector;
use serde_derive::{Deserialize, Serialize};

use crate::utils::{log_add_exp, normal_log_density};

/// A prior on the entries of one column of `L` or `F`, as estimated by an EBNM solver.
///
/// The engine treats priors as opaque: it stores them, hands them back to the solver that
/// produced them, and never looks inside. The variants below are the families understood by
/// the solvers shipped with this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Prior {
    /// All mass at `location`. With `location == 0` this is the null prior, which zeroes a
    /// column out.
    PointMass { location: f64 },
    /// A zero-mean normal distribution.
    Normal { variance: f64 },
    /// A spike at zero with weight `pi0` plus a zero-mean normal slab with weight `1 - pi0`.
    PointNormal { pi0: f64, variance: f64 },
}

/// One component of a per-entry posterior: `(weight, mean, variance)`. A zero variance
/// stands for a point mass.
pub(crate) type PosteriorComponent = (f64, f64, f64);

impl Prior {
    /// The point mass at zero.
    pub fn null() -> Prior {
        Prior::PointMass { location: 0.0 }
    }

    /// Whether this prior forces every posterior mean to zero.
    pub fn is_null(&self) -> bool {
        match *self {
            Prior::PointMass { location } => location == 0.0,
            Prior::Normal { variance } => variance == 0.0,
            Prior::PointNormal { pi0, variance } => pi0 >= 1.0 || variance == 0.0,
        }
    }

    /// Log of the marginal density of one observation `x` with finite standard error `s`.
    pub(crate) fn log_marginal_one(&self, x: f64, s: f64) -> f64 {
        let s2 = s * s;
        match *self {
            Prior::PointMass { location } => normal_log_density(x, location, s2),
            Prior::Normal { variance } => normal_log_density(x, 0.0, s2 + variance),
            Prior::PointNormal { pi0, variance } => log_add_exp(
                pi0.ln() + normal_log_density(x, 0.0, s2),
                (1.0 - pi0).ln() + normal_log_density(x, 0.0, s2 + variance),
            ),
        }
    }

    /// The marginal log-likelihood of a set of observations. Entries with an infinite standard
    /// error carry no information and do not contribute.
    pub fn log_marginal(&self, x: &DVector<f64>, s: &DVector<f64>) -> f64 {
        x.iter()
            .zip(s.iter())
            .filter(|(_, si)| si.is_finite())
            .map(|(&xi, &si)| self.log_marginal_one(xi, si))
            .sum()
    }

    /// The posterior of one entry as a two-component mixture of normals (unused components have
    /// zero weight).
    pub(crate) fn posterior_one(&self, x: f64, s: f64) -> [PosteriorComponent; 2] {
        match *self {
            Prior::PointMass { location } => [(1.0, location, 0.0), (0.0, 0.0, 0.0)],
            Prior::Normal { variance } => [normal_posterior(x, s, variance), (0.0, 0.0, 0.0)],
            Prior::PointNormal { pi0, variance } => {
                let (_, mean, post_variance) = normal_posterior(x, s, variance);
                let slab = if s.is_finite() {
                    let s2 = s * s;
                    let log_spike = pi0.ln() + normal_log_density(x, 0.0, s2);
                    let log_slab = (1.0 - pi0).ln() + normal_log_density(x, 0.0, s2 + variance);
                    (log_slab - log_add_exp(log_spike, log_slab)).exp()
                } else {
                    1.0 - pi0
                };
                [(1.0 - slab, 0.0, 0.0), (slab, mean, post_variance)]
            }
        }
    }
}

/// Posterior of `theta ~ N(0, variance)` after observing `x ~ N(theta, s^2)`.
fn normal_posterior(x: f64, s: f64, variance: f64) -> PosteriorComponent {
    if !s.is_finite() {
        return (1.0, 0.0, variance);
    }
    let s2 = s * s;
    let shrink = variance / (variance + s2);
    (1.0, shrink * x, shrink * s2)
}
