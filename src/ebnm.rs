//! The Empirical Bayes Normal Means (EBNM) subproblem.
//!
//! Every update of a column of `L` or `F` boils down to: given pseudo-observations
//! `x_i ~ N(theta_i, s_i^2)` with known `s_i`, estimate a prior `g` for the `theta_i` and report
//! the posterior moments together with the marginal log-likelihood under `g`. The engine only
//! talks to solvers through the [`Ebnm`] trait.

use nalgebra::{DMatrix, DVector};
use rand::distributions::{Distribution, Standard};
use rand::Rng;
use rand_distr::StandardNormal;
use serde_derive::{Deserialize, Serialize};
use std::fmt::Debug;

use crate::error::{EbmfError, Result};
use crate::prior::Prior;
use crate::utils::LN_2PI;

/// What a solver should report besides the posterior moments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EbnmOutput {
    /// Also return the full posterior of each entry, so that it can be sampled from.
    pub sampler: bool,
}

/// The answer to one EBNM problem.
#[derive(Debug, Clone)]
pub struct EbnmSolution {
    pub posterior_mean: DVector<f64>,
    pub posterior_second_moment: DVector<f64>,
    pub prior: Prior,
    /// Marginal log-likelihood of the observations under `prior`.
    pub log_likelihood: f64,
    pub posterior: Option<PosteriorMixture>,
}

impl EbnmSolution {
    /// Summarizes the posterior of `x` under a given prior. Solvers working with the [`Prior`]
    /// families of this crate only need to estimate the prior and call this.
    pub fn from_prior(
        prior: Prior,
        x: &DVector<f64>,
        s: &DVector<f64>,
        output: EbnmOutput,
    ) -> Result<EbnmSolution> {
        let n = x.len();
        let mut mixture = PosteriorMixture {
            weights: DMatrix::zeros(n, 2),
            means: DMatrix::zeros(n, 2),
            variances: DMatrix::zeros(n, 2),
        };
        for (i, (&xi, &si)) in x.iter().zip(s.iter()).enumerate() {
            for (c, (w, m, v)) in prior.posterior_one(xi, si).into_iter().enumerate() {
                mixture.weights[(i, c)] = w;
                mixture.means[(i, c)] = m;
                mixture.variances[(i, c)] = v;
            }
        }

        let posterior_mean = mixture.weights.component_mul(&mixture.means).column_sum();
        let posterior_second_moment = (mixture
            .means
            .map(|m| m * m)
            + &mixture.variances)
            .component_mul(&mixture.weights)
            .column_sum();
        let log_likelihood = prior.log_marginal(x, s);

        if !log_likelihood.is_finite() {
            return Err(EbmfError::Solver(format!(
                "non-finite marginal log-likelihood under prior {prior:?}"
            )));
        }
        if posterior_mean
            .iter()
            .chain(posterior_second_moment.iter())
            .any(|v| !v.is_finite())
        {
            return Err(EbmfError::Solver(format!(
                "non-finite posterior moments under prior {prior:?}"
            )));
        }

        Ok(EbnmSolution {
            posterior_mean,
            posterior_second_moment,
            prior,
            log_likelihood,
            posterior: if output.sampler { Some(mixture) } else { None },
        })
    }
}

/// A solver for the EBNM problem over some family of priors.
///
/// Contract:
/// * `s_i > 0` for every `i`; `s_i = inf` means that `x_i` carries no information (its
///   posterior is the prior itself). Anything else is an [`EbmfError::InvalidInput`].
/// * When `fixed` is given, the solver must not estimate anything: it returns the posterior and
///   the likelihood under that prior.
/// * `init` is a hint (usually the prior fitted at the previous iteration). Solvers used by the
///   engine must never return a prior with a lower marginal likelihood than `init` when `init`
///   belongs to their family, or the ELBO would not be monotone.
/// * Solvers are pure: no state is kept between calls.
pub trait Ebnm: Send + Sync + Debug {
    fn solve(
        &self,
        x: &DVector<f64>,
        s: &DVector<f64>,
        fixed: Option<&Prior>,
        init: Option<&Prior>,
        output: EbnmOutput,
    ) -> Result<EbnmSolution>;
}

/// Checks the inputs of an EBNM problem.
pub fn validate_observations(x: &DVector<f64>, s: &DVector<f64>) -> Result<()> {
    if x.len() != s.len() {
        return Err(EbmfError::DimensionMismatch {
            what: "EBNM standard errors",
            expected: (x.len(), 1),
            got: (s.len(), 1),
        });
    }
    for (i, (&xi, &si)) in x.iter().zip(s.iter()).enumerate() {
        if !(si > 0.0) {
            return Err(EbmfError::InvalidInput(format!(
                "standard error {i} must be positive, got {si}"
            )));
        }
        if si.is_finite() && !xi.is_finite() {
            return Err(EbmfError::InvalidInput(format!(
                "observation {i} is not finite: {xi}"
            )));
        }
    }
    Ok(())
}

/// `E_q[log N(x | theta, s^2)]` summed over entries, given the first and second posterior
/// moments of `theta`. The difference between a solver's log-likelihood and this quantity is
/// `-KL(q || g)`, the contribution of one column to the ELBO.
pub fn normal_means_loglik(
    x: &DVector<f64>,
    s: &DVector<f64>,
    mean: &DVector<f64>,
    second_moment: &DVector<f64>,
) -> f64 {
    x.iter()
        .zip(s.iter())
        .zip(mean.iter().zip(second_moment.iter()))
        .filter(|((_, si), _)| si.is_finite())
        .map(|((&xi, &si), (&ei, &e2i))| {
            let s2 = si * si;
            -0.5 * (LN_2PI + s2.ln()) - 0.5 * (xi * xi - 2.0 * xi * ei + e2i) / s2
        })
        .sum()
}

/// Per-entry posterior, as a mixture of normals (a zero variance stands for a point mass). Row
/// `i` describes entry `i`; columns are mixture components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PosteriorMixture {
    pub weights: DMatrix<f64>,
    pub means: DMatrix<f64>,
    pub variances: DMatrix<f64>,
}

impl Distribution<DVector<f64>> for PosteriorMixture {
    fn sample<R>(&self, rng: &mut R) -> DVector<f64>
    where
        R: Rng + ?Sized,
    {
        (0..self.weights.nrows())
            .map(|i| {
                let u: f64 = Standard.sample(rng);
                let n_components = self.weights.ncols();
                let mut cumulative = 0.0;
                // Fall back to the last component with positive weight on round-off.
                let mut chosen = (0..n_components)
                    .rev()
                    .find(|&c| self.weights[(i, c)] > 0.0)
                    .unwrap_or(0);
                for c in 0..n_components {
                    cumulative += self.weights[(i, c)];
                    if u < cumulative {
                        chosen = c;
                        break;
                    }
                }
                let standard: f64 = StandardNormal.sample(rng);
                self.means[(i, chosen)] + self.variances[(i, chosen)].sqrt() * standard
            })
            .collect::<Vec<_>>()
            .into()
    }
}

/// Estimates `(slab weight, slab variance)` of a spike-and-slab (or, with `estimate_weight`
/// off, a plain normal) prior by EM on the marginal likelihood. Only entries with finite `s`
/// are passed in.
fn spike_slab_em(
    x: &[f64],
    s2: &[f64],
    start: (f64, f64),
    estimate_weight: bool,
    variance_floor: f64,
    max_iter: usize,
    tol: f64,
) -> (f64, f64) {
    let (mut weight, mut variance) = start;
    let mut last_llk = f64::NEG_INFINITY;

    for iter in 0..=max_iter {
        let prior = Prior::PointNormal {
            pi0: 1.0 - weight,
            variance,
        };
        let mut llk = 0.0;
        let mut total_slab = 0.0;
        let mut total_second_moment = 0.0;
        for (&xi, &si2) in x.iter().zip(s2) {
            llk += prior.log_marginal_one(xi, si2.sqrt());
            let [_, (slab, mean, post_variance)] = prior.posterior_one(xi, si2.sqrt());
            total_slab += slab;
            total_second_moment += slab * (mean * mean + post_variance);
        }

        if iter == max_iter || llk - last_llk < tol * (1.0 + llk.abs()) || total_slab <= 0.0 {
            break;
        }
        last_llk = llk;

        if estimate_weight {
            weight = total_slab / x.len() as f64;
        }
        variance = (total_second_moment / total_slab).max(variance_floor);
    }

    (weight, variance)
}

/// Shared estimation logic of the spike-and-slab family and its normal sub-family.
#[derive(Debug, Clone)]
struct SpikeSlabFit<'a> {
    x: Vec<f64>,
    s2: Vec<f64>,
    all_x: &'a DVector<f64>,
    all_s: &'a DVector<f64>,
}

impl<'a> SpikeSlabFit<'a> {
    fn new(x: &'a DVector<f64>, s: &'a DVector<f64>) -> SpikeSlabFit<'a> {
        let (x_finite, s2): (Vec<_>, Vec<_>) = x
            .iter()
            .zip(s.iter())
            .filter(|(_, si)| si.is_finite())
            .map(|(&xi, &si)| (xi, si * si))
            .unzip();
        SpikeSlabFit {
            x: x_finite,
            s2,
            all_x: x,
            all_s: s,
        }
    }

    fn default_variance(&self) -> f64 {
        let n = self.x.len() as f64;
        let mean_x2 = self.x.iter().map(|xi| xi * xi).sum::<f64>() / n;
        let mean_s2 = self.s2.iter().sum::<f64>() / n;
        (mean_x2 - mean_s2).max(mean_s2)
    }

    fn variance_floor(&self) -> f64 {
        let n = self.x.len() as f64;
        1e-10 * (self.x.iter().map(|xi| xi * xi).sum::<f64>() + self.s2.iter().sum::<f64>()) / n
            + f64::MIN_POSITIVE
    }

    /// Picks the most likely prior amongst the candidates; the point mass at zero wins ties.
    fn best(&self, candidates: Vec<Prior>) -> Prior {
        let null = Prior::null();
        let null_llk = null.log_marginal(self.all_x, self.all_s);
        candidates
            .into_iter()
            .map(|prior| (prior.log_marginal(self.all_x, self.all_s), prior))
            .filter(|(llk, _)| llk.is_finite())
            .fold((null_llk, null), |(best_llk, best), (llk, prior)| {
                if llk > best_llk {
                    (llk, prior)
                } else {
                    (best_llk, best)
                }
            })
            .1
    }
}

/// The point-normal family: `g = pi0 * delta_0 + (1 - pi0) * N(0, sigma^2)`. This is the
/// default prior family for both loadings and factors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointNormal {
    pub max_iter: usize,
    pub tol: f64,
}

impl Default for PointNormal {
    fn default() -> PointNormal {
        PointNormal {
            max_iter: 1_000,
            tol: 1e-10,
        }
    }
}

impl Ebnm for PointNormal {
    fn solve(
        &self,
        x: &DVector<f64>,
        s: &DVector<f64>,
        fixed: Option<&Prior>,
        init: Option<&Prior>,
        output: EbnmOutput,
    ) -> Result<EbnmSolution> {
        validate_observations(x, s)?;
        if let Some(prior) = fixed {
            return EbnmSolution::from_prior(prior.clone(), x, s, output);
        }

        let fit = SpikeSlabFit::new(x, s);
        if fit.x.is_empty() {
            // Nothing to learn from: keep whatever we had.
            let prior = init.cloned().unwrap_or_else(Prior::null);
            return EbnmSolution::from_prior(prior, x, s, output);
        }

        let floor = fit.variance_floor();
        let run = |start: (f64, f64)| {
            let (weight, variance) =
                spike_slab_em(&fit.x, &fit.s2, start, true, floor, self.max_iter, self.tol);
            Prior::PointNormal {
                pi0: 1.0 - weight,
                variance,
            }
        };

        let mut candidates = vec![run((0.5, fit.default_variance()))];
        match init {
            Some(&Prior::PointNormal { pi0, variance }) => {
                candidates.push(Prior::PointNormal { pi0, variance });
                if pi0 > 0.0 && pi0 < 1.0 && variance > 0.0 {
                    candidates.push(run((1.0 - pi0, variance)));
                }
            }
            Some(&Prior::Normal { variance }) => candidates.push(Prior::Normal { variance }),
            _ => {}
        }

        EbnmSolution::from_prior(fit.best(candidates), x, s, output)
    }
}

/// The zero-mean normal family: `g = N(0, sigma^2)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Normal {
    pub max_iter: usize,
    pub tol: f64,
}

impl Default for Normal {
    fn default() -> Normal {
        Normal {
            max_iter: 1_000,
            tol: 1e-10,
        }
    }
}

impl Ebnm for Normal {
    fn solve(
        &self,
        x: &DVector<f64>,
        s: &DVector<f64>,
        fixed: Option<&Prior>,
        init: Option<&Prior>,
        output: EbnmOutput,
    ) -> Result<EbnmSolution> {
        validate_observations(x, s)?;
        if let Some(prior) = fixed {
            return EbnmSolution::from_prior(prior.clone(), x, s, output);
        }

        let fit = SpikeSlabFit::new(x, s);
        if fit.x.is_empty() {
            let prior = init.cloned().unwrap_or_else(Prior::null);
            return EbnmSolution::from_prior(prior, x, s, output);
        }

        let floor = fit.variance_floor();
        let run = |variance: f64| {
            let (_, variance) = spike_slab_em(
                &fit.x,
                &fit.s2,
                (1.0, variance),
                false,
                floor,
                self.max_iter,
                self.tol,
            );
            Prior::Normal { variance }
        };

        let mut candidates = vec![run(fit.default_variance())];
        if let Some(&Prior::Normal { variance }) = init {
            candidates.push(Prior::Normal { variance });
            if variance > 0.0 {
                candidates.push(run(variance));
            }
        }

        EbnmSolution::from_prior(fit.best(candidates), x, s, output)
    }
}
