//! This crate implements _Empirical Bayes Matrix Factorization_ (EBMF) in pure Rust: a data
//! matrix `Y` (`n x p`, possibly with missing entries) is approximated as `L * F^T + E`, where
//! every column of the loadings `L` and of the factors `F` gets its own prior, estimated from
//! the data itself. The fit is a variational one, maximizing the evidence lower bound (ELBO)
//! under a fully factorized posterior.
//!
//! A typical fit goes in three stages:
//! 1. [`Ebmf::greedy`] adds rank-one components one at a time, for as long as they improve the
//!    ELBO.
//! 2. [`Ebmf::backfit`] refits all of them jointly, either one component after the other or with
//!    extrapolated sweeps (the default), until convergence.
//! 3. [`Ebmf::nullcheck`] drops the components that the ELBO can do without.
//!
//! ```no_run
//! use ebmf::{BackfitControl, DataMatrix, Ebmf, GreedyControl, NullcheckControl};
//! # fn main() -> ebmf::Result<()> {
//! # let y = nalgebra::DMatrix::zeros(10, 5);
//! let engine = Ebmf::new(DataMatrix::mask_non_finite(y));
//! let mut state = engine.init_state()?;
//! engine.greedy(&mut state, &GreedyControl::default())?;
//! engine.backfit(&mut state, &BackfitControl::default())?;
//! engine.nullcheck(&mut state, &NullcheckControl::default())?;
//! println!("{} components, ELBO {}", state.n_factors(), state.elbo());
//! # Ok(())
//! # }
//! ```
//!
//! Priors come from solvers of the Empirical Bayes Normal Means problem (see [`Ebnm`]);
//! [`PointNormal`] and [`Normal`] come with the crate and anything implementing the trait can
//! be plugged in.
//!
//! To get to know more about EBMF, please check the references below:
//! * <https://arxiv.org/abs/1802.06931>: Wang and Stephens, _Empirical Bayes Matrix
//!   Factorization_.
//! * <https://arxiv.org/abs/2203.16783>: Willwerscheid, Carbonetto and Stephens, on fitting it
//!   at scale (`flashier`).

mod backfit;
mod convergence;
mod data;
mod ebnm;
mod engine;
mod error;
mod fit_state;
mod greedy;
mod init;
mod nullcheck;
mod prior;
mod sampler;
mod utils;
mod variance;

pub use backfit::{BackfitControl, BackfitMode, BackfitReport, ExtrapolationControl, FitStatus};
pub use convergence::{ConvergenceCriterion, ElboDiff, MaxChangeFactors, MaxChangeLoadings};
pub use data::{DataMatrix, StandardErrors};
pub use ebnm::{
    normal_means_loglik, validate_observations, Ebnm, EbnmOutput, EbnmSolution, Normal,
    PointNormal, PosteriorMixture,
};
pub use engine::{Ebmf, DEFAULT_MIN_VARIANCE};
pub use error::{EbmfError, Result};
pub use fit_state::{ColumnFit, Component, FitState, Side};
pub use greedy::{GreedyControl, GreedyReport, GreedyStop};
pub use init::Initialization;
pub use nullcheck::{NullcheckControl, NullcheckReport};
pub use prior::Prior;
pub use sampler::{PosteriorDraw, PosteriorSampler};
pub use utils::{cosine_similarity, Mask};
pub use variance::{NoiseParams, VarianceType};

#[cfg(test)]
mod test {
    use super::*;

    use nalgebra::{DMatrix, DVector};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Bernoulli, Distribution};
    use utils::standard_noise_matrix;

    /// `u * v^T + noise_sd * Z` for standard normal `u`, `v` and `Z`.
    fn rank_one(
        n: usize,
        p: usize,
        noise_sd: f64,
        seed: u64,
    ) -> (DMatrix<f64>, DVector<f64>, DVector<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let u = standard_noise_matrix(n, 1, &mut rng).column(0).into_owned();
        let v = standard_noise_matrix(p, 1, &mut rng).column(0).into_owned();
        let noise = standard_noise_matrix(n, p, &mut rng) * noise_sd;
        (&u * v.transpose() + noise, u, v)
    }

    fn rank_two(n: usize, p: usize, seed: u64) -> DMatrix<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let loadings = standard_noise_matrix(n, 2, &mut rng) * 2.0;
        let factors = standard_noise_matrix(p, 2, &mut rng);
        loadings * factors.transpose() + standard_noise_matrix(n, p, &mut rng) * 0.2
    }

    fn greedy_up_to(engine: &Ebmf, max_factors: usize) -> (FitState, GreedyReport) {
        let mut state = engine.init_state().unwrap();
        let report = engine
            .greedy(
                &mut state,
                &GreedyControl {
                    max_factors,
                    ..GreedyControl::default()
                },
            )
            .unwrap();
        (state, report)
    }

    #[test]
    fn test_rank_one_recovery() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (y, u, v) = rank_one(20, 10, 0.1, 42);
        let engine = Ebmf::new(DataMatrix::new(y).unwrap()).with_monitor("L", MaxChangeLoadings);

        let (state, report) = greedy_up_to(&engine, 1);
        assert_eq!(report.n_added, 1);
        let loadings = state.loadings().column(0).into_owned();
        assert!(cosine_similarity(&loadings, &u).abs() > 0.99);
        let factors = state.factors().column(0).into_owned();
        assert!(cosine_similarity(&factors, &v).abs() > 0.99);

        // There is nothing left to find.
        let (state, report) = greedy_up_to(&engine, 2);
        assert_eq!(state.n_factors(), 1);
        assert_eq!(report.stop, GreedyStop::GainNonPositive);
    }

    #[test]
    fn test_nullcheck_keeps_greedy_components() {
        let engine = Ebmf::new(DataMatrix::new(rank_two(30, 12, 3)).unwrap());
        let (mut state, _) = greedy_up_to(&engine, 5);
        let n_factors = state.n_factors();
        assert!(n_factors >= 2);
        let report = engine
            .nullcheck(&mut state, &NullcheckControl::default())
            .unwrap();
        assert!(report.removed.is_empty());
        assert_eq!(state.n_factors(), n_factors);
    }

    #[test]
    fn test_nullcheck_removes_noise_component() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (y, _, _) = rank_one(25, 12, 0.1, 7);
        let engine = Ebmf::new(DataMatrix::new(y).unwrap());
        let (mut state, _) = greedy_up_to(&engine, 1);

        let mut rng = StdRng::seed_from_u64(8);
        engine
            .add_factors(
                &mut state,
                Initialization::Factors {
                    loadings: standard_noise_matrix(25, 1, &mut rng) * 0.01,
                    factors: standard_noise_matrix(12, 1, &mut rng) * 0.01,
                },
            )
            .unwrap();
        engine
            .backfit(&mut state, &BackfitControl::default())
            .unwrap();
        let report = engine
            .nullcheck(&mut state, &NullcheckControl::default())
            .unwrap();
        assert_eq!(report.removed, vec![1]);
        assert_eq!(state.n_factors(), 1);
    }

    /// Always uses the same (wide) normal prior, so that no column is ever shrunk exactly to zero.
    #[derive(Debug)]
    struct FixedNormal(f64);

    impl Ebnm for FixedNormal {
        fn solve(
            &self,
            x: &DVector<f64>,
            s: &DVector<f64>,
            fixed: Option<&Prior>,
            _init: Option<&Prior>,
            output: EbnmOutput,
        ) -> Result<EbnmSolution> {
            validate_observations(x, s)?;
            let prior = fixed.cloned().unwrap_or(Prior::Normal { variance: self.0 });
            EbnmSolution::from_prior(prior, x, s, output)
        }
    }

    #[test]
    fn test_nullcheck_removes_non_zero_noise_component() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (y, u, _) = rank_one(25, 12, 0.1, 7);
        let engine = Ebmf::new(DataMatrix::new(y).unwrap()).with_ebnm(FixedNormal(100.0));
        let (mut state, _) = greedy_up_to(&engine, 1);
        assert_eq!(state.n_factors(), 1);

        let mut rng = StdRng::seed_from_u64(8);
        engine
            .add_factors(
                &mut state,
                Initialization::Factors {
                    loadings: standard_noise_matrix(25, 1, &mut rng) * 0.3,
                    factors: standard_noise_matrix(12, 1, &mut rng) * 0.3,
                },
            )
            .unwrap();
        for _ in 0..3 {
            engine.update_component(&mut state, 1).unwrap();
        }
        assert!(!state.component(1).is_zero());
        assert_eq!(
            state.component(1).loadings.prior(),
            Some(&Prior::Normal { variance: 100.0 })
        );

        let with_noise = state.elbo();
        let report = engine
            .nullcheck(&mut state, &NullcheckControl::default())
            .unwrap();
        assert_eq!(report.removed, vec![1]);
        assert_eq!(state.n_factors(), 1);
        assert!(state.elbo() >= with_noise);
        let loadings = state.loadings().column(0).into_owned();
        assert!(cosine_similarity(&loadings, &u).abs() > 0.99);
    }

    /// Backfits a greedy fit with both modes and checks that they land on the same fit, each
    /// with a non-decreasing ELBO.
    fn assert_backfit_modes_agree(engine: &Ebmf, n_factors: usize) {
        let (state, _) = greedy_up_to(engine, n_factors);
        assert_eq!(state.n_factors(), n_factors);

        let fit = |mode| {
            let mut state = state.clone();
            let report = engine
                .backfit(
                    &mut state,
                    &BackfitControl {
                        mode,
                        ..BackfitControl::default()
                    },
                )
                .unwrap();
            assert_eq!(report.status, FitStatus::Converged);
            for pair in report.elbo_trace.windows(2) {
                assert!(pair[1] >= pair[0] - engine.default_tol(), "{pair:?}");
            }
            state
        };

        let sequential = fit(BackfitMode::Sequential);
        let extrapolated = fit(BackfitMode::default());
        let difference = (sequential.fitted() - extrapolated.fitted()).norm();
        assert!(difference < 0.01 * sequential.fitted().norm());
        // Backfitting only ever improves on the greedy fit.
        assert!(sequential.elbo() >= state.elbo());
        assert!(extrapolated.elbo() >= state.elbo());
    }

    #[test]
    fn test_backfit_modes_agree_on_rank_one() {
        let (y, _, _) = rank_one(20, 10, 0.1, 13);
        assert_backfit_modes_agree(&Ebmf::new(DataMatrix::new(y).unwrap()), 1);
    }

    #[test]
    fn test_backfit_modes_agree_on_rank_two() {
        let y = rank_two(40, 15, 11);
        assert_backfit_modes_agree(&Ebmf::new(DataMatrix::new(y).unwrap()), 2);
    }

    #[test]
    fn test_kronecker_backfit_is_monotone() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut rng = StdRng::seed_from_u64(31);
        let row_scale = standard_noise_matrix(30, 1, &mut rng).map(|v| 0.1 + 0.2 * v.abs());
        let col_scale = standard_noise_matrix(10, 1, &mut rng).map(|v| 0.1 + 0.2 * v.abs());
        let noise = (&row_scale * col_scale.transpose())
            .component_mul(&standard_noise_matrix(30, 10, &mut rng));
        let y = rank_two(30, 10, 32) + noise;
        let engine =
            Ebmf::new(DataMatrix::new(y).unwrap()).with_variance_type(VarianceType::Kronecker);

        for mode in [BackfitMode::Sequential, BackfitMode::default()] {
            let (mut state, _) = greedy_up_to(&engine, 2);
            let start = state.elbo();
            let report = engine
                .backfit(
                    &mut state,
                    &BackfitControl {
                        max_iter: 50,
                        mode,
                        ..BackfitControl::default()
                    },
                )
                .unwrap();
            assert!(matches!(state.noise(), NoiseParams::Kronecker { .. }));
            assert!(report.elbo_trace[0] >= start - engine.default_tol());
            for pair in report.elbo_trace.windows(2) {
                assert!(pair[1] >= pair[0] - engine.default_tol(), "{mode:?}: {pair:?}");
            }
        }
    }

    #[test]
    fn test_variance_structures_are_ordered() {
        let y = rank_two(20, 8, 5);
        let engine = Ebmf::new(DataMatrix::new(y.clone()).unwrap());
        let (state, _) = greedy_up_to(&engine, 2);

        let elbo = |variance_type| {
            let engine =
                Ebmf::new(DataMatrix::new(y.clone()).unwrap()).with_variance_type(variance_type);
            let mut state = state.clone();
            engine.refresh(&mut state).unwrap();
            assert_eq!(state.noise().variance_type(), variance_type);
            state.elbo()
        };
        let constant = elbo(VarianceType::Constant);
        let by_row = elbo(VarianceType::ByRow);
        let by_column = elbo(VarianceType::ByColumn);
        let kronecker = elbo(VarianceType::Kronecker);
        assert!(by_row >= constant - 1e-9);
        assert!(by_column >= constant - 1e-9);
        assert!(kronecker >= by_column - 1e-9);
    }

    #[test]
    fn test_missing_data() {
        let (y, u, _) = rank_one(30, 12, 0.1, 99);
        let mut rng = StdRng::seed_from_u64(100);
        let missing = Bernoulli::new(0.2).unwrap();
        let mask = Mask::from_fn(30, 12, |_, _| !missing.sample(&mut rng));
        let data = DataMatrix::with_mask(y.clone(), mask.clone()).unwrap();
        assert!(!mask.is_complete());

        let engine = Ebmf::new(data).with_variance_type(VarianceType::ByColumn);
        let (mut state, _) = greedy_up_to(&engine, 3);
        engine
            .backfit(&mut state, &BackfitControl::default())
            .unwrap();
        assert!(state.n_factors() >= 1);
        let loadings = state.loadings().column(0).into_owned();
        assert!(cosine_similarity(&loadings, &u).abs() > 0.98);

        // Missing entries are imputed by the fit.
        let fitted = state.fitted();
        for j in 0..12 {
            for i in 0..30 {
                if !mask.is_set(i, j) {
                    assert!((fitted[(i, j)] - y[(i, j)]).abs() < 0.5);
                }
            }
        }
    }

    #[test]
    fn test_fixed_standard_errors() {
        let (y, u, _) = rank_one(20, 10, 0.1, 21);
        let data = DataMatrix::new(y).unwrap().with_standard_error(0.1).unwrap();
        let engine = Ebmf::new(data);
        assert_eq!(engine.variance_type(), VarianceType::Fixed);

        let (mut state, _) = greedy_up_to(&engine, 1);
        engine
            .backfit(&mut state, &BackfitControl::default())
            .unwrap();
        assert_eq!(state.noise(), &NoiseParams::Fixed);
        let loadings = state.loadings().column(0).into_owned();
        assert!(cosine_similarity(&loadings, &u).abs() > 0.99);
    }

    #[test]
    fn test_svd_start() {
        let y = rank_two(25, 10, 17);
        let data = DataMatrix::new(y).unwrap();
        let engine = Ebmf::new(data.clone()).with_ebnm_factors(Normal::default());
        let mut state = engine
            .init_state_with(Initialization::truncated_svd(&data, 2).unwrap())
            .unwrap();
        let report = engine
            .backfit(&mut state, &BackfitControl::default())
            .unwrap();
        assert_eq!(report.status, FitStatus::Converged);
        assert_eq!(state.n_factors(), 2);
        assert!(state
            .components()
            .iter()
            .all(|component| matches!(component.factors.prior(), Some(Prior::Normal { .. }))));
    }
}
