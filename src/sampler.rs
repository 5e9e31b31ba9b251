use nalgebra::{DMatrix, DVector};
use rand::distributions::Distribution;
use rand::Rng;

use crate::ebnm::{EbnmOutput, PosteriorMixture};
use crate::engine::Ebmf;
use crate::error::{EbmfError, Result};
use crate::fit_state::{FitState, Side};

/// One draw of `L` and `F` from the variational posterior.
#[derive(Debug, Clone, PartialEq)]
pub struct PosteriorDraw {
    /// `n x K`.
    pub loadings: DMatrix<f64>,
    /// `p x K`.
    pub factors: DMatrix<f64>,
}

#[derive(Debug, Clone)]
enum ColumnSampler {
    Fixed(DVector<f64>),
    Posterior(PosteriorMixture),
}

impl ColumnSampler {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> DVector<f64> {
        match self {
            ColumnSampler::Fixed(values) => values.clone(),
            ColumnSampler::Posterior(posterior) => posterior.sample(rng),
        }
    }
}

/// Samples from the posterior of the loadings and factors of a fit. Every column is drawn
/// independently, as the variational posterior factorizes over them.
#[derive(Debug, Clone)]
pub struct PosteriorSampler {
    nrows: usize,
    ncols: usize,
    loadings: Vec<ColumnSampler>,
    factors: Vec<ColumnSampler>,
}

impl Distribution<PosteriorDraw> for PosteriorSampler {
    fn sample<R>(&self, rng: &mut R) -> PosteriorDraw
    where
        R: Rng + ?Sized,
    {
        let mut loadings = DMatrix::zeros(self.nrows, self.loadings.len());
        let mut factors = DMatrix::zeros(self.ncols, self.factors.len());
        for (k, (l, f)) in self.loadings.iter().zip(&self.factors).enumerate() {
            loadings.set_column(k, &l.sample(rng));
            factors.set_column(k, &f.sample(rng));
        }
        PosteriorDraw { loadings, factors }
    }
}

impl Ebmf {
    /// A sampler for the posterior of `state`. Every free column must have been through at
    /// least one update, so that its prior is known.
    pub fn posterior_sampler(&self, state: &FitState) -> Result<PosteriorSampler> {
        self.check_state(state)?;
        let tau = state.noise().precision_matrix(self.data());

        let column_sampler = |k: usize, side: Side| -> Result<ColumnSampler> {
            let column = state.component(k).side(side);
            if column.is_fixed() {
                return Ok(ColumnSampler::Fixed(column.mean().clone()));
            }
            let prior = column.prior().ok_or_else(|| {
                EbmfError::InvalidInput(format!(
                    "{side:?} of component {k} have not been fitted yet"
                ))
            })?;
            let (x, s) = self.observations(state, k, side, &tau);
            let solution =
                self.solver(side)
                    .solve(&x, &s, Some(prior), None, EbnmOutput { sampler: true })?;
            solution.posterior.map(ColumnSampler::Posterior).ok_or_else(|| {
                EbmfError::Solver(format!("no posterior returned for {side:?} of component {k}"))
            })
        };

        let (mut loadings, mut factors) = (vec![], vec![]);
        for k in 0..state.n_factors() {
            loadings.push(column_sampler(k, Side::Loadings)?);
            factors.push(column_sampler(k, Side::Factors)?);
        }

        Ok(PosteriorSampler {
            nrows: state.nrows(),
            ncols: state.ncols(),
            loadings,
            factors,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::data::DataMatrix;
    use crate::greedy::GreedyControl;
    use crate::init::Initialization;
    use nalgebra::dmatrix;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn toy_data() -> DataMatrix {
        DataMatrix::new(dmatrix![
            1.0, 2.1, -0.9, 0.5;
            2.0, 3.9, -2.1, 1.1;
            -1.1, -2.0, 1.0, -0.4;
            0.4, 1.1, -0.5, 0.2;
            3.0, 6.1, -2.9, 1.4;
        ])
        .unwrap()
    }

    #[test]
    fn test_draws_have_fit_shapes() {
        let engine = Ebmf::new(toy_data());
        let mut state = engine.init_state().unwrap();
        engine
            .greedy(&mut state, &GreedyControl::default())
            .unwrap();
        assert!(state.n_factors() >= 1);

        let sampler = engine.posterior_sampler(&state).unwrap();
        let mut rng = StdRng::seed_from_u64(17);
        let draws = sampler.sample_iter(&mut rng).take(200).collect::<Vec<_>>();
        for draw in &draws {
            assert_eq!(draw.loadings.shape(), (5, state.n_factors()));
            assert_eq!(draw.factors.shape(), (4, state.n_factors()));
        }

        // The draws average out to the posterior means.
        let mean = draws
            .iter()
            .fold(DMatrix::zeros(5, state.n_factors()), |acc, draw| {
                acc + &draw.loadings
            })
            / draws.len() as f64;
        let scale = state.loadings().amax();
        assert!((mean - state.loadings()).amax() < 0.25 * scale);
    }

    #[test]
    fn test_unfitted_columns_are_rejected() {
        let engine = Ebmf::new(toy_data());
        let state = engine
            .init_state_with(Initialization::Factors {
                loadings: DMatrix::from_element(5, 1, 1.0),
                factors: DMatrix::from_element(4, 1, 1.0),
            })
            .unwrap();
        assert!(matches!(
            engine.posterior_sampler(&state),
            Err(EbmfError::InvalidInput(_))
        ));

        let mut state = state;
        engine.fix_loadings(&mut state, 0).unwrap();
        engine.fix_factors(&mut state, 0).unwrap();
        let draw = engine
            .posterior_sampler(&state)
            .unwrap()
            .sample(&mut StdRng::seed_from_u64(0));
        assert_eq!(draw.loadings, DMatrix::from_element(5, 1, 1.0));
    }
}
