use nalgebra::{DMatrix, DVector};
use std::sync::Arc;

use crate::convergence::{ConvergenceCriterion, ElboDiff};
use crate::data::DataMatrix;
use crate::ebnm::{normal_means_loglik, Ebnm, EbnmOutput, PointNormal};
use crate::error::{EbmfError, Result};
use crate::fit_state::{ColumnFit, Component, FitState, Side};
use crate::init::Initialization;
use crate::variance::VarianceType;

/// Default floor on every estimated residual variance.
pub const DEFAULT_MIN_VARIANCE: f64 = 1e-10;

/// The EBMF engine: the data together with every modelling choice made about it.
///
/// The engine itself is immutable once built; fits live in [`FitState`]s which are passed to
/// the fitting stages ([`Ebmf::greedy`], [`Ebmf::backfit`], [`Ebmf::nullcheck`]) by exclusive
/// reference.
///
/// ## Note
///
/// Every stage commits a component update only once it has gone through completely, so that a
/// stage returning an error leaves the state it was given as it was before the failed update.
#[derive(Clone)]
pub struct Ebmf {
    data: DataMatrix,
    variance_type: VarianceType,
    ebnm_loadings: Arc<dyn Ebnm>,
    ebnm_factors: Arc<dyn Ebnm>,
    min_variance: f64,
    criterion: Arc<dyn ConvergenceCriterion>,
    monitors: Vec<(String, Arc<dyn ConvergenceCriterion>)>,
}

impl Ebmf {
    /// A point-normal prior on both sides, convergence on the ELBO and a constant residual
    /// variance (or, if the data carries standard errors, the variance those imply).
    pub fn new(data: DataMatrix) -> Ebmf {
        let variance_type = if data.standard_errors().is_some() {
            VarianceType::Fixed
        } else {
            VarianceType::Constant
        };
        Ebmf {
            data,
            variance_type,
            ebnm_loadings: Arc::new(PointNormal::default()),
            ebnm_factors: Arc::new(PointNormal::default()),
            min_variance: DEFAULT_MIN_VARIANCE,
            criterion: Arc::new(ElboDiff),
            monitors: vec![],
        }
    }

    pub fn with_variance_type(self, variance_type: VarianceType) -> Ebmf {
        if variance_type == VarianceType::Kronecker {
            log::warn!(
                "Kronecker residual variance is re-estimated iteratively at every update; \
                expect fits to be much slower"
            );
        }
        Ebmf {
            variance_type,
            ..self
        }
    }

    /// Uses the same solver for loadings and factors.
    pub fn with_ebnm<E: Ebnm + 'static>(self, ebnm: E) -> Ebmf {
        let ebnm: Arc<dyn Ebnm> = Arc::new(ebnm);
        Ebmf {
            ebnm_loadings: ebnm.clone(),
            ebnm_factors: ebnm,
            ..self
        }
    }

    pub fn with_ebnm_loadings<E: Ebnm + 'static>(self, ebnm: E) -> Ebmf {
        Ebmf {
            ebnm_loadings: Arc::new(ebnm),
            ..self
        }
    }

    pub fn with_ebnm_factors<E: Ebnm + 'static>(self, ebnm: E) -> Ebmf {
        Ebmf {
            ebnm_factors: Arc::new(ebnm),
            ..self
        }
    }

    /// # Panics
    ///
    /// This function panics if `min_variance` is not strictly positive.
    pub fn with_min_variance(self, min_variance: f64) -> Ebmf {
        assert!(min_variance > 0.0, "minimum variance must be positive");
        Ebmf {
            min_variance,
            ..self
        }
    }

    pub fn with_convergence_criterion<C: ConvergenceCriterion + 'static>(
        self,
        criterion: C,
    ) -> Ebmf {
        Ebmf {
            criterion: Arc::new(criterion),
            ..self
        }
    }

    /// Adds a criterion which is only evaluated and logged (at `debug` level) wherever the
    /// convergence criterion is.
    pub fn with_monitor<C: ConvergenceCriterion + 'static>(
        mut self,
        name: impl Into<String>,
        monitor: C,
    ) -> Ebmf {
        self.monitors.push((name.into(), Arc::new(monitor)));
        self
    }

    pub fn data(&self) -> &DataMatrix {
        &self.data
    }

    pub fn variance_type(&self) -> VarianceType {
        self.variance_type
    }

    pub fn min_variance(&self) -> f64 {
        self.min_variance
    }

    pub(crate) fn solver(&self, side: Side) -> &dyn Ebnm {
        match side {
            Side::Loadings => self.ebnm_loadings.as_ref(),
            Side::Factors => self.ebnm_factors.as_ref(),
        }
    }

    fn check_config(&self) -> Result<()> {
        match (self.variance_type, self.data.standard_errors().is_some()) {
            (VarianceType::Fixed, false) => Err(EbmfError::InvalidInput(
                "a fixed residual variance needs standard errors attached to the data".to_string(),
            )),
            (variance_type, true) if variance_type != VarianceType::Fixed => {
                Err(EbmfError::InvalidInput(format!(
                    "data with standard errors cannot have an estimated residual variance \
                    ({variance_type:?})"
                )))
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn check_state(&self, state: &FitState) -> Result<()> {
        self.check_config()?;
        if (state.nrows(), state.ncols()) != self.data.shape() {
            return Err(EbmfError::DimensionMismatch {
                what: "fit state",
                expected: self.data.shape(),
                got: (state.nrows(), state.ncols()),
            });
        }
        Ok(())
    }

    /// An empty fit (`K = 0`): only the residual variance is estimated.
    pub fn init_state(&self) -> Result<FitState> {
        self.check_config()?;
        let mut state = FitState::empty(self.data.nrows(), self.data.ncols());
        self.refresh(&mut state)?;
        Ok(state)
    }

    /// A fit seeded with the given components.
    pub fn init_state_with(&self, init: Initialization) -> Result<FitState> {
        let mut state = self.init_state()?;
        self.add_factors(&mut state, init)?;
        Ok(state)
    }

    /// Appends the components of `init` to the fit, as known values. Their priors are estimated
    /// on their first update (greedy or backfit).
    pub fn add_factors(&self, state: &mut FitState, init: Initialization) -> Result<()> {
        self.check_state(state)?;
        let (loadings, factors) = init.into_columns(state.nrows(), state.ncols())?;
        let mut next = state.clone();
        for (l, f) in loadings.column_iter().zip(factors.column_iter()) {
            next.push(Component {
                loadings: ColumnFit::seeded(l.into_owned()),
                factors: ColumnFit::seeded(f.into_owned()),
            });
        }
        self.refresh(&mut next)?;
        log::debug!(
            "Seeded {} components, ELBO is now {}",
            loadings.ncols(),
            next.elbo()
        );
        *state = next;
        Ok(())
    }

    /// Appends an intercept: `side` is fixed to a vector of ones and the other side starts at
    /// the observed means of the residual (row means for an intercept in the factors, column
    /// means for one in the loadings).
    pub fn add_intercept(&self, state: &mut FitState, side: Side) -> Result<()> {
        self.check_state(state)?;
        let residual = state.residual(&self.data);
        let mask = self.data.mask();
        let component = match side {
            Side::Loadings => Component {
                loadings: ColumnFit::seeded(DVector::from_element(state.nrows(), 1.0)),
                factors: ColumnFit::seeded(observed_means(
                    &residual.row_sum().transpose(),
                    &mask.col_counts(),
                )),
            },
            Side::Factors => Component {
                loadings: ColumnFit::seeded(observed_means(
                    &residual.column_sum(),
                    &mask.row_counts(),
                )),
                factors: ColumnFit::seeded(DVector::from_element(state.ncols(), 1.0)),
            },
        };

        let mut next = state.clone();
        next.push(component);
        next.fix(next.n_factors() - 1, side)?;
        self.refresh(&mut next)?;
        *state = next;
        Ok(())
    }

    pub fn fix_loadings(&self, state: &mut FitState, k: usize) -> Result<()> {
        self.fix(state, k, Side::Loadings)
    }

    pub fn fix_factors(&self, state: &mut FitState, k: usize) -> Result<()> {
        self.fix(state, k, Side::Factors)
    }

    fn fix(&self, state: &mut FitState, k: usize, side: Side) -> Result<()> {
        self.check_state(state)?;
        let mut next = state.clone();
        next.fix(k, side)?;
        self.refresh(&mut next)?;
        *state = next;
        Ok(())
    }

    pub(crate) fn refresh(&self, state: &mut FitState) -> Result<()> {
        state.refresh(&self.data, self.variance_type, self.min_variance)
    }

    /// The pseudo-observations `(x, s)` of the EBNM problem for one side of component `k`,
    /// given the precision matrix `tau`. Entries the other side says nothing about get `x = 0`
    /// and `s = inf`.
    pub(crate) fn observations(
        &self,
        state: &FitState,
        k: usize,
        side: Side,
        tau: &DMatrix<f64>,
    ) -> (DVector<f64>, DVector<f64>) {
        let weighted = tau.component_mul(&state.residual_without(k, &self.data));
        let other = state.component(k).side(side.other());
        let (numerator, denominator) = match side {
            Side::Loadings => (&weighted * other.mean(), tau * other.second_moment()),
            Side::Factors => (
                weighted.tr_mul(other.mean()),
                tau.tr_mul(other.second_moment()),
            ),
        };

        let x = numerator.zip_map(&denominator, |num, den| if den > 0.0 { num / den } else { 0.0 });
        let s = denominator.map(|den| {
            if den > 0.0 {
                den.sqrt().recip()
            } else {
                f64::INFINITY
            }
        });
        (x, s)
    }

    /// Solves the EBNM problem of one side of component `k` and stores its posterior.
    fn update_side(&self, state: &mut FitState, k: usize, side: Side) -> Result<()> {
        if state.component(k).side(side).is_fixed() {
            return Ok(());
        }
        let tau = state.noise().precision_matrix(&self.data);
        let (x, s) = self.observations(state, k, side, &tau);
        let init = state.component(k).side(side).prior().cloned();
        let solution = self
            .solver(side)
            .solve(&x, &s, None, init.as_ref(), EbnmOutput::default())?;

        let neg_kl = if solution.prior.is_null() {
            0.0
        } else {
            solution.log_likelihood
                - normal_means_loglik(
                    &x,
                    &s,
                    &solution.posterior_mean,
                    &solution.posterior_second_moment,
                )
        };
        *state.components[k].side_mut(side) = ColumnFit {
            mean: solution.posterior_mean,
            second_moment: solution.posterior_second_moment,
            prior: Some(solution.prior),
            neg_kl,
            fixed: false,
        };
        Ok(())
    }

    /// One update of component `k`: loadings, factors, then the residual variance, with the
    /// ELBO recomputed after each of them. Nothing is written to `state` unless all three go
    /// through.
    pub(crate) fn update_component(&self, state: &mut FitState, k: usize) -> Result<()> {
        let mut next = state.clone();
        for side in [Side::Loadings, Side::Factors] {
            self.update_side(&mut next, k, side)?;
            next.refresh_elbo(&self.data)?;
        }
        self.refresh(&mut next)?;
        next.n_iter += 1;
        *state = next;
        Ok(())
    }

    /// Evaluates the convergence criterion, logging it together with every monitor.
    pub(crate) fn compare(&self, current: &FitState, previous: &FitState, k: Option<usize>) -> f64 {
        for (name, monitor) in &self.monitors {
            log::debug!(
                "Monitor {name} at iteration {}: {}",
                current.n_iter(),
                monitor.evaluate(current, previous, k)
            );
        }
        let value = self.criterion.evaluate(current, previous, k);
        log::debug!(
            "Convergence criterion at iteration {} (component {k:?}): {value:e}",
            current.n_iter()
        );
        value
    }

    /// Tolerance used by the stages when none is given: `n_observed * sqrt(eps)`.
    pub fn default_tol(&self) -> f64 {
        self.data.n_observed() as f64 * f64::EPSILON.sqrt()
    }
}

fn observed_means(sums: &DVector<f64>, counts: &DVector<f64>) -> DVector<f64> {
    sums.zip_map(counts, |sum, count| if count > 0.0 { sum / count } else { 0.0 })
}
