//! Stopping rules for the greedy and backfitting loops.
//!
//! A criterion maps `(current, previous, active component)` to a non-negative number which the
//! loops compare against their tolerance. The active component is only set while a single
//! component is being worked on (greedy alternation, sequential backfit); full-sweep comparisons
//! pass `None`.

use nalgebra::DVector;

use crate::fit_state::{FitState, Side};

pub trait ConvergenceCriterion: Send + Sync {
    /// Must be deterministic, free of side effects, and return `0.0` when `current` and
    /// `previous` are the same fit.
    fn evaluate(&self, current: &FitState, previous: &FitState, k: Option<usize>) -> f64;
}

impl<F> ConvergenceCriterion for F
where
    F: Fn(&FitState, &FitState, Option<usize>) -> f64 + Send + Sync,
{
    fn evaluate(&self, current: &FitState, previous: &FitState, k: Option<usize>) -> f64 {
        self(current, previous, k)
    }
}

/// Absolute change in ELBO. The default criterion.
#[derive(Debug, Clone, Copy, Default)]
pub struct ElboDiff;

impl ConvergenceCriterion for ElboDiff {
    fn evaluate(&self, current: &FitState, previous: &FitState, _k: Option<usize>) -> f64 {
        if current.elbo() == previous.elbo() {
            return 0.0;
        }
        (current.elbo() - previous.elbo()).abs()
    }
}

/// Largest absolute change of any entry of the unit-normalized loadings.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxChangeLoadings;

/// Largest absolute change of any entry of the unit-normalized factors.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxChangeFactors;

impl ConvergenceCriterion for MaxChangeLoadings {
    fn evaluate(&self, current: &FitState, previous: &FitState, k: Option<usize>) -> f64 {
        max_normalized_change(current, previous, k, Side::Loadings)
    }
}

impl ConvergenceCriterion for MaxChangeFactors {
    fn evaluate(&self, current: &FitState, previous: &FitState, k: Option<usize>) -> f64 {
        max_normalized_change(current, previous, k, Side::Factors)
    }
}

fn normalized(column: &DVector<f64>) -> DVector<f64> {
    let norm = column.norm();
    if norm > 0.0 {
        column / norm
    } else {
        column.clone()
    }
}

fn max_normalized_change(
    current: &FitState,
    previous: &FitState,
    k: Option<usize>,
    side: Side,
) -> f64 {
    if current.n_factors() != previous.n_factors() {
        return f64::INFINITY;
    }
    let components = match k {
        Some(k) if k < current.n_factors() => k..k + 1,
        Some(_) => return f64::INFINITY,
        None => 0..current.n_factors(),
    };

    components
        .map(|k| {
            let now = normalized(current.component(k).side(side).mean());
            let before = normalized(previous.component(k).side(side).mean());
            (now - before).amax()
        })
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fit_state::{ColumnFit, Component};
    use nalgebra::dvector;

    fn toy_state() -> FitState {
        let mut state = FitState::empty(3, 2);
        state.push(Component {
            loadings: ColumnFit::seeded(dvector![1.0, 2.0, 2.0]),
            factors: ColumnFit::seeded(dvector![3.0, 4.0]),
        });
        state.elbo = -12.5;
        state
    }

    #[test]
    fn test_reflexive() {
        let state = toy_state();
        let criteria: Vec<Box<dyn ConvergenceCriterion>> = vec![
            Box::new(ElboDiff),
            Box::new(MaxChangeLoadings),
            Box::new(MaxChangeFactors),
        ];
        for criterion in criteria {
            assert_eq!(criterion.evaluate(&state, &state, None), 0.0);
            assert_eq!(criterion.evaluate(&state, &state, Some(0)), 0.0);
        }
    }

    #[test]
    fn test_scale_invariant_change() {
        let state = toy_state();
        let mut scaled = state.clone();
        scaled.components[0].loadings.mean *= 10.0;
        scaled.elbo = -10.0;
        assert!(MaxChangeLoadings.evaluate(&scaled, &state, Some(0)) < 1e-12);
        approx::assert_relative_eq!(ElboDiff.evaluate(&scaled, &state, None), 2.5);

        let mut grown = state.clone();
        grown.push(state.components[0].clone());
        assert_eq!(MaxChangeFactors.evaluate(&grown, &state, None), f64::INFINITY);
    }

    #[test]
    fn test_closure_criterion() {
        let state = toy_state();
        let criterion = |current: &FitState, previous: &FitState, _: Option<usize>| {
            (current.n_factors() as f64 - previous.n_factors() as f64).abs()
        };
        assert_eq!(criterion.evaluate(&state, &state, None), 0.0);
    }
}
