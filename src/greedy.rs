use serde_derive::{Deserialize, Serialize};

use crate::engine::Ebmf;
use crate::error::{EbmfError, Result};
use crate::fit_state::{ColumnFit, Component, FitState};
use crate::init;

/// Settings of the greedy stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GreedyControl {
    /// Stop adding once the fit has this many components in total.
    pub max_factors: usize,
    /// Cap on the loadings/factors alternations spent on a single new component.
    pub max_iter: usize,
    /// Convergence tolerance of the alternation; `None` uses [`Ebmf::default_tol`].
    pub tol: Option<f64>,
    /// Cap on the alternating least squares iterations proposing a new direction.
    pub init_max_iter: usize,
    /// The proposal stops once no entry of its unit-norm factor moves by more than this.
    pub init_tol: f64,
}

impl Default for GreedyControl {
    fn default() -> GreedyControl {
        GreedyControl {
            max_factors: 50,
            max_iter: 500,
            tol: None,
            init_max_iter: 100,
            init_tol: 1e-8,
        }
    }
}

/// Why the greedy stage stopped adding components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GreedyStop {
    /// The last proposed component did not improve the ELBO and was dropped.
    GainNonPositive,
    MaxFactorsReached,
    /// The residual had no rank-one direction left to propose.
    DegenerateResidual,
    /// The last component hit the alternation cap. It was kept if it improved the ELBO.
    AlternationCapReached,
    /// A non-finite ELBO or variance came up; the fit is the last valid one.
    Degenerate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GreedyReport {
    pub n_added: usize,
    pub stop: GreedyStop,
    pub elbo: f64,
}

impl Ebmf {
    /// Seeds a new component at the leading rank-one direction of the residual.
    fn propose(&self, state: &FitState, control: &GreedyControl) -> Result<Option<FitState>> {
        let residual = state.residual(self.data());
        let observed = self.data().mask().as_matrix();
        let Some((loadings, factors)) =
            init::rank_one(&residual, &observed, control.init_max_iter, control.init_tol)
        else {
            return Ok(None);
        };

        let mut candidate = state.clone();
        candidate.push(Component {
            loadings: ColumnFit::seeded(loadings),
            factors: ColumnFit::seeded(factors),
        });
        candidate.refresh_elbo(self.data())?;
        Ok(Some(candidate))
    }

    /// Adds components one at a time, each fitted with every other component held fixed, for as
    /// long as they improve the ELBO.
    ///
    /// Solver failures are returned as errors, with `state` as it was before the failing update.
    pub fn greedy(&self, state: &mut FitState, control: &GreedyControl) -> Result<GreedyReport> {
        self.check_state(state)?;
        let tol = control.tol.unwrap_or_else(|| self.default_tol());
        let mut n_added = 0;

        let stop = loop {
            if state.n_factors() >= control.max_factors {
                break GreedyStop::MaxFactorsReached;
            }
            let mut candidate = match self.propose(state, control) {
                Ok(Some(candidate)) => candidate,
                Ok(None) => break GreedyStop::DegenerateResidual,
                Err(EbmfError::NumericDegeneracy(message)) => {
                    log::warn!("Greedy stage stopped on a degenerate proposal: {message}");
                    break GreedyStop::Degenerate;
                }
                Err(err) => return Err(err),
            };
            let k = candidate.n_factors() - 1;

            let mut capped = true;
            let mut degenerate = false;
            for _ in 0..control.max_iter {
                let previous = candidate.clone();
                match self.update_component(&mut candidate, k) {
                    Ok(()) => {}
                    Err(EbmfError::NumericDegeneracy(message)) => {
                        log::warn!("Greedy stage stopped at component {k}: {message}");
                        degenerate = true;
                        break;
                    }
                    Err(err) => return Err(err),
                }
                if self.compare(&candidate, &previous, Some(k)) < tol {
                    capped = false;
                    break;
                }
            }
            if degenerate {
                break GreedyStop::Degenerate;
            }

            let gain = candidate.elbo() - state.elbo();
            if !(gain > 0.0) || candidate.component(k).is_zero() {
                log::info!("Component {k} rejected (ELBO gain {gain:e})");
                break GreedyStop::GainNonPositive;
            }
            log::info!(
                "Added component {k}, ELBO {} (gain {gain:e})",
                candidate.elbo()
            );
            *state = candidate;
            n_added += 1;
            if capped {
                log::warn!(
                    "Component {k} did not converge within {} iterations",
                    control.max_iter
                );
                break GreedyStop::AlternationCapReached;
            }
        };

        log::info!(
            "Greedy stage added {n_added} components ({stop:?}); the fit has {}",
            state.n_factors()
        );
        Ok(GreedyReport {
            n_added,
            stop,
            elbo: state.elbo(),
        })
    }
}
