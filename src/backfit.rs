use serde_derive::{Deserialize, Serialize};

use crate::engine::Ebmf;
use crate::error::{EbmfError, Result};
use crate::fit_state::FitState;

/// Tunables of the extrapolated backfit. At every sweep the fit is first pushed along its last
/// step, `x + beta * (x - x_prev)`, and the push is kept only if the sweep from there beats the
/// plain sweep's starting point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExtrapolationControl {
    pub beta_init: f64,
    /// `beta` is multiplied by this after every accepted extrapolation...
    pub beta_increase: f64,
    /// ...and by this after every rejected one.
    pub beta_reduce: f64,
    pub beta_max: f64,
}

impl Default for ExtrapolationControl {
    fn default() -> ExtrapolationControl {
        ExtrapolationControl {
            beta_init: 0.5,
            beta_increase: 1.2,
            beta_reduce: 0.75,
            beta_max: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum BackfitMode {
    /// Components are updated one after the other, each judged on its own.
    Sequential,
    /// Full sweeps with momentum, judged as a whole.
    Extrapolated(ExtrapolationControl),
}

impl Default for BackfitMode {
    fn default() -> BackfitMode {
        BackfitMode::Extrapolated(ExtrapolationControl::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfitControl {
    /// Cap on the number of sweeps.
    pub max_iter: usize,
    /// `None` uses [`Ebmf::default_tol`].
    pub tol: Option<f64>,
    pub mode: BackfitMode,
}

impl Default for BackfitControl {
    fn default() -> BackfitControl {
        BackfitControl {
            max_iter: 500,
            tol: None,
            mode: BackfitMode::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitStatus {
    Converged,
    IterationCapReached,
    /// A non-finite ELBO or variance came up; the fit is the last valid one.
    Degenerate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfitReport {
    /// Number of sweeps carried out.
    pub n_iter: usize,
    pub status: FitStatus,
    /// ELBO after every accepted sweep.
    pub elbo_trace: Vec<f64>,
    pub n_extrapolated: usize,
    pub n_rejected: usize,
}

impl Ebmf {
    fn sweep(&self, state: &mut FitState) -> Result<()> {
        for k in 0..state.n_factors() {
            self.update_component(state, k)?;
        }
        Ok(())
    }

    /// Refits every component in turn, holding the others fixed, until the convergence
    /// criterion passes on a full sweep or `control.max_iter` sweeps have been made.
    ///
    /// The ELBO never decreases from one sweep to the next.
    pub fn backfit(&self, state: &mut FitState, control: &BackfitControl) -> Result<BackfitReport> {
        self.check_state(state)?;
        let tol = control.tol.unwrap_or_else(|| self.default_tol());
        log::info!(
            "Backfitting {} components ({:?})",
            state.n_factors(),
            control.mode
        );
        if state.n_factors() == 0 {
            return Ok(BackfitReport {
                n_iter: 0,
                status: FitStatus::Converged,
                elbo_trace: vec![],
                n_extrapolated: 0,
                n_rejected: 0,
            });
        }

        let report = match control.mode {
            BackfitMode::Sequential => self.backfit_sequential(state, control.max_iter, tol),
            BackfitMode::Extrapolated(extrapolation) => {
                self.backfit_extrapolated(state, control.max_iter, tol, &extrapolation)
            }
        }?;

        match report.status {
            FitStatus::Converged => log::info!(
                "Backfit converged after {} sweeps, ELBO {}",
                report.n_iter,
                state.elbo()
            ),
            FitStatus::IterationCapReached => log::warn!(
                "Backfit stopped after {} sweeps without converging, ELBO {}",
                report.n_iter,
                state.elbo()
            ),
            FitStatus::Degenerate => {}
        }
        Ok(report)
    }

    fn backfit_sequential(
        &self,
        state: &mut FitState,
        max_iter: usize,
        tol: f64,
    ) -> Result<BackfitReport> {
        let mut elbo_trace = vec![];
        let mut status = FitStatus::IterationCapReached;

        'sweeps: for iter in 0..max_iter {
            let mut converged = true;
            for k in 0..state.n_factors() {
                let previous = state.clone();
                match self.update_component(state, k) {
                    Ok(()) => {}
                    Err(EbmfError::NumericDegeneracy(message)) => {
                        log::warn!("Backfit stopped at sweep {iter}, component {k}: {message}");
                        status = FitStatus::Degenerate;
                        break 'sweeps;
                    }
                    Err(err) => return Err(err),
                }
                if self.compare(state, &previous, Some(k)) >= tol {
                    converged = false;
                }
            }
            elbo_trace.push(state.elbo());
            log::debug!("Sweep {iter}: ELBO {}", state.elbo());
            if converged {
                status = FitStatus::Converged;
                break;
            }
        }

        Ok(BackfitReport {
            n_iter: elbo_trace.len(),
            status,
            elbo_trace,
            n_extrapolated: 0,
            n_rejected: 0,
        })
    }

    fn backfit_extrapolated(
        &self,
        state: &mut FitState,
        max_iter: usize,
        tol: f64,
        control: &ExtrapolationControl,
    ) -> Result<BackfitReport> {
        let mut elbo_trace = vec![];
        let mut status = FitStatus::IterationCapReached;
        let mut beta = control.beta_init;
        let mut last: Option<FitState> = None;
        let (mut n_extrapolated, mut n_rejected) = (0, 0);

        for iter in 0..max_iter {
            let current = state.clone();

            let mut extrapolated = None;
            if let Some(last) = last.as_ref().filter(|_| beta > 0.0) {
                let mut proposal = current.extrapolate(last, beta);
                match self.sweep(&mut proposal) {
                    Ok(()) if proposal.elbo() > current.elbo() => {
                        n_extrapolated += 1;
                        beta = (beta * control.beta_increase).min(control.beta_max);
                        extrapolated = Some(proposal);
                    }
                    Ok(()) | Err(EbmfError::NumericDegeneracy(_)) => {
                        n_rejected += 1;
                        beta *= control.beta_reduce;
                        log::debug!("Sweep {iter}: extrapolation rejected, beta down to {beta}");
                    }
                    Err(err) => return Err(err),
                }
            }

            let next = match extrapolated {
                Some(next) => next,
                None => {
                    let mut next = current.clone();
                    match self.sweep(&mut next) {
                        Ok(()) => next,
                        Err(EbmfError::NumericDegeneracy(message)) => {
                            log::warn!("Backfit stopped at sweep {iter}: {message}");
                            status = FitStatus::Degenerate;
                            break;
                        }
                        Err(err) => return Err(err),
                    }
                }
            };

            *state = next;
            elbo_trace.push(state.elbo());
            log::debug!("Sweep {iter}: ELBO {}", state.elbo());
            let converged = self.compare(state, &current, None) < tol;
            last = Some(current);
            if converged {
                status = FitStatus::Converged;
                break;
            }
        }

        Ok(BackfitReport {
            n_iter: elbo_trace.len(),
            status,
            elbo_trace,
            n_extrapolated,
            n_rejected,
        })
    }
}
