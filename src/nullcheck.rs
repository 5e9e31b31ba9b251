use serde_derive::{Deserialize, Serialize};

use crate::engine::Ebmf;
use crate::error::{EbmfError, Result};
use crate::fit_state::FitState;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NullcheckControl {
    /// A component goes if removing it costs at most this much ELBO.
    pub tol: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NullcheckReport {
    /// Indices, in the fit as it was handed over, of the removed components. Sorted.
    pub removed: Vec<usize>,
    pub elbo: f64,
}

impl Ebmf {
    /// Removes the components whose removal does not lower the ELBO (by more than
    /// `control.tol`). Components with a fixed side are never removed.
    pub fn nullcheck(
        &self,
        state: &mut FitState,
        control: &NullcheckControl,
    ) -> Result<NullcheckReport> {
        self.check_state(state)?;
        let mut removed = vec![];

        // Going backwards keeps the indices of the components still to check.
        for k in (0..state.n_factors()).rev() {
            if state.component(k).is_fixed() {
                continue;
            }
            let mut null = state.clone();
            null.zero_out(k);
            match self.refresh(&mut null) {
                Ok(()) => {}
                Err(EbmfError::NumericDegeneracy(message)) => {
                    log::warn!("Keeping component {k}, its removal is degenerate: {message}");
                    continue;
                }
                Err(err) => return Err(err),
            }

            log::debug!(
                "Component {k}: ELBO {} with it, {} without",
                state.elbo(),
                null.elbo()
            );
            if null.elbo() >= state.elbo() - control.tol {
                null.remove(k);
                *state = null;
                removed.push(k);
                log::info!("Nullcheck removed component {k}");
            }
        }

        removed.reverse();
        Ok(NullcheckReport {
            removed,
            elbo: state.elbo(),
        })
    }
}
