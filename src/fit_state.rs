use nalgebra::{DMatrix, DVector};
use serde_derive::{Deserialize, Serialize};

use crate::data::DataMatrix;
use crate::error::{EbmfError, Result};
use crate::prior::Prior;
use crate::variance::{self, NoiseParams, VarianceType};

/// Either side of a rank-one component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    /// The column of `L` (length `n`).
    Loadings,
    /// The column of `F` (length `p`).
    Factors,
}

impl Side {
    /// The side this one is paired with.
    pub fn other(self) -> Side {
        match self {
            Side::Loadings => Side::Factors,
            Side::Factors => Side::Loadings,
        }
    }
}

/// Variational posterior of one column of `L` or `F`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnFit {
    pub(crate) mean: DVector<f64>,
    pub(crate) second_moment: DVector<f64>,
    /// `None` for a seeded column which has not been through an EBNM update yet.
    pub(crate) prior: Option<Prior>,
    /// `-KL(q || g)`: the contribution of this column to the ELBO.
    pub(crate) neg_kl: f64,
    /// Fixed columns are never updated but take part in every residual.
    pub(crate) fixed: bool,
}

impl ColumnFit {
    /// A column known exactly (a point mass at `values`).
    pub(crate) fn seeded(values: DVector<f64>) -> ColumnFit {
        ColumnFit {
            second_moment: values.map(|v| v * v),
            mean: values,
            prior: None,
            neg_kl: 0.0,
            fixed: false,
        }
    }

    pub(crate) fn zeroed(len: usize) -> ColumnFit {
        ColumnFit {
            mean: DVector::zeros(len),
            second_moment: DVector::zeros(len),
            prior: Some(Prior::null()),
            neg_kl: 0.0,
            fixed: false,
        }
    }

    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    pub fn second_moment(&self) -> &DVector<f64> {
        &self.second_moment
    }

    pub fn prior(&self) -> Option<&Prior> {
        self.prior.as_ref()
    }

    pub fn neg_kl(&self) -> f64 {
        self.neg_kl
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }
}

/// The `k`-th loading/factor pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    pub(crate) loadings: ColumnFit,
    pub(crate) factors: ColumnFit,
}

impl Component {
    pub fn side(&self, side: Side) -> &ColumnFit {
        match side {
            Side::Loadings => &self.loadings,
            Side::Factors => &self.factors,
        }
    }

    pub(crate) fn side_mut(&mut self, side: Side) -> &mut ColumnFit {
        match side {
            Side::Loadings => &mut self.loadings,
            Side::Factors => &mut self.factors,
        }
    }

    /// Whether either side of this component is fixed.
    pub fn is_fixed(&self) -> bool {
        self.loadings.fixed || self.factors.fixed
    }

    /// Whether the component contributes nothing to the fit.
    pub fn is_zero(&self) -> bool {
        self.loadings.mean.iter().all(|&v| v == 0.0) || self.factors.mean.iter().all(|&v| v == 0.0)
    }

    /// The contribution of this component to the ELBO besides the likelihood term.
    pub fn neg_kl(&self) -> f64 {
        self.loadings.neg_kl + self.factors.neg_kl
    }
}

/// The state of an EBMF fit: `Y ~ L * F^T + E`.
///
/// The state stores first and second posterior moments of every column of `L` and `F`, their
/// priors, the noise precision and the ELBO. The ELBO stored here is always the one of the
/// current moments, priors and noise: every mutation made through [`crate::Ebmf`] refreshes it.
///
/// ## Note
///
/// Columns without a prior (seeded ones not yet updated) and fixed columns count as known
/// values and contribute nothing to the KL part of the ELBO.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitState {
    pub(crate) nrows: usize,
    pub(crate) ncols: usize,
    pub(crate) components: Vec<Component>,
    pub(crate) noise: NoiseParams,
    pub(crate) loglik: f64,
    pub(crate) elbo: f64,
    pub(crate) n_iter: usize,
}

impl FitState {
    /// A fit with no components. The noise and the ELBO still have to be refreshed.
    pub(crate) fn empty(nrows: usize, ncols: usize) -> FitState {
        FitState {
            nrows,
            ncols,
            components: vec![],
            noise: NoiseParams::Constant(1.0),
            loglik: f64::NEG_INFINITY,
            elbo: f64::NEG_INFINITY,
            n_iter: 0,
        }
    }

    /// The number of components `K`.
    pub fn n_factors(&self) -> usize {
        self.components.len()
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// # Panics
    ///
    /// This function panics if `k` is out of bounds.
    pub fn component(&self, k: usize) -> &Component {
        &self.components[k]
    }

    /// The evidence lower bound of the current fit.
    pub fn elbo(&self) -> f64 {
        self.elbo
    }

    /// The expected log-likelihood part of the ELBO.
    pub fn loglik(&self) -> f64 {
        self.loglik
    }

    /// The ELBO contribution of component `k` besides the likelihood term.
    pub fn component_kl(&self, k: usize) -> f64 {
        self.components[k].neg_kl()
    }

    pub fn noise(&self) -> &NoiseParams {
        &self.noise
    }

    /// The number of update steps taken on this fit so far.
    pub fn n_iter(&self) -> usize {
        self.n_iter
    }

    fn side_matrix(&self, side: Side, f: impl Fn(&ColumnFit) -> &DVector<f64>) -> DMatrix<f64> {
        let len = match side {
            Side::Loadings => self.nrows,
            Side::Factors => self.ncols,
        };
        DMatrix::from_fn(len, self.components.len(), |i, k| {
            f(self.components[k].side(side))[i]
        })
    }

    /// Posterior means of `L` (`n x K`).
    pub fn loadings(&self) -> DMatrix<f64> {
        self.side_matrix(Side::Loadings, ColumnFit::mean)
    }

    /// Posterior means of `F` (`p x K`).
    pub fn factors(&self) -> DMatrix<f64> {
        self.side_matrix(Side::Factors, ColumnFit::mean)
    }

    pub fn loadings_second_moment(&self) -> DMatrix<f64> {
        self.side_matrix(Side::Loadings, ColumnFit::second_moment)
    }

    pub fn factors_second_moment(&self) -> DMatrix<f64> {
        self.side_matrix(Side::Factors, ColumnFit::second_moment)
    }

    /// `E[L] * E[F]^T`.
    pub fn fitted(&self) -> DMatrix<f64> {
        if self.components.is_empty() {
            return DMatrix::zeros(self.nrows, self.ncols);
        }
        self.loadings() * self.factors().transpose()
    }

    /// `Y - E[L] * E[F]^T` on observed entries, zero elsewhere.
    pub fn residual(&self, data: &DataMatrix) -> DMatrix<f64> {
        data.mask().fillna(&(data.y() - self.fitted()))
    }

    /// `E[(Y - L * F^T)^2]` on observed entries, zero elsewhere.
    pub(crate) fn expected_squared_residual(&self, data: &DataMatrix) -> DMatrix<f64> {
        let residual = self.residual(data);
        let mut r2 = residual.component_mul(&residual);
        if !self.components.is_empty() {
            let loadings = self.loadings();
            let factors = self.factors();
            r2 += self.loadings_second_moment() * self.factors_second_moment().transpose()
                - loadings.map(|v| v * v) * factors.map(|v| v * v).transpose();
        }
        data.mask().fillna(&r2)
    }

    /// The residual with every component but `k` subtracted.
    pub(crate) fn residual_without(&self, k: usize, data: &DataMatrix) -> DMatrix<f64> {
        let component = &self.components[k];
        let added_back = &component.loadings.mean * component.factors.mean.transpose();
        data.mask().fillna(&(self.residual(data) + added_back))
    }

    /// Re-estimates the noise and recomputes the ELBO.
    pub(crate) fn refresh(
        &mut self,
        data: &DataMatrix,
        variance_type: VarianceType,
        min_variance: f64,
    ) -> Result<()> {
        let r2 = self.expected_squared_residual(data);
        self.noise =
            variance::estimate_noise(variance_type, &r2, data, Some(&self.noise), min_variance)?;
        self.refresh_elbo_with(&r2, data)
    }

    /// Recomputes the ELBO keeping the noise as it is.
    pub(crate) fn refresh_elbo(&mut self, data: &DataMatrix) -> Result<()> {
        let r2 = self.expected_squared_residual(data);
        self.refresh_elbo_with(&r2, data)
    }

    fn refresh_elbo_with(&mut self, r2: &DMatrix<f64>, data: &DataMatrix) -> Result<()> {
        self.loglik = variance::expected_loglik(&self.noise, r2, data);
        self.elbo = self.loglik + self.components.iter().map(Component::neg_kl).sum::<f64>();
        if !self.elbo.is_finite() {
            return Err(EbmfError::NumericDegeneracy(format!(
                "non-finite ELBO ({}) with {} components",
                self.elbo,
                self.n_factors()
            )));
        }
        Ok(())
    }

    pub(crate) fn push(&mut self, component: Component) {
        self.components.push(component);
    }

    /// Deletes component `k`; later components are renumbered down by one.
    pub(crate) fn remove(&mut self, k: usize) -> Component {
        self.components.remove(k)
    }

    /// Sets both sides of component `k` to zero under a null prior.
    pub(crate) fn zero_out(&mut self, k: usize) {
        let component = &mut self.components[k];
        component.loadings = ColumnFit::zeroed(self.nrows);
        component.factors = ColumnFit::zeroed(self.ncols);
    }

    /// Marks one side of component `k` as fixed: it keeps its current values for the rest of
    /// the fit and contributes no KL term.
    pub(crate) fn fix(&mut self, k: usize, side: Side) -> Result<()> {
        let n_factors = self.n_factors();
        let column = self
            .components
            .get_mut(k)
            .ok_or_else(|| {
                EbmfError::InvalidInput(format!("no component {k} in a fit with {n_factors}"))
            })?
            .side_mut(side);
        column.fixed = true;
        column.neg_kl = 0.0;
        column.second_moment = column.mean.map(|v| v * v);
        Ok(())
    }

    /// Proposes `self + beta * (self - previous)` on the free columns. Second moments are
    /// kept at least as large as the squared means. Priors, noise and ELBO are carried over from
    /// `self` and must be refreshed by a full update.
    pub(crate) fn extrapolate(&self, previous: &FitState, beta: f64) -> FitState {
        let mut proposal = self.clone();
        for (component, old) in proposal.components.iter_mut().zip(&previous.components) {
            for side in [Side::Loadings, Side::Factors] {
                let old = old.side(side);
                let column = component.side_mut(side);
                if column.fixed {
                    continue;
                }
                let mean = &column.mean + (&column.mean - &old.mean) * beta;
                let second_moment = (&column.second_moment
                    + (&column.second_moment - &old.second_moment) * beta)
                    .zip_map(&mean, |m2, m| m2.max(m * m));
                column.mean = mean;
                column.second_moment = second_moment;
            }
        }
        proposal
    }
}
