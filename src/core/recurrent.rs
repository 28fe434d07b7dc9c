//! Single-layer recurrent PCN: every sensory node is predicted from the
//! other nodes through a lateral weight.
//!
//! ```text
//! pred = f(X) Wrᵀ + μ        ε = X - pred
//! grad Wr = -εᵀ f(X)  (zero diagonal)      grad μ = -Σ_b ε
//! ```
//!
//! There are no latent layers, so learning needs no relaxation: gradients
//! come straight from the clamped input. Relaxation is only used for recall.

use ndarray::{Array1, Array2, Axis, Ix1, Ix2};

use super::activation::Nonlinearity;
use super::layers::{zero_diagonal, Param, ParamSlot, Parameterized};
use super::{PcnError, PcnResult};

/// Recurrent PCN over `dim` sensory nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct RecPcn {
    pub dim: usize,
    /// Relax with the local error only. When false the feedback term
    /// `ε Wr` is added to the inference step.
    pub dendrite: bool,
    pub nonlin: Nonlinearity,
    /// Shape (dim, dim), zero diagonal
    pub wr: Param<Ix2>,
    /// Shape (dim)
    pub mu: Param<Ix1>,
}

impl RecPcn {
    /// Zero-initialized model.
    ///
    /// # Errors
    /// `InvalidConfig` if `dim` is 0.
    pub fn new(dim: usize, dendrite: bool, nonlin: Nonlinearity) -> PcnResult<Self> {
        if dim == 0 {
            return Err(PcnError::InvalidConfig(
                "recurrent PCN needs at least one node".to_string(),
            ));
        }
        Ok(Self {
            dim,
            dendrite,
            nonlin,
            wr: Param::new(Array2::zeros((dim, dim))),
            mu: Param::new(Array1::zeros(dim)),
        })
    }

    /// Replace `Wr`, clearing its diagonal.
    ///
    /// # Errors
    /// `ShapeMismatch` unless `wr` is `(dim, dim)`.
    pub fn set_recurrent(&mut self, mut wr: Array2<f32>) -> PcnResult<()> {
        if wr.dim() != (self.dim, self.dim) {
            return Err(PcnError::ShapeMismatch(format!(
                "recurrent weight must be ({0}, {0}), got {1:?}",
                self.dim,
                wr.dim()
            )));
        }
        zero_diagonal(&mut wr);
        self.wr.value = wr;
        Ok(())
    }

    fn check_batch(&self, x: &Array2<f32>) -> PcnResult<()> {
        if x.ncols() != self.dim || x.nrows() == 0 {
            return Err(PcnError::ShapeMismatch(format!(
                "expected a non-empty batch of width {}, got {:?}",
                self.dim,
                x.dim()
            )));
        }
        if self.wr.value.dim() != (self.dim, self.dim) || self.mu.value.len() != self.dim {
            return Err(PcnError::ShapeMismatch(format!(
                "parameters {:?} / {} do not match dim {}",
                self.wr.value.dim(),
                self.mu.value.len(),
                self.dim
            )));
        }
        Ok(())
    }

    /// Prediction of every node from the others: `f(X) Wrᵀ + μ`.
    ///
    /// # Errors
    /// `ShapeMismatch` for a batch of the wrong width.
    pub fn forward(&self, x: &Array2<f32>) -> PcnResult<Array2<f32>> {
        self.check_batch(x)?;
        let mut pred = self.nonlin.apply(x).dot(&self.wr.value.t());
        pred += &self.mu.value;
        Ok(pred)
    }

    /// Write `Wr` and `μ` gradients for a clamped batch and return its MSE.
    ///
    /// # Errors
    /// `ShapeMismatch` for a batch of the wrong width.
    #[allow(clippy::cast_precision_loss)]
    pub fn learning(&mut self, x: &Array2<f32>) -> PcnResult<f32> {
        let errs = x - &self.forward(x)?;
        let mut grad_wr = -errs.t().dot(&self.nonlin.apply(x));
        zero_diagonal(&mut grad_wr);
        self.wr.set_grad(grad_wr)?;
        self.mu.set_grad(-errs.sum_axis(Axis(0)))?;
        Ok(errs.iter().map(|e| e * e).sum::<f32>() / errs.len() as f32)
    }

    /// Relaxation direction for a (possibly corrupted) batch:
    /// `-ε`, or `-ε + ε Wr` without dendritic integration.
    ///
    /// # Errors
    /// `ShapeMismatch` for a batch of the wrong width.
    pub fn inference(&self, x_c: &Array2<f32>) -> PcnResult<Array2<f32>> {
        let errs = x_c - &self.forward(x_c)?;
        let mut delta = -&errs;
        if !self.dendrite {
            delta += &errs.dot(&self.wr.value);
        }
        Ok(delta)
    }

    /// Relax the entries selected by `update_mask` (1 = unknown) for
    /// `n_iters` Euler steps of size `dt` and return the result.
    ///
    /// # Errors
    /// `ShapeMismatch` if the mask and batch differ in shape;
    /// `InvalidConfig` unless `dt` is positive and finite.
    pub fn recall(
        &self,
        corrupt: &Array2<f32>,
        update_mask: &Array2<f32>,
        n_iters: usize,
        dt: f32,
    ) -> PcnResult<Array2<f32>> {
        self.check_batch(corrupt)?;
        if update_mask.dim() != corrupt.dim() {
            return Err(PcnError::ShapeMismatch(format!(
                "update mask {:?} does not match batch {:?}",
                update_mask.dim(),
                corrupt.dim()
            )));
        }
        if !(dt.is_finite() && dt > 0.0) {
            return Err(PcnError::InvalidConfig(format!(
                "dt must be positive and finite, got {dt}"
            )));
        }

        let mut x = corrupt.to_owned();
        for _ in 0..n_iters {
            let delta = self.inference(&x)? * update_mask;
            x.scaled_add(dt, &delta);
        }
        Ok(x)
    }
}

impl Parameterized for RecPcn {
    fn params_mut(&mut self) -> Vec<ParamSlot<'_>> {
        vec![self.wr.slot("recurrent"), self.mu.slot("mu")]
    }

    fn zero_grad(&mut self) {
        self.wr.zero_grad();
        self.mu.zero_grad();
    }

    fn constrain_params(&mut self) {
        zero_diagonal(&mut self.wr.value);
        if let Some(grad) = self.wr.grad.as_mut() {
            zero_diagonal(grad);
        }
    }
}
