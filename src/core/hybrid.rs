//! Hybrid PCN: hierarchical prediction plus a learned lateral term among
//! the top-layer nodes.

use ndarray::{Array2, Ix2};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::Rng;

use super::layers::{zero_diagonal, Param, ParamSlot, Parameterized};
use super::relax::{MultilayerPcn, Relaxation};
use super::state::State;
use super::{PcnError, PcnResult};
use crate::config::ModelConfig;

/// Multilayer PCN with a recurrent weight `Wr` on layer 0:
/// ```text
/// pred_0 = m + x_0 Wrᵀ
/// ```
///
/// `Wr` has a zero diagonal (no node predicts itself). The diagonal of
/// both `Wr` and its gradient is cleared every time either is written.
#[derive(Debug, Clone, PartialEq)]
pub struct HybridPcn {
    pub net: MultilayerPcn,
    /// Shape (nodes[0], nodes[0])
    pub wr: Param<Ix2>,
}

impl HybridPcn {
    /// # Errors
    /// `InvalidConfig` if the config fails validation.
    pub fn new(config: &ModelConfig) -> PcnResult<Self> {
        Self::new_with_rng(config, &mut rand::thread_rng())
    }

    /// Build with `Wr` drawn from `init_std_wr * N(0, 1)`, diagonal zeroed.
    ///
    /// # Errors
    /// `InvalidConfig` if the config fails validation.
    pub fn new_with_rng<R: Rng + ?Sized>(config: &ModelConfig, rng: &mut R) -> PcnResult<Self> {
        let net = MultilayerPcn::new_with_rng(config, rng)?;
        let dim = config.nodes[0];
        let mut wr = Array2::<f32>::random_using((dim, dim), StandardNormal, rng) * config.init_std_wr;
        zero_diagonal(&mut wr);
        Ok(Self {
            net,
            wr: Param::new(wr),
        })
    }

    /// Replace `Wr`, clearing its diagonal.
    ///
    /// # Errors
    /// `ShapeMismatch` unless `wr` is `(nodes[0], nodes[0])`.
    pub fn set_recurrent(&mut self, mut wr: Array2<f32>) -> PcnResult<()> {
        let dim = self.net.nodes[0];
        if wr.dim() != (dim, dim) {
            return Err(PcnError::ShapeMismatch(format!(
                "recurrent weight must be ({dim}, {dim}), got {:?}",
                wr.dim()
            )));
        }
        zero_diagonal(&mut wr);
        self.wr.value = wr;
        Ok(())
    }

    fn check_recurrent(&self) -> PcnResult<()> {
        let dim = self.net.nodes[0];
        if self.wr.value.dim() != (dim, dim) {
            return Err(PcnError::ShapeMismatch(format!(
                "recurrent weight is {:?}, expected ({dim}, {dim})",
                self.wr.value.dim()
            )));
        }
        Ok(())
    }
}

impl Relaxation for HybridPcn {
    fn net(&self) -> &MultilayerPcn {
        &self.net
    }

    fn update_err_nodes(&self, state: &mut State) -> PcnResult<()> {
        state.ensure_nodes_set("update_err_nodes")?;
        self.net.check_nodes(state)?;
        self.check_recurrent()?;
        let mut top = self.net.memory_batch(state.batch_size)?;
        top += &state.val_nodes[0].dot(&self.wr.value.t());
        MultilayerPcn::write_error(state, 0, top)?;
        for l in 1..self.net.n_layers() {
            let pred = self.net.predict_from_above(state, l)?;
            MultilayerPcn::write_error(state, l, pred)?;
        }
        Ok(())
    }

    /// Hierarchical gradients plus `grad Wr = -ε_0ᵀ x_0` with a zero diagonal.
    fn update_grads(&mut self, state: &State) -> PcnResult<()> {
        state.ensure_nodes_set("update_grads")?;
        self.net.check_state(state)?;
        self.net.write_grads(state)?;
        let mut grad_wr = -state.errs[0].t().dot(&state.val_nodes[0]);
        zero_diagonal(&mut grad_wr);
        self.wr.set_grad(grad_wr)
    }
}

impl Parameterized for HybridPcn {
    fn params_mut(&mut self) -> Vec<ParamSlot<'_>> {
        let mut slots = self.net.param_slots();
        slots.push(self.wr.slot("recurrent"));
        slots
    }

    fn zero_grad(&mut self) {
        self.net.zero_grad();
        self.wr.zero_grad();
    }

    fn constrain_params(&mut self) {
        zero_diagonal(&mut self.wr.value);
        if let Some(grad) = self.wr.grad.as_mut() {
            zero_diagonal(grad);
        }
    }
}
