//! Hierarchical PCN: the top layer is predicted by a free memory vector.

use rand::Rng;

use super::layers::{ParamSlot, Parameterized};
use super::relax::{MultilayerPcn, Relaxation};
use super::state::State;
use super::PcnResult;
use crate::config::ModelConfig;

/// Multilayer PCN whose layer-0 prediction is the memory itself.
#[derive(Debug, Clone, PartialEq)]
pub struct HierarchicalPcn {
    pub net: MultilayerPcn,
}

impl HierarchicalPcn {
    /// # Errors
    /// `InvalidConfig` if the config fails validation.
    pub fn new(config: &ModelConfig) -> PcnResult<Self> {
        Self::new_with_rng(config, &mut rand::thread_rng())
    }

    /// # Errors
    /// `InvalidConfig` if the config fails validation.
    pub fn new_with_rng<R: Rng + ?Sized>(config: &ModelConfig, rng: &mut R) -> PcnResult<Self> {
        Ok(Self {
            net: MultilayerPcn::new_with_rng(config, rng)?,
        })
    }
}

impl Relaxation for HierarchicalPcn {
    fn net(&self) -> &MultilayerPcn {
        &self.net
    }

    fn update_err_nodes(&self, state: &mut State) -> PcnResult<()> {
        state.ensure_nodes_set("update_err_nodes")?;
        self.net.check_nodes(state)?;
        let top = self.net.memory_batch(state.batch_size)?;
        MultilayerPcn::write_error(state, 0, top)?;
        for l in 1..self.net.n_layers() {
            let pred = self.net.predict_from_above(state, l)?;
            MultilayerPcn::write_error(state, l, pred)?;
        }
        Ok(())
    }

    fn update_grads(&mut self, state: &State) -> PcnResult<()> {
        state.ensure_nodes_set("update_grads")?;
        self.net.check_state(state)?;
        self.net.write_grads(state)
    }
}

impl Parameterized for HierarchicalPcn {
    fn params_mut(&mut self) -> Vec<ParamSlot<'_>> {
        self.net.param_slots()
    }

    fn zero_grad(&mut self) {
        self.net.zero_grad();
    }
}
