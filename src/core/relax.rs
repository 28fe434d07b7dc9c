//! The relaxation engine shared by all multilayer variants.
//!
//! Variants implement two policies on [`Relaxation`]:
//! - [`update_err_nodes`](Relaxation::update_err_nodes): predictions and errors
//! - [`update_grads`](Relaxation::update_grads): parameter gradients
//!
//! Everything else (node setup, the Euler step, the train and reconstruction
//! drivers) is provided by the trait and reads the variant's parameters
//! through [`MultilayerPcn`].

use ndarray::{Array1, Array2, Axis, Ix1};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::Rng;
use tracing::debug;

use super::activation::Nonlinearity;
use super::layers::{LayerStack, Param, ParamSlot, Parameterized};
use super::state::{Phase, State};
use super::{PcnError, PcnResult};
use crate::config::ModelConfig;
use crate::utils;

/// What [`Relaxation::test_pc_generative`] returns after relaxing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Readout {
    /// Relaxed sensory value nodes (the reconstruction)
    #[default]
    SensoryValues,
    /// The model's final prediction of the sensory layer
    SensoryPrediction,
    /// Relaxed top-layer value nodes (the latent representation)
    Latent,
}

/// Parameters and hyperparameters common to every multilayer variant.
#[derive(Debug, Clone, PartialEq)]
pub struct MultilayerPcn {
    /// Layer sizes, top (memory) layer first, sensory layer last
    pub nodes: Vec<usize>,
    /// layers[l] maps nodes[l] to nodes[l+1]
    pub layers: LayerStack,
    /// Top-level prior, shape (nodes[0])
    pub memory: Param<Ix1>,
    pub nonlin: Nonlinearity,
    /// Relaxation step size
    pub dt: f32,
    /// L1 penalty on the top layer's value nodes
    pub lamb: f32,
    /// Initialization scales the parameters were drawn with
    pub init_std: f32,
    pub init_std_wr: f32,
}

impl MultilayerPcn {
    /// Build from a validated config, with memory drawn from `init_std * N(0, 1)`.
    ///
    /// # Errors
    /// `InvalidConfig` if the config fails validation.
    pub fn new_with_rng<R: Rng + ?Sized>(config: &ModelConfig, rng: &mut R) -> PcnResult<Self> {
        config.validate()?;
        let layers = LayerStack::new_with_rng(&config.nodes, config.use_bias, rng);
        let memory = Array1::<f32>::random_using(config.nodes[0], StandardNormal, rng)
            * config.init_std;
        Ok(Self {
            nodes: config.nodes.clone(),
            layers,
            memory: Param::new(memory),
            nonlin: config.nonlin,
            dt: config.dt,
            lamb: config.lamb,
            init_std: config.init_std,
            init_std_wr: config.init_std_wr,
        })
    }

    /// The construction config this network corresponds to.
    pub fn config(&self) -> ModelConfig {
        ModelConfig {
            nodes: self.nodes.clone(),
            nonlin: self.nonlin,
            dt: self.dt,
            lamb: self.lamb,
            use_bias: self.layers.uses_bias(),
            init_std: self.init_std,
            init_std_wr: self.init_std_wr,
        }
    }

    pub fn n_layers(&self) -> usize {
        self.nodes.len()
    }

    pub fn sensory_dim(&self) -> usize {
        self.nodes[self.nodes.len() - 1]
    }

    /// Check that every value node is `(batch_size, nodes[l])`.
    ///
    /// # Errors
    /// `ShapeMismatch` naming the first offending layer.
    pub fn check_nodes(&self, state: &State) -> PcnResult<()> {
        if state.n_layers() != self.n_layers() {
            return Err(PcnError::ShapeMismatch(format!(
                "state has {} layers, network has {}",
                state.n_layers(),
                self.n_layers()
            )));
        }
        for (l, (val, &n)) in state.val_nodes.iter().zip(&self.nodes).enumerate() {
            if val.dim() != (state.batch_size, n) {
                return Err(PcnError::ShapeMismatch(format!(
                    "val_nodes[{l}] is {:?}, expected ({}, {n})",
                    val.dim(),
                    state.batch_size
                )));
            }
        }
        Ok(())
    }

    /// [`check_nodes`](Self::check_nodes), plus the same check on every error buffer.
    ///
    /// # Errors
    /// `ShapeMismatch` naming the first offending layer.
    pub fn check_state(&self, state: &State) -> PcnResult<()> {
        self.check_nodes(state)?;
        if state.errs.len() != self.n_layers() {
            return Err(PcnError::ShapeMismatch(format!(
                "state has {} error buffers, network has {} layers",
                state.errs.len(),
                self.n_layers()
            )));
        }
        for (l, (err, val)) in state.errs.iter().zip(&state.val_nodes).enumerate() {
            if err.dim() != val.dim() {
                return Err(PcnError::ShapeMismatch(format!(
                    "errs[{l}] is {:?}, val_nodes[{l}] is {:?}",
                    err.dim(),
                    val.dim()
                )));
            }
        }
        Ok(())
    }

    /// Memory broadcast to `(batch_size, nodes[0])`.
    pub fn memory_batch(&self, batch_size: usize) -> PcnResult<Array2<f32>> {
        self.memory
            .value
            .broadcast((batch_size, self.nodes[0]))
            .map(|view| view.to_owned())
            .ok_or_else(|| {
                PcnError::ShapeMismatch(format!(
                    "memory of length {} cannot broadcast to ({}, {})",
                    self.memory.value.len(),
                    batch_size,
                    self.nodes[0]
                ))
            })
    }

    /// Top-down prediction of layer `l >= 1`: `layer_{l-1}(f(val_nodes[l-1]))`.
    pub fn predict_from_above(&self, state: &State, l: usize) -> PcnResult<Array2<f32>> {
        let layer = &self.layers[l - 1];
        layer.forward(&self.nonlin.apply(&state.val_nodes[l - 1]))
    }

    /// Store `pred` as layer `l`'s prediction and recompute its error.
    ///
    /// # Errors
    /// `ShapeMismatch` if `pred` and `val_nodes[l]` differ in shape.
    pub fn write_error(state: &mut State, l: usize, pred: Array2<f32>) -> PcnResult<()> {
        if pred.dim() != state.val_nodes[l].dim() {
            return Err(PcnError::ShapeMismatch(format!(
                "prediction for layer {l} is {:?}, value nodes are {:?}",
                pred.dim(),
                state.val_nodes[l].dim()
            )));
        }
        state.errs[l] = &state.val_nodes[l] - &pred;
        state.preds[l] = pred;
        Ok(())
    }

    /// Memory, weight and bias gradients from the final error snapshot:
    /// ```text
    /// grad m   = -Σ_b ε_0
    /// grad W_l = -ε_{l+1}ᵀ f(x_l)
    /// grad b_l = -Σ_b ε_{l+1}
    /// ```
    pub fn write_grads(&mut self, state: &State) -> PcnResult<()> {
        self.memory
            .set_grad(-state.errs[0].sum_axis(Axis(0)))?;
        for l in 0..self.layers.len() {
            let presynaptic = self.nonlin.apply(&state.val_nodes[l]);
            let grad_w = -state.errs[l + 1].t().dot(&presynaptic);
            let layer = &mut self.layers[l];
            layer.weight.set_grad(grad_w)?;
            if let Some(bias) = layer.bias.as_mut() {
                bias.set_grad(-state.errs[l + 1].sum_axis(Axis(0)))?;
            }
        }
        Ok(())
    }

    pub fn param_slots(&mut self) -> Vec<ParamSlot<'_>> {
        let mut slots = vec![self.memory.slot("memory")];
        for (l, layer) in self.layers.iter_mut().enumerate() {
            slots.push(layer.weight.slot(format!("layer_{l}.weight")));
            if let Some(bias) = layer.bias.as_mut() {
                slots.push(bias.slot(format!("layer_{l}.bias")));
            }
        }
        slots
    }

    pub fn zero_grad(&mut self) {
        self.memory.zero_grad();
        for layer in self.layers.iter_mut() {
            layer.weight.zero_grad();
            if let Some(bias) = layer.bias.as_mut() {
                bias.zero_grad();
            }
        }
    }
}

/// Relaxation dynamics over a multilayer PCN.
///
/// # Episode
/// ```text
/// initialize → set_nodes → update_val_nodes × n_iters → update_grads      (train)
/// initialize → set_nodes → update_val_nodes(recon) × n_iters → readout   (test)
/// ```
pub trait Relaxation: Parameterized {
    fn net(&self) -> &MultilayerPcn;

    /// Recompute every layer's prediction and error from the current value nodes.
    fn update_err_nodes(&self, state: &mut State) -> PcnResult<()>;

    /// Write (overwrite, never accumulate) every parameter gradient.
    fn update_grads(&mut self, state: &State) -> PcnResult<()>;

    /// Fresh, empty buffers for a new episode.
    fn initialize(&self) -> State {
        State::empty(self.net().n_layers())
    }

    /// Populate value nodes for `batch_inp` and compute the initial errors.
    ///
    /// `val_nodes[0]` is the memory broadcast over the batch, each hidden
    /// layer is the forward pass of the layer above it, and the sensory
    /// layer is a copy of the input.
    ///
    /// # Errors
    /// `ShapeMismatch` if the input does not have `nodes[L-1]` columns, is an
    /// empty batch, or `state` was built for a different depth.
    fn set_nodes(&self, state: &mut State, batch_inp: &Array2<f32>) -> PcnResult<()> {
        let net = self.net();
        let n_layers = net.n_layers();
        if state.n_layers() != n_layers {
            return Err(PcnError::ShapeMismatch(format!(
                "state has {} layers, network has {}",
                state.n_layers(),
                n_layers
            )));
        }
        if batch_inp.ncols() != net.sensory_dim() {
            return Err(PcnError::ShapeMismatch(format!(
                "input has {} features, sensory layer has {}",
                batch_inp.ncols(),
                net.sensory_dim()
            )));
        }
        let batch_size = batch_inp.nrows();
        if batch_size == 0 {
            return Err(PcnError::ShapeMismatch("empty input batch".to_string()));
        }

        state.batch_size = batch_size;
        state.val_nodes[0] = net.memory_batch(batch_size)?;
        for l in 1..n_layers - 1 {
            state.val_nodes[l] = net.predict_from_above(state, l)?;
        }
        state.val_nodes[n_layers - 1] = batch_inp.to_owned();
        state.steps_taken = 0;
        state.phase = Phase::NodesSet;

        self.update_err_nodes(state)
    }

    /// Relaxation direction for non-sensory layer `l`:
    /// ```text
    /// delta_l = -ε_l - λ·sign(x_l)·[l = 0] + f'(x_l) ⊙ (ε_{l+1} W_l)
    /// ```
    ///
    /// # Errors
    /// `Uninitialized` before `set_nodes`; `InvalidConfig` if `l` is the
    /// sensory layer or out of range.
    fn layer_delta(&self, state: &State, l: usize) -> PcnResult<Array2<f32>> {
        state.ensure_nodes_set("layer_delta")?;
        let net = self.net();
        net.check_state(state)?;
        if l + 1 >= net.n_layers() {
            return Err(PcnError::InvalidConfig(format!(
                "no relaxation delta for layer {l} of {}",
                net.n_layers()
            )));
        }

        let val = &state.val_nodes[l];
        let derivative = net.nonlin.derivative(val);
        let feedback = state.errs[l + 1].dot(&net.layers[l].weight.value);

        let mut delta = -&state.errs[l];
        if l == 0 && net.lamb != 0.0 {
            delta.scaled_add(-net.lamb, &val.mapv(utils::sign));
        }
        delta += &(&derivative * &feedback);
        Ok(delta)
    }

    /// One explicit Euler step on every non-sensory layer, then recompute errors.
    ///
    /// With `recon`, the sensory layer is relaxed too, gated by `update_mask`:
    /// `x_{L-1} += dt * (-ε_{L-1} ⊙ mask)`. Mask entries of 1 let the entry
    /// move (it is treated as unknown), entries of 0 freeze it (observed).
    ///
    /// # Errors
    /// `Uninitialized` before `set_nodes`; `ShapeMismatch` if `update_mask`
    /// does not match the sensory layer's shape.
    fn update_val_nodes(
        &self,
        state: &mut State,
        update_mask: &Array2<f32>,
        recon: bool,
    ) -> PcnResult<()> {
        state.ensure_nodes_set("update_val_nodes")?;
        self.net().check_state(state)?;
        let last = self.net().n_layers() - 1;
        if update_mask.dim() != state.val_nodes[last].dim() {
            return Err(PcnError::ShapeMismatch(format!(
                "update mask {:?} does not match sensory layer {:?}",
                update_mask.dim(),
                state.val_nodes[last].dim()
            )));
        }

        let dt = self.net().dt;
        for l in 0..last {
            let delta = self.layer_delta(state, l)?;
            state.val_nodes[l].scaled_add(dt, &delta);
        }
        if recon {
            let masked = &state.errs[last] * update_mask;
            state.val_nodes[last].scaled_add(-dt, &masked);
        }

        self.update_err_nodes(state)?;
        state.steps_taken += 1;
        state.phase = Phase::Relaxing;
        Ok(())
    }

    /// Generate the sensory pattern predicted from memory alone.
    fn forward(&self) -> PcnResult<Array1<f32>> {
        let net = self.net();
        let mut val = net.memory.value.clone().insert_axis(Axis(0));
        for layer in net.layers.iter() {
            val = layer.forward(&net.nonlin.apply(&val))?;
        }
        Ok(val.row(0).to_owned())
    }

    /// Run one training episode and leave gradients on every parameter.
    ///
    /// The sensory layer stays clamped to `batch_inp`; `update_mask` is only
    /// shape-checked. Returns the final state for diagnostics.
    ///
    /// # Errors
    /// Propagates shape errors from `set_nodes` and `update_val_nodes`.
    fn train_pc_generative(
        &mut self,
        batch_inp: &Array2<f32>,
        n_iters: usize,
        update_mask: &Array2<f32>,
    ) -> PcnResult<State> {
        let mut state = self.initialize();
        self.set_nodes(&mut state, batch_inp)?;
        for _ in 0..n_iters {
            self.update_val_nodes(&mut state, update_mask, false)?;
        }
        self.update_grads(&state)?;
        state.phase = Phase::Graded;

        debug!(
            batch_size = state.batch_size,
            n_iters,
            energy = state.energy(),
            "training episode complete"
        );
        Ok(state)
    }

    /// Relax a corrupted batch with the sensory layer free under `update_mask`
    /// and return the full final state. No gradients are written.
    ///
    /// # Errors
    /// Propagates shape errors from `set_nodes` and `update_val_nodes`.
    fn reconstruct(
        &self,
        corrupt_inp: &Array2<f32>,
        n_iters: usize,
        update_mask: &Array2<f32>,
    ) -> PcnResult<State> {
        let mut state = self.initialize();
        self.set_nodes(&mut state, corrupt_inp)?;
        for _ in 0..n_iters {
            self.update_val_nodes(&mut state, update_mask, true)?;
        }
        state.phase = Phase::Done;
        Ok(state)
    }

    /// Reconstruction episode returning the tensor selected by `readout`.
    ///
    /// # Errors
    /// Propagates shape errors from `set_nodes` and `update_val_nodes`.
    fn test_pc_generative(
        &self,
        corrupt_inp: &Array2<f32>,
        n_iters: usize,
        update_mask: &Array2<f32>,
        readout: Readout,
    ) -> PcnResult<Array2<f32>> {
        let mut state = self.reconstruct(corrupt_inp, n_iters, update_mask)?;
        let last = state.n_layers() - 1;
        let out = match readout {
            Readout::SensoryValues => state.val_nodes.swap_remove(last),
            Readout::SensoryPrediction => state.preds.swap_remove(last),
            Readout::Latent => state.val_nodes.swap_remove(0),
        };
        Ok(out)
    }
}
