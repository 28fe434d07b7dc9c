//! Per-episode value, prediction and error buffers.

use ndarray::Array2;

use super::{PcnError, PcnResult};

/// Where an inference episode is in its lifecycle.
///
/// ```text
/// Uninitialized → NodesSet → Relaxing (repeated) → Graded | Done
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Buffers allocated but empty; nothing may read them yet.
    Uninitialized,
    /// Value nodes populated from memory and the input batch, errors computed.
    NodesSet,
    /// At least one relaxation step taken.
    Relaxing,
    /// Parameter gradients written from the final error snapshot.
    Graded,
    /// Reconstruction finished and read out.
    Done,
}

/// Batched network state for one relaxation episode.
///
/// Index 0 is the top (memory) layer, the last index is the sensory layer.
/// Every buffer at layer `l` has shape `(batch_size, nodes[l])` once nodes
/// are set. A `State` is never reused across episodes: each episode starts
/// from a fresh one built by [`Relaxation::initialize`](super::Relaxation::initialize).
#[derive(Debug, Clone)]
pub struct State {
    /// val_nodes[l]: value nodes at layer l
    pub val_nodes: Vec<Array2<f32>>,
    /// preds[l]: model prediction of val_nodes[l]
    pub preds: Vec<Array2<f32>>,
    /// errs[l]: val_nodes[l] - preds[l]
    pub errs: Vec<Array2<f32>>,
    /// Number of samples in this batch (0 until nodes are set)
    pub batch_size: usize,
    /// Relaxation steps taken in this episode
    pub steps_taken: usize,
    pub phase: Phase,
}

impl State {
    /// Empty buffers for a network with `n_layers` layers.
    pub fn empty(n_layers: usize) -> Self {
        let blank = || (0..n_layers).map(|_| Array2::zeros((0, 0))).collect();
        Self {
            val_nodes: blank(),
            preds: blank(),
            errs: blank(),
            batch_size: 0,
            steps_taken: 0,
            phase: Phase::Uninitialized,
        }
    }

    pub fn n_layers(&self) -> usize {
        self.val_nodes.len()
    }

    /// Fail with `Uninitialized` unless nodes have been set for this episode.
    ///
    /// # Errors
    /// `Uninitialized` when called before `set_nodes`.
    pub fn ensure_nodes_set(&self, operation: &str) -> PcnResult<()> {
        if self.phase == Phase::Uninitialized {
            return Err(PcnError::Uninitialized(format!(
                "{operation} called before set_nodes"
            )));
        }
        Ok(())
    }

    /// Sensory-layer value nodes.
    pub fn sensory(&self) -> &Array2<f32> {
        &self.val_nodes[self.n_layers() - 1]
    }

    /// Per-layer energy `0.5 * Σ errs[l]²`, summed over the batch.
    pub fn layer_energies(&self) -> Vec<f32> {
        self.errs
            .iter()
            .map(|e| 0.5 * e.iter().map(|v| v * v).sum::<f32>())
            .collect()
    }

    /// Total prediction-error energy: `E = 0.5 * Σ_l Σ_b ||errs[l]_b||²`
    pub fn energy(&self) -> f32 {
        self.layer_energies().iter().sum()
    }

    /// Mean squared error at the sensory layer.
    #[allow(clippy::cast_precision_loss)]
    pub fn sensory_mse(&self) -> f32 {
        let errs = &self.errs[self.n_layers() - 1];
        if errs.is_empty() {
            return 0.0;
        }
        errs.iter().map(|v| v * v).sum::<f32>() / errs.len() as f32
    }
}
