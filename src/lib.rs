//! # pcn_memory
//!
//! Multilayer predictive coding networks (PCNs) used as generative memories.
//!
//! ## Overview
//!
//! A PCN infers its internal representation by iteratively relaxing latent
//! value nodes to reduce layerwise prediction errors, then learns from the
//! final errors with purely local, closed-form gradients. No backward pass
//! and no automatic differentiation are involved.
//!
//! Two variants share one relaxation engine:
//! - [`HierarchicalPcn`]: the top layer is predicted by a learned memory vector
//! - [`HybridPcn`]: adds a learned lateral weight among the top-layer nodes
//!
//! [`RecPcn`] is the single-layer recurrent baseline: sensory nodes predict
//! each other through a lateral weight and learning needs no relaxation.
//!
//! ## Structure
//!
//! - [`core`]: Nonlinearities, layers, episode state, relaxation, variants
//! - [`config`]: Model and training configuration
//! - [`optim`]: Optimizers consuming the computed gradients
//! - [`training`]: Epoch loop and reconstruction evaluation
//! - [`data`]: Synthetic patterns and corruption masks
//! - [`checkpoint`]: JSON save/load
//! - [`utils`]: Scalar math helpers

pub mod checkpoint;
pub mod config;
pub mod core;
pub mod data;
pub mod optim;
pub mod training;
pub mod utils;

pub use crate::config::{Config, ModelConfig, TrainConfig};
pub use crate::core::{
    HierarchicalPcn, HybridPcn, MultilayerPcn, Nonlinearity, Parameterized, PcnError, PcnResult,
    Phase, Readout, RecPcn, Relaxation, State,
};
pub use checkpoint::{load_checkpoint, save_checkpoint, CheckpointData, ModelKind};
pub use optim::{apply_step, Optimizer, Sgd};
pub use training::{evaluate_reconstruction, train_epoch, EpochMetrics, ReconMetrics};
