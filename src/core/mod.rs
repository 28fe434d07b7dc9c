//! Core predictive coding dynamics.
//!
//! This module provides the multilayer PCN structures and operations:
//! - Layerwise predictions and prediction errors
//! - Fixed-budget relaxation of value nodes (explicit Euler steps)
//! - Closed-form local gradients for an external optimizer
//!
//! ## Energy
//!
//! Layer 0 is the top (memory) layer, layer `L-1` is sensory:
//! ```text
//! E = (1/2) * Σ_l ||ε_l||²  +  λ * |x_0|₁
//!
//! ε_0 = x_0 - m                         (hierarchical)
//! ε_0 = x_0 - (m + x_0 Wrᵀ)             (hybrid)
//! ε_l = x_l - (f(x_{l-1}) W_{l-1}ᵀ + b_{l-1})   for l ≥ 1
//! ```
//!
//! Relaxation moves every non-sensory `x_l` along `-∂E/∂x_l`. Gradients are
//! always reported as *negative* Hebbian terms (`-εᵀ f(x)`, `-Σ ε`), so an
//! optimizer that subtracts them performs gradient descent on `E`.
//!
//! Non-finite values (from a large `dt` or too many iterations) are not
//! detected here; callers check results at their own boundary.

pub mod activation;
pub mod hierarchical;
pub mod hybrid;
pub mod layers;
pub mod recurrent;
pub mod relax;
pub mod state;

use thiserror::Error;

pub use activation::Nonlinearity;
pub use hierarchical::HierarchicalPcn;
pub use hybrid::HybridPcn;
pub use layers::{LayerStack, Linear, Param, ParamSlot, Parameterized};
pub use recurrent::RecPcn;
pub use relax::{MultilayerPcn, Readout, Relaxation};
pub use state::{Phase, State};

/// Error type for PCN operations.
#[derive(Debug, Error)]
pub enum PcnError {
    /// Shape mismatch between tensors and declared layer sizes
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),
    /// Invalid network or training configuration
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    /// Operation attempted on an episode whose nodes were never set
    #[error("Uninitialized state: {0}")]
    Uninitialized(String),
    /// Checkpoint contents inconsistent with the stored configuration
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

pub type PcnResult<T> = Result<T, PcnError>;
