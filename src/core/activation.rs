//! Elementwise nonlinearities used in forward predictions and relaxation.

use std::fmt;
use std::str::FromStr;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use super::{PcnError, PcnResult};
use crate::utils;

/// Layer nonlinearity together with its derivative.
///
/// The set of kinds is closed; a model applies the same kind at every
/// non-sensory layer. Serialized by name; config files and CLI flags accept
/// the same case-insensitive names as [`Nonlinearity::from_name`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Nonlinearity {
    /// f(x) = x, f'(x) = 1
    #[default]
    Identity,
    /// f(x) = 1 / (1 + e^-x), f'(x) = σ(x)(1 - σ(x))
    Sigmoid,
    /// Hard step to {0, 1}.
    ///
    /// Not differentiable at the threshold; the derivative is taken as 0
    /// everywhere, so a binary layer receives no feedback from the layer it
    /// predicts. Only meaningful for discrete-state experiments.
    Binary,
    /// f(x) = tanh(x), f'(x) = 1 - tanh²(x)
    Tanh,
    /// f(x) = max(0, x), f'(x) = 1 if x > 0 else 0
    Relu,
}

impl Nonlinearity {
    /// Apply the nonlinearity elementwise: f(X)
    pub fn apply(&self, x: &Array2<f32>) -> Array2<f32> {
        match self {
            Nonlinearity::Identity => x.clone(),
            Nonlinearity::Sigmoid => x.mapv(utils::sigmoid),
            Nonlinearity::Binary => x.mapv(utils::binary),
            Nonlinearity::Tanh => x.mapv(utils::tanh),
            Nonlinearity::Relu => x.mapv(utils::relu),
        }
    }

    /// Elementwise derivative: f'(X)
    pub fn derivative(&self, x: &Array2<f32>) -> Array2<f32> {
        match self {
            Nonlinearity::Identity => Array2::ones(x.dim()),
            Nonlinearity::Sigmoid => x.mapv(utils::d_sigmoid),
            Nonlinearity::Binary => x.mapv(utils::d_binary),
            Nonlinearity::Tanh => x.mapv(utils::d_tanh),
            Nonlinearity::Relu => x.mapv(utils::d_relu),
        }
    }

    /// Canonical lowercase name, as stored in checkpoints.
    pub fn name(&self) -> &'static str {
        match self {
            Nonlinearity::Identity => "identity",
            Nonlinearity::Sigmoid => "sigmoid",
            Nonlinearity::Binary => "binary",
            Nonlinearity::Tanh => "tanh",
            Nonlinearity::Relu => "relu",
        }
    }

    /// Look a nonlinearity up by name (case-insensitive).
    ///
    /// # Errors
    /// `InvalidConfig` for unrecognized names.
    pub fn from_name(name: &str) -> PcnResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "identity" | "linear" => Ok(Nonlinearity::Identity),
            "sigmoid" | "rate" => Ok(Nonlinearity::Sigmoid),
            "binary" => Ok(Nonlinearity::Binary),
            "tanh" => Ok(Nonlinearity::Tanh),
            "relu" => Ok(Nonlinearity::Relu),
            _ => Err(PcnError::InvalidConfig(format!(
                "unknown nonlinearity: {name}"
            ))),
        }
    }
}

impl FromStr for Nonlinearity {
    type Err = PcnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
    }
}

impl TryFrom<String> for Nonlinearity {
    type Error = PcnError;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        Self::from_name(&name)
    }
}

impl From<Nonlinearity> for String {
    fn from(kind: Nonlinearity) -> Self {
        kind.name().to_string()
    }
}

impl fmt::Display for Nonlinearity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
