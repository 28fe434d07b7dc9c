//! Model and training configuration.
//!
//! Both structs are plain serde types so they can be stored in checkpoints
//! and loaded from JSON files by the CLI.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::{Nonlinearity, PcnError, PcnResult};

/// Construction parameters for a multilayer PCN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Layer sizes, top (memory) layer first, sensory layer last
    pub nodes: Vec<usize>,
    pub nonlin: Nonlinearity,
    /// Relaxation step size
    pub dt: f32,
    /// L1 sparsity coefficient on the top layer
    pub lamb: f32,
    pub use_bias: bool,
    /// Std of the initial memory vector
    pub init_std: f32,
    /// Std of the initial recurrent weight (hybrid only)
    pub init_std_wr: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            nodes: vec![16, 64],
            nonlin: Nonlinearity::Identity,
            dt: 0.1,
            lamb: 0.0,
            use_bias: false,
            init_std: 0.0,
            init_std_wr: 0.0,
        }
    }
}

impl ModelConfig {
    /// # Errors
    /// `InvalidConfig` describing the first violated constraint.
    pub fn validate(&self) -> PcnResult<()> {
        if self.nodes.len() < 2 {
            return Err(PcnError::InvalidConfig(
                "Must have at least 2 layers (memory and sensory)".to_string(),
            ));
        }
        if self.nodes.iter().any(|&n| n == 0) {
            return Err(PcnError::InvalidConfig(format!(
                "layer sizes must be positive: {:?}",
                self.nodes
            )));
        }
        if !(self.dt.is_finite() && self.dt > 0.0) {
            return Err(PcnError::InvalidConfig(format!(
                "dt must be positive and finite, got {}",
                self.dt
            )));
        }
        if !(self.lamb.is_finite() && self.lamb >= 0.0) {
            return Err(PcnError::InvalidConfig(format!(
                "lamb must be >= 0, got {}",
                self.lamb
            )));
        }
        for (name, scale) in [("init_std", self.init_std), ("init_std_wr", self.init_std_wr)] {
            if !(scale.is_finite() && scale >= 0.0) {
                return Err(PcnError::InvalidConfig(format!(
                    "{name} must be finite and >= 0, got {scale}"
                )));
            }
        }
        Ok(())
    }
}

/// Training-loop and optimizer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Relaxation steps per episode
    pub n_iters: usize,
    pub batch_size: usize,
    pub epochs: usize,
    /// Optimizer learning rate
    pub lr: f32,
    pub momentum: f32,
    pub weight_decay: f32,
    /// Shuffle sample order each epoch
    pub shuffle: bool,
    /// Seed for parameter init, data generation and shuffling
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            n_iters: 50,
            batch_size: 32,
            epochs: 100,
            lr: 0.01,
            momentum: 0.9,
            weight_decay: 0.0,
            shuffle: true,
            seed: 0,
        }
    }
}

impl TrainConfig {
    /// # Errors
    /// `InvalidConfig` describing the first violated constraint.
    pub fn validate(&self) -> PcnResult<()> {
        if self.batch_size == 0 {
            return Err(PcnError::InvalidConfig(
                "Batch size must be > 0".to_string(),
            ));
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(PcnError::InvalidConfig(format!(
                "learning rate must be positive, got {}",
                self.lr
            )));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(PcnError::InvalidConfig(format!(
                "momentum must be in [0, 1), got {}",
                self.momentum
            )));
        }
        if self.weight_decay < 0.0 {
            return Err(PcnError::InvalidConfig(
                "weight decay must be >= 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Full experiment configuration as stored on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub train: TrainConfig,
}

impl Config {
    /// Load a JSON config file; missing fields take their defaults.
    ///
    /// # Errors
    /// I/O and JSON errors, or `InvalidConfig` if either section fails validation.
    pub fn from_json_file(path: &Path) -> PcnResult<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&json)?;
        config.model.validate()?;
        config.train.validate()?;
        Ok(config)
    }
}
