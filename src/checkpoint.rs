//! Checkpoint save/load for multilayer PCNs.
//!
//! Serializes every learnable parameter plus the model config to JSON.
//! Arrays are stored as nested `Vec`s and shape-checked against the config
//! on load.

use std::path::Path;

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;
use crate::core::{
    HierarchicalPcn, HybridPcn, LayerStack, Linear, MultilayerPcn, Param, PcnError, PcnResult,
};

/// Which multilayer variant a checkpoint holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Hierarchical,
    Hybrid,
}

/// Serializable checkpoint data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointData {
    pub kind: ModelKind,
    /// Construction config; `nodes` defines every expected shape.
    pub config: ModelConfig,
    pub memory: Vec<f32>,
    /// Weight matrices as nested Vec, one per layer.
    pub weights: Vec<Vec<Vec<f32>>>,
    /// Bias vectors, present only when the model uses bias.
    pub biases: Option<Vec<Vec<f32>>>,
    /// Recurrent weight (hybrid only).
    #[serde(default)]
    pub recurrent: Option<Vec<Vec<f32>>>,
    /// Epoch at which this checkpoint was saved.
    pub epoch: usize,
    /// Average energy at checkpoint time.
    pub avg_energy: f32,
}

/// Convert an Array2 to Vec<Vec<f32>> for serialization.
fn array2_to_vecs(arr: &Array2<f32>) -> Vec<Vec<f32>> {
    arr.rows().into_iter().map(|row| row.to_vec()).collect()
}

/// Convert Vec<Vec<f32>> back to an Array2 of the expected shape.
fn vecs_to_array2(vecs: &[Vec<f32>], shape: (usize, usize), what: &str) -> PcnResult<Array2<f32>> {
    if vecs.len() != shape.0 || vecs.iter().any(|row| row.len() != shape.1) {
        return Err(PcnError::Checkpoint(format!(
            "{what} does not have shape {shape:?}"
        )));
    }
    let flat: Vec<f32> = vecs.iter().flat_map(|r| r.iter().copied()).collect();
    Array2::from_shape_vec(shape, flat)
        .map_err(|e| PcnError::Checkpoint(format!("failed to rebuild {what}: {e}")))
}

fn vec_to_array1(values: &[f32], len: usize, what: &str) -> PcnResult<Array1<f32>> {
    if values.len() != len {
        return Err(PcnError::Checkpoint(format!(
            "{what} has length {}, expected {len}",
            values.len()
        )));
    }
    Ok(Array1::from(values.to_vec()))
}

impl CheckpointData {
    fn from_net(kind: ModelKind, net: &MultilayerPcn, epoch: usize, avg_energy: f32) -> Self {
        let biases: Option<Vec<Vec<f32>>> = net.layers.uses_bias().then(|| {
            net.layers
                .iter()
                .map(|layer| {
                    layer
                        .bias
                        .as_ref()
                        .map(|b| b.value.to_vec())
                        .unwrap_or_default()
                })
                .collect()
        });
        Self {
            kind,
            config: net.config(),
            memory: net.memory.value.to_vec(),
            weights: net.layers.iter().map(|l| array2_to_vecs(&l.weight.value)).collect(),
            biases,
            recurrent: None,
            epoch,
            avg_energy,
        }
    }

    pub fn from_hierarchical(model: &HierarchicalPcn, epoch: usize, avg_energy: f32) -> Self {
        Self::from_net(ModelKind::Hierarchical, &model.net, epoch, avg_energy)
    }

    pub fn from_hybrid(model: &HybridPcn, epoch: usize, avg_energy: f32) -> Self {
        let mut data = Self::from_net(ModelKind::Hybrid, &model.net, epoch, avg_energy);
        data.recurrent = Some(array2_to_vecs(&model.wr.value));
        data
    }

    fn to_net(&self) -> PcnResult<MultilayerPcn> {
        self.config.validate()?;
        let nodes = &self.config.nodes;
        if self.weights.len() != nodes.len() - 1 {
            return Err(PcnError::Checkpoint(format!(
                "{} weight matrices for {} layers",
                self.weights.len(),
                nodes.len()
            )));
        }

        let mut layers = Vec::with_capacity(self.weights.len());
        for (l, weight) in self.weights.iter().enumerate() {
            let shape = (nodes[l + 1], nodes[l]);
            let weight = vecs_to_array2(weight, shape, &format!("layer_{l}.weight"))?;
            let bias = match (&self.biases, self.config.use_bias) {
                (Some(biases), true) => {
                    let values = biases.get(l).ok_or_else(|| {
                        PcnError::Checkpoint(format!("missing bias for layer {l}"))
                    })?;
                    Some(Param::new(vec_to_array1(
                        values,
                        nodes[l + 1],
                        &format!("layer_{l}.bias"),
                    )?))
                }
                (None, false) => None,
                _ => {
                    return Err(PcnError::Checkpoint(
                        "bias flag and stored biases disagree".to_string(),
                    ))
                }
            };
            layers.push(Linear {
                weight: Param::new(weight),
                bias,
            });
        }

        Ok(MultilayerPcn {
            nodes: nodes.clone(),
            layers: LayerStack::from_layers(layers),
            memory: Param::new(vec_to_array1(&self.memory, nodes[0], "memory")?),
            nonlin: self.config.nonlin,
            dt: self.config.dt,
            lamb: self.config.lamb,
            init_std: self.config.init_std,
            init_std_wr: self.config.init_std_wr,
        })
    }

    /// # Errors
    /// `Checkpoint` if this is not a hierarchical checkpoint or any shape is off.
    pub fn to_hierarchical(&self) -> PcnResult<HierarchicalPcn> {
        if self.kind != ModelKind::Hierarchical {
            return Err(PcnError::Checkpoint(format!(
                "expected hierarchical checkpoint, found {:?}",
                self.kind
            )));
        }
        Ok(HierarchicalPcn { net: self.to_net()? })
    }

    /// # Errors
    /// `Checkpoint` if this is not a hybrid checkpoint or any shape is off.
    pub fn to_hybrid(&self) -> PcnResult<HybridPcn> {
        if self.kind != ModelKind::Hybrid {
            return Err(PcnError::Checkpoint(format!(
                "expected hybrid checkpoint, found {:?}",
                self.kind
            )));
        }
        let recurrent = self
            .recurrent
            .as_ref()
            .ok_or_else(|| PcnError::Checkpoint("missing recurrent weight".to_string()))?;
        let dim = self.config.nodes.first().copied().unwrap_or(0);
        let wr = vecs_to_array2(recurrent, (dim, dim), "recurrent")?;

        let mut model = HybridPcn {
            net: self.to_net()?,
            wr: Param::new(Array2::zeros((dim, dim))),
        };
        model.set_recurrent(wr)?;
        Ok(model)
    }
}

/// Save a checkpoint to a JSON file, creating parent directories.
///
/// # Errors
///
/// Returns an error if the file cannot be written or the data cannot be serialized.
pub fn save_checkpoint(data: &CheckpointData, path: &Path) -> PcnResult<()> {
    let json = serde_json::to_string_pretty(data)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, json)?;
    Ok(())
}

/// Load a checkpoint from a JSON file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_checkpoint(path: &Path) -> PcnResult<CheckpointData> {
    let json = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}
