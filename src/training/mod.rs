//! Training loops and reconstruction evaluation.
//!
//! Training is strictly sequential: each mini-batch runs one relaxation
//! episode, writes gradients, and the optimizer applies them before the next
//! batch starts. Evaluation only reads parameters, so independent batches
//! are relaxed in parallel with Rayon.

use ndarray::{s, Array2, Axis};
use rand::seq::SliceRandom;
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::TrainConfig;
use crate::core::{Parameterized, PcnError, PcnResult, Readout, Relaxation};
use crate::optim::{apply_step, Optimizer};
use crate::utils;

/// Mini-batch training statistics for an epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// Final relaxation energy per sample, averaged over the epoch
    pub avg_energy: f32,
    /// Sensory-layer MSE after relaxation, averaged over the epoch
    pub avg_sensory_mse: f32,
    pub num_batches: usize,
    pub num_samples: usize,
    /// Per-batch energy per sample
    pub batch_energies: Vec<f32>,
}

/// Reconstruction quality over a dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconMetrics {
    /// MSE between the relaxed sensory layer and the clean data
    pub mse: f32,
    /// PSNR for data in \[0, 1\]
    pub psnr: f32,
    pub num_samples: usize,
}

fn batch_ranges(num_samples: usize, batch_size: usize) -> Vec<(usize, usize)> {
    (0..num_samples.div_ceil(batch_size))
        .map(|b| {
            let start = b * batch_size;
            (start, (start + batch_size).min(num_samples))
        })
        .collect()
}

/// Train for one epoch over the rows of `data`.
///
/// Each batch: clear gradients, run `train_pc_generative` with
/// `config.n_iters` steps, apply the optimizer, re-establish parameter
/// invariants.
///
/// # Errors
/// `InvalidConfig` for a zero batch size or empty data; shape errors from
/// the relaxation core.
#[allow(clippy::cast_precision_loss)]
pub fn train_epoch<M, O, R>(
    model: &mut M,
    optimizer: &mut O,
    data: &Array2<f32>,
    config: &TrainConfig,
    rng: &mut R,
) -> PcnResult<EpochMetrics>
where
    M: Relaxation + ?Sized,
    O: Optimizer + ?Sized,
    R: Rng + ?Sized,
{
    config.validate()?;
    let num_samples = data.nrows();
    if num_samples == 0 {
        return Err(PcnError::InvalidConfig("training data is empty".to_string()));
    }

    let mut indices: Vec<usize> = (0..num_samples).collect();
    if config.shuffle {
        indices.shuffle(rng);
    }

    let ranges = batch_ranges(num_samples, config.batch_size);
    let mut batch_energies = Vec::with_capacity(ranges.len());
    let mut total_energy = 0.0f32;
    let mut total_mse = 0.0f32;

    for (batch_idx, &(start, end)) in ranges.iter().enumerate() {
        let batch = data.select(Axis(0), &indices[start..end]);
        let mask = Array2::zeros(batch.dim());

        model.zero_grad();
        let state = model.train_pc_generative(&batch, config.n_iters, &mask)?;
        apply_step(model, optimizer)?;

        let size = (end - start) as f32;
        let energy = state.energy();
        if !energy.is_finite() {
            warn!(batch = batch_idx, energy, "non-finite relaxation energy");
        }
        debug!(batch = batch_idx, energy, "batch trained");

        batch_energies.push(energy / size);
        total_energy += energy;
        total_mse += state.sensory_mse() * size;
    }

    Ok(EpochMetrics {
        avg_energy: total_energy / num_samples as f32,
        avg_sensory_mse: total_mse / num_samples as f32,
        num_batches: ranges.len(),
        num_samples,
        batch_energies,
    })
}

/// Relax `corrupted` under `mask` and compare the result against `clean`.
///
/// Batches are independent and evaluated in parallel; the model is only read.
///
/// # Errors
/// `ShapeMismatch` if `clean`, `corrupted` and `mask` differ in shape;
/// `InvalidConfig` for a zero batch size.
#[allow(clippy::cast_precision_loss)]
pub fn evaluate_reconstruction<M>(
    model: &M,
    clean: &Array2<f32>,
    corrupted: &Array2<f32>,
    mask: &Array2<f32>,
    n_iters: usize,
    batch_size: usize,
) -> PcnResult<ReconMetrics>
where
    M: Relaxation + Sync + ?Sized,
{
    if batch_size == 0 {
        return Err(PcnError::InvalidConfig("Batch size must be > 0".to_string()));
    }
    if clean.dim() != corrupted.dim() || mask.dim() != corrupted.dim() {
        return Err(PcnError::ShapeMismatch(format!(
            "clean {:?}, corrupted {:?} and mask {:?} must match",
            clean.dim(),
            corrupted.dim(),
            mask.dim()
        )));
    }

    let num_samples = clean.nrows();
    let sq_errors: Vec<f32> = batch_ranges(num_samples, batch_size)
        .into_par_iter()
        .map(|(start, end)| {
            let inp = corrupted.slice(s![start..end, ..]).to_owned();
            let batch_mask = mask.slice(s![start..end, ..]).to_owned();
            let recon =
                model.test_pc_generative(&inp, n_iters, &batch_mask, Readout::SensoryValues)?;
            let target = clean.slice(s![start..end, ..]);
            let diff = &recon - &target;
            Ok(diff.iter().map(|v| v * v).sum::<f32>())
        })
        .collect::<PcnResult<Vec<f32>>>()?;

    let total = clean.len().max(1) as f32;
    let mse = sq_errors.iter().sum::<f32>() / total;
    Ok(ReconMetrics {
        mse,
        psnr: utils::psnr(mse),
        num_samples,
    })
}
