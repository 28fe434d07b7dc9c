//! Synthetic memory patterns and corruption for reconstruction experiments.
//!
//! Every corruption helper returns the corrupted batch together with the
//! update mask the relaxation core expects: 1 where the sensory layer may
//! relax (the entry is unknown), 0 where it stays frozen (observed).

use ndarray::{Array2, Axis};
use ndarray_rand::rand_distr::{Normal, StandardNormal};
use ndarray_rand::RandomExt;
use rand::distributions::Uniform;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::{PcnError, PcnResult};

/// Distribution of generated patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    /// i.i.d. N(0, 1) entries
    #[default]
    Gaussian,
    /// i.i.d. {0, 1} entries with p = 0.5
    Binary,
    /// i.i.d. {-1, 1} entries with p = 0.5
    Bipolar,
}

/// `num_patterns` random patterns of dimension `dim`, one per row.
pub fn generate_patterns<R: Rng + ?Sized>(
    kind: PatternKind,
    num_patterns: usize,
    dim: usize,
    rng: &mut R,
) -> Array2<f32> {
    let shape = (num_patterns, dim);
    match kind {
        PatternKind::Gaussian => Array2::random_using(shape, StandardNormal, rng),
        PatternKind::Binary | PatternKind::Bipolar => {
            let off = if kind == PatternKind::Binary { 0.0 } else { -1.0 };
            let coins: Array2<f32> = Array2::random_using(shape, Uniform::new(0.0f32, 1.0), rng);
            coins.mapv(|u| if u < 0.5 { 1.0 } else { off })
        }
    }
}

/// Zero out the last `fraction` of every row and mark those entries relaxable.
///
/// Returns `(occluded, mask)`. For image rows stored row-major this hides the
/// bottom part of the image.
///
/// # Errors
/// `InvalidConfig` unless `0 <= fraction <= 1`.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn occlude_bottom(
    data: &Array2<f32>,
    fraction: f32,
) -> PcnResult<(Array2<f32>, Array2<f32>)> {
    if !(0.0..=1.0).contains(&fraction) {
        return Err(PcnError::InvalidConfig(format!(
            "occlusion fraction must be in [0, 1], got {fraction}"
        )));
    }
    let dim = data.ncols();
    let hidden = ((dim as f32) * fraction).round() as usize;
    let first_hidden = dim - hidden.min(dim);

    let mut occluded = data.clone();
    let mut mask = Array2::zeros(data.dim());
    for (mut row, mut mask_row) in occluded
        .axis_iter_mut(Axis(0))
        .zip(mask.axis_iter_mut(Axis(0)))
    {
        for j in first_hidden..dim {
            row[j] = 0.0;
            mask_row[j] = 1.0;
        }
    }
    Ok((occluded, mask))
}

/// Add N(0, std²) noise to every entry; every entry may relax.
///
/// Returns `(noisy, mask)` with an all-ones mask.
///
/// # Errors
/// `InvalidConfig` if `std` is negative or not finite.
pub fn add_gaussian_noise<R: Rng + ?Sized>(
    data: &Array2<f32>,
    std: f32,
    rng: &mut R,
) -> PcnResult<(Array2<f32>, Array2<f32>)> {
    if !(std.is_finite() && std >= 0.0) {
        return Err(PcnError::InvalidConfig(format!(
            "noise std must be finite and >= 0, got {std}"
        )));
    }
    let noise = Normal::new(0.0f32, std).map_err(|e| {
        PcnError::InvalidConfig(format!("invalid noise std {std}: {e}"))
    })?;
    let samples: Array2<f32> = Array2::random_using(data.dim(), noise, rng);
    let noisy = data + &samples;
    Ok((noisy, Array2::ones(data.dim())))
}
