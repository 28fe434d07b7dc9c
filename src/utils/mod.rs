//! Math utilities: scalar nonlinearities, their derivatives, and error metrics.

use ndarray::Array2;

/// Activation function: logistic sigmoid.
#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Derivative of sigmoid: σ(x)(1 - σ(x)).
#[inline]
pub fn d_sigmoid(x: f32) -> f32 {
    let s = sigmoid(x);
    s * (1.0 - s)
}

/// Activation function: hard binary step, 1 for x > 0 and 0 otherwise.
#[inline]
pub fn binary(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else {
        0.0
    }
}

/// Derivative of the binary step, taken as 0 everywhere (including the threshold).
#[inline]
pub fn d_binary(_x: f32) -> f32 {
    0.0
}

/// Activation function: tanh.
#[inline]
pub fn tanh(x: f32) -> f32 {
    x.tanh()
}

/// Derivative of tanh activation.
#[inline]
pub fn d_tanh(x: f32) -> f32 {
    let t = x.tanh();
    1.0 - t * t
}

/// Activation function: rectified linear.
#[inline]
pub fn relu(x: f32) -> f32 {
    if x > 0.0 {
        x
    } else {
        0.0
    }
}

/// Derivative of ReLU: indicator(x > 0).
#[inline]
pub fn d_relu(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else {
        0.0
    }
}

/// Sign with `sign(0) = 0`.
///
/// `f32::signum` maps `+0.0` to `1.0`, which would push zero-valued latents
/// off zero under the L1 penalty.
#[inline]
pub fn sign(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Mean squared error between two equally shaped matrices.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn mse(a: &Array2<f32>, b: &Array2<f32>) -> f32 {
    let n = a.len();
    if n == 0 {
        return 0.0;
    }
    let diff = a - b;
    diff.iter().map(|v| v * v).sum::<f32>() / n as f32
}

/// Peak signal-to-noise ratio for values in \[0, 1\].
#[must_use]
pub fn psnr(mse: f32) -> f32 {
    if mse <= 0.0 {
        return f32::INFINITY;
    }
    10.0 * (1.0 / mse).log10()
}
