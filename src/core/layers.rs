//! Learnable parameters and the affine layer stack.
//!
//! Layer `l` maps `nodes[l]` to `nodes[l + 1]`:
//! ```text
//! layer_l(x) = x @ Wᵀ + b      W: (nodes[l+1], nodes[l]),  b: (nodes[l+1])
//! ```

use std::ops::{Index, IndexMut};

use ndarray::{Array, Array1, Array2, ArrayViewD, ArrayViewMutD, Dimension};
use ndarray_rand::RandomExt;
use rand::distributions::Uniform;
use rand::Rng;

use super::{PcnError, PcnResult};

/// A learnable tensor with its most recent gradient.
///
/// Gradients are written by [`Relaxation::update_grads`](super::Relaxation::update_grads)
/// and consumed by an external [`Optimizer`](crate::optim::Optimizer).
/// A new gradient always replaces the previous one.
#[derive(Debug, Clone, PartialEq)]
pub struct Param<D: Dimension> {
    pub value: Array<f32, D>,
    pub grad: Option<Array<f32, D>>,
}

impl<D: Dimension> Param<D> {
    pub fn new(value: Array<f32, D>) -> Self {
        Self { value, grad: None }
    }

    /// Replace the gradient. The shape must match the value's shape.
    ///
    /// # Errors
    /// `ShapeMismatch` if the gradient and value shapes differ.
    pub fn set_grad(&mut self, grad: Array<f32, D>) -> PcnResult<()> {
        if grad.shape() != self.value.shape() {
            return Err(PcnError::ShapeMismatch(format!(
                "gradient shape {:?} does not match parameter shape {:?}",
                grad.shape(),
                self.value.shape()
            )));
        }
        self.grad = Some(grad);
        Ok(())
    }

    pub fn zero_grad(&mut self) {
        self.grad = None;
    }

    /// Dynamic-rank view used by optimizers.
    pub fn slot(&mut self, name: impl Into<String>) -> ParamSlot<'_> {
        ParamSlot {
            name: name.into(),
            value: self.value.view_mut().into_dyn(),
            grad: self.grad.as_ref().map(|g| g.view().into_dyn()),
        }
    }
}

/// A named, rank-erased handle on one parameter and its gradient.
#[derive(Debug)]
pub struct ParamSlot<'a> {
    pub name: String,
    pub value: ArrayViewMutD<'a, f32>,
    pub grad: Option<ArrayViewD<'a, f32>>,
}

/// Anything that exposes learnable parameters to an [`Optimizer`](crate::optim::Optimizer).
pub trait Parameterized {
    /// Every learnable parameter, named, for an optimizer.
    fn params_mut(&mut self) -> Vec<ParamSlot<'_>>;

    /// Clear every parameter gradient.
    fn zero_grad(&mut self);

    /// Re-establish standing parameter invariants after an optimizer step.
    fn constrain_params(&mut self) {}
}

/// Clear the diagonal of a square lateral weight or its gradient.
pub(crate) fn zero_diagonal(matrix: &mut Array2<f32>) {
    matrix.diag_mut().fill(0.0);
}

/// Affine transform with an optional bias.
#[derive(Debug, Clone, PartialEq)]
pub struct Linear {
    /// Shape (out_features, in_features)
    pub weight: Param<ndarray::Ix2>,
    /// Shape (out_features), present only when bias is enabled
    pub bias: Option<Param<ndarray::Ix1>>,
}

impl Linear {
    /// Create a layer with weights (and bias) drawn from
    /// `U(-1/sqrt(in_features), 1/sqrt(in_features))`.
    pub fn new_with_rng<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        use_bias: bool,
        rng: &mut R,
    ) -> Self {
        let bound = 1.0 / (in_features as f32).sqrt();
        let dist = Uniform::new(-bound, bound);
        let weight = Array2::random_using((out_features, in_features), dist, rng);
        let bias = use_bias.then(|| Param::new(Array1::random_using(out_features, dist, rng)));
        Self {
            weight: Param::new(weight),
            bias,
        }
    }

    /// Layer with all-zero weights (and bias).
    pub fn zeros(in_features: usize, out_features: usize, use_bias: bool) -> Self {
        Self {
            weight: Param::new(Array2::zeros((out_features, in_features))),
            bias: use_bias.then(|| Param::new(Array1::zeros(out_features))),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.value.ncols()
    }

    /// `x @ Wᵀ + b`, with `b` broadcast over the batch rows.
    ///
    /// # Errors
    /// `ShapeMismatch` if `x` does not have `in_features` columns.
    pub fn forward(&self, x: &Array2<f32>) -> PcnResult<Array2<f32>> {
        if x.ncols() != self.in_features() {
            return Err(PcnError::ShapeMismatch(format!(
                "layer expects {} input features, got {}",
                self.in_features(),
                x.ncols()
            )));
        }
        let mut out = x.dot(&self.weight.value.t());
        if let Some(bias) = &self.bias {
            out += &bias.value;
        }
        Ok(out)
    }
}

/// Ordered stack of affine layers, `nodes.len() - 1` of them.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerStack {
    layers: Vec<Linear>,
}

impl LayerStack {
    pub fn new_with_rng<R: Rng + ?Sized>(nodes: &[usize], use_bias: bool, rng: &mut R) -> Self {
        let layers = nodes
            .windows(2)
            .map(|pair| Linear::new_with_rng(pair[0], pair[1], use_bias, rng))
            .collect();
        Self { layers }
    }

    pub fn from_layers(layers: Vec<Linear>) -> Self {
        Self { layers }
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Linear> {
        self.layers.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Linear> {
        self.layers.iter_mut()
    }

    pub fn uses_bias(&self) -> bool {
        self.layers.iter().any(|layer| layer.bias.is_some())
    }
}

impl Index<usize> for LayerStack {
    type Output = Linear;

    fn index(&self, index: usize) -> &Linear {
        &self.layers[index]
    }
}

impl IndexMut<usize> for LayerStack {
    fn index_mut(&mut self, index: usize) -> &mut Linear {
        &mut self.layers[index]
    }
}
