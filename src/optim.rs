//! Optimizers that consume the gradients written by `update_grads`.
//!
//! The relaxation core never changes parameter values itself; an optimizer
//! reads each [`ParamSlot`]'s gradient and moves the value against it.

use std::collections::HashMap;

use ndarray::ArrayD;

use crate::core::{ParamSlot, Parameterized, PcnError, PcnResult};

/// A parameter-update rule.
pub trait Optimizer {
    /// Apply one update to every slot that carries a gradient.
    ///
    /// # Errors
    /// `ShapeMismatch` if a slot's shape changed since its state was created.
    fn step(&mut self, slots: Vec<ParamSlot<'_>>) -> PcnResult<()>;
}

/// Stochastic gradient descent with momentum and L2 weight decay.
///
/// ```text
/// g = grad + weight_decay * value
/// v = momentum * v + g
/// value -= lr * v
/// ```
#[derive(Debug, Clone)]
pub struct Sgd {
    pub lr: f32,
    pub momentum: f32,
    pub weight_decay: f32,
    velocity: HashMap<String, ArrayD<f32>>,
}

impl Sgd {
    pub fn new(lr: f32, momentum: f32) -> Self {
        Self::with_weight_decay(lr, momentum, 0.0)
    }

    pub fn with_weight_decay(lr: f32, momentum: f32, weight_decay: f32) -> Self {
        Self {
            lr,
            momentum,
            weight_decay,
            velocity: HashMap::new(),
        }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, slots: Vec<ParamSlot<'_>>) -> PcnResult<()> {
        for mut slot in slots {
            let Some(grad) = slot.grad else {
                continue;
            };
            let mut update = grad.to_owned();
            if self.weight_decay != 0.0 {
                update.scaled_add(self.weight_decay, &slot.value);
            }
            if self.momentum != 0.0 {
                let velocity = self
                    .velocity
                    .entry(slot.name.clone())
                    .or_insert_with(|| ArrayD::zeros(update.raw_dim()));
                if velocity.shape() != update.shape() {
                    return Err(PcnError::ShapeMismatch(format!(
                        "momentum buffer for {} has shape {:?}, gradient {:?}",
                        slot.name,
                        velocity.shape(),
                        update.shape()
                    )));
                }
                *velocity *= self.momentum;
                *velocity += &update;
                update.assign(velocity);
            }
            slot.value.scaled_add(-self.lr, &update);
        }
        Ok(())
    }
}

/// Apply `optimizer` to every parameter of `model`, then re-establish the
/// model's parameter invariants.
///
/// # Errors
/// Propagates optimizer errors.
pub fn apply_step<M, O>(model: &mut M, optimizer: &mut O) -> PcnResult<()>
where
    M: Parameterized + ?Sized,
    O: Optimizer + ?Sized,
{
    optimizer.step(model.params_mut())?;
    model.constrain_params();
    Ok(())
}
