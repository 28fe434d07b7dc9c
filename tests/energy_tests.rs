//! Relaxation dynamics, error computation and gradient tests.
//!
//! These tests verify:
//! - Buffer shapes after node setup, for any depth and batch size
//! - The all-zero model is a fixed point of relaxation
//! - Relaxation lowers prediction error
//! - Reconstruction respects the update mask
//! - The L1 term only enters the top layer's delta
//! - Gradients match the derivative of the energy, by hand and numerically
//! - Precondition and shape errors

use approx::assert_abs_diff_eq;
use ndarray::{arr1, arr2, Array2, Axis};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;

use pcn_memory::utils::sign;
use pcn_memory::{
    HierarchicalPcn, HybridPcn, ModelConfig, Nonlinearity, PcnError, Phase, Readout, Relaxation,
};

fn config(nodes: &[usize], nonlin: Nonlinearity, dt: f32) -> ModelConfig {
    ModelConfig {
        nodes: nodes.to_vec(),
        nonlin,
        dt,
        init_std: 1.0,
        init_std_wr: 0.2,
        ..ModelConfig::default()
    }
}

fn random_batch(rows: usize, cols: usize, seed: u64) -> Array2<f32> {
    Array2::random_using((rows, cols), StandardNormal, &mut StdRng::seed_from_u64(seed))
}

fn check_shapes<M: Relaxation>(model: &M, nodes: &[usize], batch_size: usize) {
    let mut state = model.initialize();
    let input = random_batch(batch_size, nodes[nodes.len() - 1], 99);
    model.set_nodes(&mut state, &input).expect("set_nodes failed");

    assert_eq!(state.batch_size, batch_size);
    for (l, &n) in nodes.iter().enumerate() {
        assert_eq!(state.val_nodes[l].dim(), (batch_size, n), "val_nodes[{l}]");
        assert_eq!(state.preds[l].dim(), (batch_size, n), "preds[{l}]");
        assert_eq!(state.errs[l].dim(), state.val_nodes[l].dim(), "errs[{l}]");
    }
}

#[test]
fn test_shapes_after_set_nodes() {
    let mut rng = StdRng::seed_from_u64(0);
    for nodes in [vec![2, 3], vec![3, 5, 4], vec![4, 6, 8, 10]] {
        let cfg = config(&nodes, Nonlinearity::Tanh, 0.1);
        let hier = HierarchicalPcn::new_with_rng(&cfg, &mut rng).unwrap();
        let hybrid = HybridPcn::new_with_rng(&cfg, &mut rng).unwrap();
        for batch_size in [1, 7] {
            check_shapes(&hier, &nodes, batch_size);
            check_shapes(&hybrid, &nodes, batch_size);
        }
    }
}

#[test]
fn test_fresh_state_per_episode_handles_new_batch_size() {
    let mut rng = StdRng::seed_from_u64(1);
    let mut model =
        HierarchicalPcn::new_with_rng(&config(&[3, 4, 5], Nonlinearity::Tanh, 0.1), &mut rng)
            .unwrap();

    let big = random_batch(6, 5, 1);
    let state = model
        .train_pc_generative(&big, 3, &Array2::zeros((6, 5)))
        .unwrap();
    assert_eq!(state.val_nodes[1].dim(), (6, 4));

    let small = random_batch(2, 5, 2);
    let state = model
        .train_pc_generative(&small, 3, &Array2::zeros((2, 5)))
        .unwrap();
    assert_eq!(state.val_nodes[0].dim(), (2, 3));
    assert_eq!(state.errs[2].dim(), (2, 5));
}

#[test]
fn test_zero_model_is_fixed_point() {
    let mut rng = StdRng::seed_from_u64(2);
    let cfg = ModelConfig {
        nodes: vec![3, 4, 5],
        nonlin: Nonlinearity::Tanh,
        dt: 0.1,
        ..ModelConfig::default()
    };
    let mut model = HierarchicalPcn::new_with_rng(&cfg, &mut rng).unwrap();
    for layer in model.net.layers.iter_mut() {
        layer.weight.value.fill(0.0);
    }
    let zeros = Array2::zeros((4, 5));

    for n_iters in [0, 1, 5, 25] {
        let mut state = model.initialize();
        model.set_nodes(&mut state, &zeros).unwrap();
        for _ in 0..n_iters {
            model.update_val_nodes(&mut state, &zeros, false).unwrap();
        }
        for (l, errs) in state.errs.iter().enumerate() {
            assert!(
                errs.iter().all(|&e| e == 0.0),
                "layer {l} has nonzero error after {n_iters} iterations"
            );
        }
    }
}

/// Two-layer linear model: the sensory error is non-increasing in the
/// number of relaxation steps for a small enough step size.
#[test]
fn test_relaxation_reduces_sensory_error() {
    for seed in 0..5 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut model =
            HierarchicalPcn::new_with_rng(&config(&[6, 10], Nonlinearity::Identity, 0.05), &mut rng)
                .unwrap();
        let input = random_batch(8, 10, 100 + seed);
        let mask = Array2::zeros((8, 10));

        let one = model.train_pc_generative(&input, 1, &mask).unwrap();
        let fifty = model.train_pc_generative(&input, 50, &mask).unwrap();

        assert!(
            fifty.sensory_mse() <= one.sensory_mse(),
            "seed {seed}: mse after 50 steps {} > after 1 step {}",
            fifty.sensory_mse(),
            one.sensory_mse()
        );
    }
}

/// Relaxation follows -∂E/∂x, so total energy drops for a small step size.
#[test]
fn test_relaxation_reduces_total_energy() {
    for seed in 0..5 {
        let mut rng = StdRng::seed_from_u64(seed);
        let model =
            HierarchicalPcn::new_with_rng(&config(&[4, 8, 12], Nonlinearity::Tanh, 0.05), &mut rng)
                .unwrap();
        let input = random_batch(5, 12, 200 + seed);
        let mask = Array2::zeros((5, 12));

        let mut state = model.initialize();
        model.set_nodes(&mut state, &input).unwrap();
        let initial = state.energy();
        for _ in 0..50 {
            model.update_val_nodes(&mut state, &mask, false).unwrap();
        }
        assert!(state.energy() < initial, "seed {seed}");
        assert_eq!(state.steps_taken, 50);
        assert_eq!(state.phase, Phase::Relaxing);
    }
}

#[test]
fn test_training_keeps_sensory_layer_clamped() {
    let mut rng = StdRng::seed_from_u64(3);
    let mut model =
        HierarchicalPcn::new_with_rng(&config(&[3, 6], Nonlinearity::Tanh, 0.1), &mut rng).unwrap();
    let input = random_batch(4, 6, 3);
    let state = model
        .train_pc_generative(&input, 20, &Array2::ones((4, 6)))
        .unwrap();
    assert_eq!(state.sensory(), &input);
    assert_eq!(state.phase, Phase::Graded);
}

#[test]
fn test_zero_mask_freezes_sensory_layer() {
    let mut rng = StdRng::seed_from_u64(4);
    let cfg = config(&[4, 8, 6], Nonlinearity::Tanh, 0.1);
    let hier = HierarchicalPcn::new_with_rng(&cfg, &mut rng).unwrap();
    let hybrid = HybridPcn::new_with_rng(&cfg, &mut rng).unwrap();
    let corrupt = random_batch(3, 6, 4);
    let mask = Array2::zeros((3, 6));

    for n_iters in [0, 1, 10, 100] {
        let out = hier
            .test_pc_generative(&corrupt, n_iters, &mask, Readout::SensoryValues)
            .unwrap();
        assert_eq!(out, corrupt, "hierarchical, {n_iters} iterations");
        let out = hybrid
            .test_pc_generative(&corrupt, n_iters, &mask, Readout::SensoryValues)
            .unwrap();
        assert_eq!(out, corrupt, "hybrid, {n_iters} iterations");
    }
}

#[test]
fn test_mask_selects_relaxed_entries() {
    let mut rng = StdRng::seed_from_u64(5);
    let model =
        HierarchicalPcn::new_with_rng(&config(&[4, 6], Nonlinearity::Tanh, 0.1), &mut rng).unwrap();
    let corrupt = random_batch(2, 6, 5);
    let mut mask = Array2::zeros((2, 6));
    mask.column_mut(4).fill(1.0);
    mask.column_mut(5).fill(1.0);

    let out = model
        .test_pc_generative(&corrupt, 10, &mask, Readout::SensoryValues)
        .unwrap();
    for j in 0..4 {
        assert_eq!(out.column(j), corrupt.column(j), "column {j} should be frozen");
    }
    assert_ne!(out.column(4), corrupt.column(4));
    assert_ne!(out.column(5), corrupt.column(5));
}

#[test]
fn test_readouts() {
    let mut rng = StdRng::seed_from_u64(6);
    let model =
        HierarchicalPcn::new_with_rng(&config(&[3, 5, 7], Nonlinearity::Tanh, 0.1), &mut rng)
            .unwrap();
    let corrupt = random_batch(4, 7, 6);
    let mask = Array2::ones((4, 7));

    let state = model.reconstruct(&corrupt, 15, &mask).unwrap();
    assert_eq!(state.phase, Phase::Done);
    assert_eq!(state.steps_taken, 15);

    let sensory = model
        .test_pc_generative(&corrupt, 15, &mask, Readout::SensoryValues)
        .unwrap();
    let prediction = model
        .test_pc_generative(&corrupt, 15, &mask, Readout::SensoryPrediction)
        .unwrap();
    let latent = model
        .test_pc_generative(&corrupt, 15, &mask, Readout::Latent)
        .unwrap();

    assert_eq!(&sensory, state.sensory());
    assert_eq!(prediction, state.preds[2]);
    assert_eq!(latent, state.val_nodes[0]);
    assert_eq!(latent.dim(), (4, 3));
}

#[test]
fn test_zero_lambda_delta_has_no_sparsity_term() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut model =
        HierarchicalPcn::new_with_rng(&config(&[4, 5, 6], Nonlinearity::Tanh, 0.1), &mut rng)
            .unwrap();
    let input = random_batch(3, 6, 7);
    let mask = Array2::zeros((3, 6));

    let mut state = model.initialize();
    model.set_nodes(&mut state, &input).unwrap();
    for _ in 0..3 {
        model.update_val_nodes(&mut state, &mask, false).unwrap();
    }

    let net = &model.net;
    let manual = -&state.errs[0]
        + &(net.nonlin.derivative(&state.val_nodes[0])
            * state.errs[1].dot(&net.layers[0].weight.value));
    let delta = model.layer_delta(&state, 0).unwrap();
    for (a, b) in delta.iter().zip(manual.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
    }

    // With λ > 0 only layer 0 changes, by exactly -λ·sign(x_0).
    let hidden_delta = model.layer_delta(&state, 1).unwrap();
    model.net.lamb = 0.3;
    let sparse_delta = model.layer_delta(&state, 0).unwrap();
    for ((s, d), v) in sparse_delta
        .iter()
        .zip(delta.iter())
        .zip(state.val_nodes[0].iter())
    {
        let expected = -0.3 * sign(*v);
        assert_abs_diff_eq!(s - d, expected, epsilon = 1e-6);
    }
    assert_eq!(model.layer_delta(&state, 1).unwrap(), hidden_delta);
}

#[test]
fn test_no_delta_for_sensory_layer() {
    let mut rng = StdRng::seed_from_u64(8);
    let model =
        HierarchicalPcn::new_with_rng(&config(&[2, 3], Nonlinearity::Tanh, 0.1), &mut rng).unwrap();
    let mut state = model.initialize();
    model.set_nodes(&mut state, &Array2::zeros((1, 3))).unwrap();
    assert!(matches!(
        model.layer_delta(&state, 1),
        Err(PcnError::InvalidConfig(_))
    ));
}

/// Two layers, identity, no bias, no relaxation:
/// ```text
/// x_0 = m = [1, 2]        pred_1 = x_0 Wᵀ = [-1.5, 2.5]
/// ε_1 = X - pred_1 = [[2.5, -2.5], [1.5, -1.5], [3.5, -3.5]]
/// grad W = -ε_1ᵀ x_0 = [[-7.5, -15], [7.5, 15]]
/// ```
#[test]
fn test_weight_gradient_hand_example() {
    let mut rng = StdRng::seed_from_u64(9);
    let mut model =
        HierarchicalPcn::new_with_rng(&config(&[2, 2], Nonlinearity::Identity, 0.1), &mut rng)
            .unwrap();
    model.net.layers[0].weight.value = arr2(&[[0.5, -1.0], [2.0, 0.25]]);
    model.net.memory.value = arr1(&[1.0, 2.0]);

    let input = arr2(&[[1.0, 0.0], [0.0, 1.0], [2.0, -1.0]]);
    let state = model
        .train_pc_generative(&input, 0, &Array2::zeros((3, 2)))
        .unwrap();

    assert_eq!(state.errs[1], arr2(&[[2.5, -2.5], [1.5, -1.5], [3.5, -3.5]]));
    let grad_w = model.net.layers[0].weight.grad.as_ref().unwrap();
    let expected = arr2(&[[-7.5, -15.0], [7.5, 15.0]]);
    for (g, e) in grad_w.iter().zip(expected.iter()) {
        assert_abs_diff_eq!(*g, *e, epsilon = 1e-5);
    }
    // x_0 starts at the memory, so ε_0 = 0 and the memory gradient vanishes.
    let grad_m = model.net.memory.grad.as_ref().unwrap();
    assert!(grad_m.iter().all(|&g| g == 0.0));
}

/// E(W, b, m) = 0.5 Σ ε², with value nodes held at their relaxed state.
fn energy_f64(
    val_nodes: &[Array2<f32>],
    memory: &[f64],
    weight: &Array2<f64>,
    bias: &[f64],
) -> f64 {
    let x0 = val_nodes[0].mapv(f64::from);
    let x1 = val_nodes[1].mapv(f64::from);
    let mut energy = 0.0;
    for (row0, row1) in x0.axis_iter(Axis(0)).zip(x1.axis_iter(Axis(0))) {
        for j in 0..row0.len() {
            let e = row0[j] - memory[j];
            energy += 0.5 * e * e;
        }
        for i in 0..row1.len() {
            let pred: f64 = (0..row0.len()).map(|j| weight[[i, j]] * row0[j]).sum::<f64>() + bias[i];
            let e = row1[i] - pred;
            energy += 0.5 * e * e;
        }
    }
    energy
}

#[test]
fn test_gradients_match_finite_differences() {
    let mut rng = StdRng::seed_from_u64(10);
    let cfg = ModelConfig {
        use_bias: true,
        ..config(&[3, 4], Nonlinearity::Identity, 0.1)
    };
    let mut model = HierarchicalPcn::new_with_rng(&cfg, &mut rng).unwrap();
    let input = random_batch(5, 4, 10);
    let state = model
        .train_pc_generative(&input, 5, &Array2::zeros((5, 4)))
        .unwrap();

    let weight = model.net.layers[0].weight.value.mapv(f64::from);
    let bias: Vec<f64> = model.net.layers[0]
        .bias
        .as_ref()
        .unwrap()
        .value
        .iter()
        .map(|&b| f64::from(b))
        .collect();
    let memory: Vec<f64> = model.net.memory.value.iter().map(|&m| f64::from(m)).collect();
    let h = 1e-4;

    let grad_w = model.net.layers[0].weight.grad.as_ref().unwrap();
    for i in 0..4 {
        for j in 0..3 {
            let mut plus = weight.clone();
            plus[[i, j]] += h;
            let mut minus = weight.clone();
            minus[[i, j]] -= h;
            let numeric = (energy_f64(&state.val_nodes, &memory, &plus, &bias)
                - energy_f64(&state.val_nodes, &memory, &minus, &bias))
                / (2.0 * h);
            assert_abs_diff_eq!(f64::from(grad_w[[i, j]]), numeric, epsilon = 1e-3);
        }
    }

    let grad_b = model.net.layers[0].bias.as_ref().unwrap().grad.as_ref().unwrap();
    for i in 0..4 {
        let mut plus = bias.clone();
        plus[i] += h;
        let mut minus = bias.clone();
        minus[i] -= h;
        let numeric = (energy_f64(&state.val_nodes, &memory, &weight, &plus)
            - energy_f64(&state.val_nodes, &memory, &weight, &minus))
            / (2.0 * h);
        assert_abs_diff_eq!(f64::from(grad_b[i]), numeric, epsilon = 1e-3);
    }

    let grad_m = model.net.memory.grad.as_ref().unwrap();
    for j in 0..3 {
        let mut plus = memory.clone();
        plus[j] += h;
        let mut minus = memory.clone();
        minus[j] -= h;
        let numeric = (energy_f64(&state.val_nodes, &plus, &weight, &bias)
            - energy_f64(&state.val_nodes, &minus, &weight, &bias))
            / (2.0 * h);
        assert_abs_diff_eq!(f64::from(grad_m[j]), numeric, epsilon = 1e-3);
    }
}

#[test]
fn test_forward_generates_from_memory() {
    let mut rng = StdRng::seed_from_u64(11);
    let mut model =
        HierarchicalPcn::new_with_rng(&config(&[2, 3], Nonlinearity::Identity, 0.1), &mut rng)
            .unwrap();
    model.net.layers[0].weight.value = arr2(&[[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]]);
    model.net.memory.value = arr1(&[0.5, -2.0]);
    assert_eq!(model.forward().unwrap(), arr1(&[0.5, -2.0, -1.5]));
}

#[test]
fn test_operations_before_set_nodes_fail() {
    let mut rng = StdRng::seed_from_u64(12);
    let mut model =
        HierarchicalPcn::new_with_rng(&config(&[2, 3], Nonlinearity::Tanh, 0.1), &mut rng).unwrap();
    let mut state = model.initialize();
    let mask = Array2::zeros((1, 3));

    assert!(matches!(
        model.update_val_nodes(&mut state, &mask, false),
        Err(PcnError::Uninitialized(_))
    ));
    assert!(matches!(
        model.update_err_nodes(&mut state),
        Err(PcnError::Uninitialized(_))
    ));
    assert!(matches!(
        model.update_grads(&state),
        Err(PcnError::Uninitialized(_))
    ));
    assert!(model.net.memory.grad.is_none());
}

#[test]
fn test_shape_errors() {
    let mut rng = StdRng::seed_from_u64(13);
    let mut model =
        HierarchicalPcn::new_with_rng(&config(&[2, 3], Nonlinearity::Tanh, 0.1), &mut rng).unwrap();

    // Wrong sensory width.
    let result = model.train_pc_generative(&Array2::zeros((4, 2)), 1, &Array2::zeros((4, 2)));
    assert!(matches!(result, Err(PcnError::ShapeMismatch(_))));

    // Mask does not match the batch.
    let result = model.test_pc_generative(
        &Array2::zeros((4, 3)),
        1,
        &Array2::zeros((1, 3)),
        Readout::SensoryValues,
    );
    assert!(matches!(result, Err(PcnError::ShapeMismatch(_))));

    // Empty batch.
    let result = model.train_pc_generative(&Array2::zeros((0, 3)), 1, &Array2::zeros((0, 3)));
    assert!(matches!(result, Err(PcnError::ShapeMismatch(_))));

    // State built for a different depth.
    let other =
        HierarchicalPcn::new_with_rng(&config(&[2, 3, 3], Nonlinearity::Tanh, 0.1), &mut rng)
            .unwrap();
    let mut state = other.initialize();
    assert!(matches!(
        model.set_nodes(&mut state, &Array2::zeros((1, 3))),
        Err(PcnError::ShapeMismatch(_))
    ));
}

/// A state relaxed by one network cannot be driven by another network of the
/// same depth and sensory width.
#[test]
fn test_foreign_state_is_shape_error() {
    let mut rng = StdRng::seed_from_u64(14);
    let a = HierarchicalPcn::new_with_rng(&config(&[2, 3, 4], Nonlinearity::Tanh, 0.1), &mut rng)
        .unwrap();
    let mut b =
        HierarchicalPcn::new_with_rng(&config(&[5, 6, 4], Nonlinearity::Tanh, 0.1), &mut rng)
            .unwrap();
    let hybrid =
        HybridPcn::new_with_rng(&config(&[5, 6, 4], Nonlinearity::Tanh, 0.1), &mut rng).unwrap();

    let mut state = a.initialize();
    a.set_nodes(&mut state, &random_batch(1, 4, 14)).unwrap();
    let mask = Array2::zeros((1, 4));

    assert!(matches!(
        b.update_val_nodes(&mut state, &mask, false),
        Err(PcnError::ShapeMismatch(_))
    ));
    assert!(matches!(
        b.update_err_nodes(&mut state),
        Err(PcnError::ShapeMismatch(_))
    ));
    assert!(matches!(
        hybrid.update_err_nodes(&mut state),
        Err(PcnError::ShapeMismatch(_))
    ));
    assert!(matches!(
        b.layer_delta(&state, 0),
        Err(PcnError::ShapeMismatch(_))
    ));
    assert!(matches!(b.update_grads(&state), Err(PcnError::ShapeMismatch(_))));
    assert!(b.net.memory.grad.is_none());

    // The owning network still accepts it.
    a.update_val_nodes(&mut state, &mask, false).unwrap();
}

#[test]
fn test_edited_error_buffer_is_shape_error() {
    let mut rng = StdRng::seed_from_u64(15);
    let model =
        HierarchicalPcn::new_with_rng(&config(&[2, 3, 4], Nonlinearity::Tanh, 0.1), &mut rng)
            .unwrap();
    let mut state = model.initialize();
    model.set_nodes(&mut state, &random_batch(2, 4, 15)).unwrap();
    state.errs[1] = Array2::zeros((2, 7));

    assert!(matches!(
        model.update_val_nodes(&mut state, &Array2::zeros((2, 4)), false),
        Err(PcnError::ShapeMismatch(_))
    ));
}
