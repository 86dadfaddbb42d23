// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of BraidTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use bt_nn::{Gelu, Linear, Module, Relu, Residual, Sequential, Tensor, TensorError};

const TOLERANCE: f32 = 1e-5;

/// Builds a biased linear layer from a seed so tests can construct the same
/// layer twice: once inside a graph and once for the manual composition.
fn seeded_linear(name: &str, input_dim: usize, output_dim: usize, seed: u64) -> Linear {
    let weight = Tensor::random_uniform(input_dim, output_dim, -0.5, 0.5, Some(seed)).unwrap();
    let bias = Tensor::random_uniform(1, output_dim, -0.25, 0.25, Some(seed ^ 0xa5)).unwrap();
    Linear::from_weights(name, weight, Some(bias)).unwrap()
}

fn seeded_input(rows: usize, cols: usize, seed: u64) -> Tensor {
    Tensor::random_uniform(rows, cols, -1.0, 1.0, Some(seed)).unwrap()
}

#[test]
fn no_shortcut_graph_matches_sequential_composition() {
    let mut graph = Residual::new();
    graph.push(seeded_linear("l1", 4, 6, 11));
    graph.push(Relu::new());
    graph.push(seeded_linear("l2", 6, 3, 12));

    let mut chain = Sequential::new();
    chain.push(seeded_linear("l1", 4, 6, 11));
    chain.push(Relu::new());
    chain.push(seeded_linear("l2", 6, 3, 12));

    let input = seeded_input(5, 4, 13);
    assert_eq!(graph.forward(&input).unwrap(), chain.forward(&input).unwrap());
}

#[test]
fn shortcut_into_interior_position() {
    let a = seeded_linear("a", 3, 4, 21);
    let b = seeded_linear("b", 4, 4, 22);
    let relu = Relu::new();

    let mut graph = Residual::new();
    graph.push(seeded_linear("a", 3, 4, 21));
    graph.push(seeded_linear("b", 4, 4, 22));
    graph.push(Relu::new());
    graph.add_shortcut(1, 3).unwrap();

    let input = seeded_input(2, 3, 23);
    let out_a = a.forward(&input).unwrap();
    let out_b = b.forward(&out_a).unwrap();
    let expected = relu.forward(&out_b.add(&out_a).unwrap()).unwrap();

    assert!(graph.forward(&input).unwrap().allclose(&expected, TOLERANCE));
}

#[test]
fn multiple_shortcuts_into_the_terminal_position() {
    let a = seeded_linear("a", 3, 4, 31);
    let b = seeded_linear("b", 4, 4, 32);
    let relu = Relu::new();

    let mut graph = Residual::new();
    graph.push(seeded_linear("a", 3, 4, 31));
    graph.push(seeded_linear("b", 4, 4, 32));
    graph.push(Relu::new());
    graph.add_shortcut(1, 4).unwrap();
    graph.add_shortcut(1, 3).unwrap();
    graph.add_shortcut(2, 4).unwrap();

    let input = seeded_input(2, 3, 33);
    let out_a = a.forward(&input).unwrap();
    let out_b = b.forward(&out_a).unwrap();
    let out_relu = relu.forward(&out_b.add(&out_a).unwrap()).unwrap();
    let expected = out_relu.add(&out_a).unwrap().add(&out_b).unwrap();

    assert!(graph.forward(&input).unwrap().allclose(&expected, TOLERANCE));
}

#[test]
fn projected_shortcut_feeds_the_transformed_source() {
    let l1 = seeded_linear("l1", 2, 3, 41);
    let l2 = seeded_linear("l2", 3, 3, 42);
    let projection = seeded_linear("proj", 2, 3, 43);

    let mut graph = Residual::new();
    graph.push(seeded_linear("l1", 2, 3, 41));
    graph.push(seeded_linear("l2", 3, 3, 42));
    graph
        .add_projected_shortcut(0, 2, seeded_linear("proj", 2, 3, 43))
        .unwrap();

    let input = seeded_input(4, 2, 44);
    let expected = l2
        .forward(
            &l1.forward(&input)
                .unwrap()
                .add(&projection.forward(&input).unwrap())
                .unwrap(),
        )
        .unwrap();

    assert!(graph.forward(&input).unwrap().allclose(&expected, TOLERANCE));
}

/// Six-layer braid with three scale edges and both projected and identity
/// shortcuts, checked against the fully spelled-out composition.
#[test]
fn full_braid_matches_manual_composition() {
    let lin_scale = 0.3f32;
    let proj1_scale = 0.24f32;
    let proj2_scale = 0.5f32;

    let l1 = seeded_linear("l1", 12, 8, 51);
    let r1 = Relu::new();
    let l2 = seeded_linear("l2", 8, 4, 52);
    let r2 = Relu::new();
    let l3 = seeded_linear("l3", 4, 4, 53);
    let r3 = Relu::new();
    let proj1 = seeded_linear("proj1", 8, 4, 54);
    let proj2 = seeded_linear("proj2", 12, 4, 55);

    let mut graph = Residual::new();
    graph.push(seeded_linear("l1", 12, 8, 51));
    graph.push(Relu::new());
    graph.push(seeded_linear("l2", 8, 4, 52));
    graph.add_scale(3, lin_scale).unwrap();
    graph.push(Relu::new());
    graph
        .add_projected_shortcut(1, 4, seeded_linear("proj1", 8, 4, 54))
        .unwrap();
    graph.add_scale(4, proj1_scale).unwrap();
    graph.push(seeded_linear("l3", 4, 4, 53));
    graph
        .add_projected_shortcut(0, 5, seeded_linear("proj2", 12, 4, 55))
        .unwrap();
    graph.add_scale(5, proj2_scale).unwrap();
    graph.push(Relu::new());
    graph.add_shortcut(5, 7).unwrap();

    let input = seeded_input(3, 12, 56);
    let out1 = l1.forward(&input).unwrap();
    let mut expected = r1.forward(&out1).unwrap();
    expected = l2.forward(&expected.scale(lin_scale).unwrap()).unwrap();
    expected = r2
        .forward(
            &expected
                .add(&proj1.forward(&out1).unwrap())
                .unwrap()
                .scale(proj1_scale)
                .unwrap(),
        )
        .unwrap();
    expected = expected
        .add(&proj2.forward(&input).unwrap())
        .unwrap()
        .scale(proj2_scale)
        .unwrap();
    let out5 = l3.forward(&expected).unwrap();
    let expected = r3.forward(&out5).unwrap().add(&out5).unwrap();

    assert!(graph.forward(&input).unwrap().allclose(&expected, TOLERANCE));
}

#[test]
fn scale_applies_before_the_layer_not_after() {
    let factor = 0.3f32;
    let layer = seeded_linear("l", 2, 2, 61);

    let mut graph = Residual::new();
    graph.push(seeded_linear("l", 2, 2, 61));
    graph.add_scale(1, factor).unwrap();

    let input = seeded_input(3, 2, 62);
    let scaled_first = layer.forward(&input.scale(factor).unwrap()).unwrap();
    let scaled_last = layer.forward(&input).unwrap().scale(factor).unwrap();

    let output = graph.forward(&input).unwrap();
    assert!(output.allclose(&scaled_first, TOLERANCE));
    // The bias term makes the two orders genuinely different.
    assert!(!output.allclose(&scaled_last, TOLERANCE));
}

#[test]
fn terminal_scale_rescales_the_final_output() {
    let layer = seeded_linear("l", 3, 3, 71);

    let mut graph = Residual::new();
    graph.push(seeded_linear("l", 3, 3, 71));
    graph.add_scale(2, 2.0).unwrap();

    let input = seeded_input(2, 3, 72);
    let expected = layer.forward(&input).unwrap().scale(2.0).unwrap();
    assert!(graph.forward(&input).unwrap().allclose(&expected, TOLERANCE));
}

#[test]
fn failed_registrations_leave_the_graph_unchanged() {
    let mut graph = Residual::new();
    graph.push(seeded_linear("a", 3, 4, 81));
    graph.push(seeded_linear("b", 4, 4, 82));
    graph.push(Relu::new());
    graph.add_shortcut(1, 3).unwrap();

    let input = seeded_input(2, 3, 83);
    let before = graph.forward(&input).unwrap();

    assert!(matches!(
        graph.add_shortcut(3, 2),
        Err(TensorError::InvalidTopology { .. })
    ));
    assert!(matches!(
        graph.add_shortcut(2, 2),
        Err(TensorError::InvalidTopology { .. })
    ));
    assert!(matches!(
        graph.add_scale(0, 0.5),
        Err(TensorError::InvalidTopology { .. })
    ));
    assert!(matches!(
        graph.add_scale(9, 0.5),
        Err(TensorError::InvalidTopology { .. })
    ));

    let after = graph.forward(&input).unwrap();
    assert_eq!(before, after);
}

#[test]
fn repeated_forwards_are_bit_identical() {
    let mut graph = Residual::new();
    graph.push(seeded_linear("l1", 4, 4, 91));
    graph.push(Relu::new());
    graph.push(seeded_linear("l2", 4, 4, 92));
    graph
        .add_projected_shortcut(0, 3, seeded_linear("proj", 4, 4, 93))
        .unwrap();
    graph.add_scale(3, 0.8).unwrap();
    graph.add_shortcut(1, 4).unwrap();

    let input = seeded_input(3, 4, 94);
    let first = graph.forward(&input).unwrap();
    let second = graph.forward(&input).unwrap();
    assert_eq!(first, second);
}

/// Central finite differences over every input element validate the reverse
/// walk through summation, projection, and scale edges. GELU keeps the
/// backbone smooth so the numeric estimate is trustworthy.
#[test]
fn backward_matches_numeric_gradients_through_the_braid() {
    let build = || {
        let mut graph = Residual::new();
        graph.push(seeded_linear("body", 3, 4, 101));
        graph.push(Gelu::new());
        graph
            .add_projected_shortcut(0, 2, seeded_linear("proj", 3, 4, 102))
            .unwrap();
        graph.add_scale(2, 0.7).unwrap();
        graph.add_shortcut(1, 3).unwrap();
        graph.add_scale(3, 1.3).unwrap();
        graph
    };

    let input = seeded_input(2, 3, 103);
    let output_shape = build().forward(&input).unwrap().shape();
    let grad_output = Tensor::from_fn(output_shape.0, output_shape.1, |r, c| {
        ((r * 5 + c) as f32 * 0.23).sin()
    })
    .unwrap();

    let mut graph = build();
    let grad_input = graph.backward(&input, &grad_output).unwrap();
    assert_eq!(grad_input.shape(), input.shape());

    let eps = 1e-2f32;
    let base = input.data().to_vec();
    for idx in 0..base.len() {
        let mut plus = base.clone();
        plus[idx] += eps;
        let mut minus = base.clone();
        minus[idx] -= eps;
        let loss = |data: Vec<f32>| {
            let tensor = Tensor::from_vec(2, 3, data).unwrap();
            let output = build().forward(&tensor).unwrap();
            output
                .data()
                .iter()
                .zip(grad_output.data())
                .map(|(o, g)| o * g)
                .sum::<f32>()
        };
        let numeric = (loss(plus) - loss(minus)) / (2.0 * eps);
        assert!(
            (grad_input.data()[idx] - numeric).abs() < 1e-2,
            "gradient mismatch at {idx}: analytic {} vs numeric {numeric}",
            grad_input.data()[idx]
        );
    }
}

/// Gradients also reach the projection's parameters: one descent step on the
/// braid must change the forward output.
#[test]
fn training_step_moves_every_parameter() {
    let mut graph = Residual::new();
    graph.push(seeded_linear("body", 3, 3, 111));
    graph.push(Gelu::new());
    graph
        .add_projected_shortcut(0, 3, seeded_linear("proj", 3, 3, 112))
        .unwrap();

    let input = seeded_input(2, 3, 113);
    let before = graph.forward(&input).unwrap();
    let grad_output = Tensor::from_fn(2, 3, |r, c| 0.5 + (r + c) as f32 * 0.1).unwrap();
    let _ = graph.backward(&input, &grad_output).unwrap();

    let mut touched = 0usize;
    graph
        .visit_parameters(&mut |param| {
            if let Some(grad) = param.gradient() {
                if grad.squared_l2_norm() > 0.0 {
                    touched += 1;
                }
            }
            Ok(())
        })
        .unwrap();
    // body weight + bias and projection weight + bias all received gradient.
    assert_eq!(touched, 4);

    graph.apply_step(0.1).unwrap();
    let after = graph.forward(&input).unwrap();
    assert_ne!(before, after);
}
