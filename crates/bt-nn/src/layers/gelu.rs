// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of BraidTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::Module;
use crate::{PureResult, Tensor, TensorError};

const SQRT_2_OVER_PI: f32 = 0.797_884_6;
const KAPPA: f32 = 0.044715;

/// Gaussian Error Linear Unit using the tanh-based approximation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gelu;

impl Gelu {
    /// Creates a new GELU activation.
    pub fn new() -> Self {
        Self
    }

    fn gelu(value: f32) -> f32 {
        let cubic = value * value * value;
        let inner = SQRT_2_OVER_PI * (value + KAPPA * cubic);
        0.5 * value * (1.0 + inner.tanh())
    }

    fn gelu_derivative(value: f32) -> f32 {
        let cubic = value * value * value;
        let inner = SQRT_2_OVER_PI * (value + KAPPA * cubic);
        let tanh_inner = inner.tanh();
        let sech_sq = 1.0 - tanh_inner * tanh_inner;
        let d_inner = SQRT_2_OVER_PI * (1.0 + 3.0 * KAPPA * value * value);
        0.5 * (1.0 + tanh_inner) + 0.5 * value * sech_sq * d_inner
    }
}

impl Module for Gelu {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let (rows, cols) = input.shape();
        let mut data = Vec::with_capacity(rows * cols);
        for value in input.data() {
            data.push(Self::gelu(*value));
        }
        Tensor::from_vec(rows, cols, data)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        if input.shape() != grad_output.shape() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        let (rows, cols) = input.shape();
        let mut data = Vec::with_capacity(rows * cols);
        for (input_value, grad_value) in input.data().iter().zip(grad_output.data().iter()) {
            data.push(Self::gelu_derivative(*input_value) * grad_value);
        }
        Tensor::from_vec(rows, cols, data)
    }

    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&crate::module::Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut crate::module::Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }
}
