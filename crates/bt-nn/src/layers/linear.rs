// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of BraidTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};

/// Fully connected layer `y = x W (+ b)` with an optional bias row.
#[derive(Debug)]
pub struct Linear {
    weight: Parameter,
    bias: Option<Parameter>,
}

impl Linear {
    /// Creates a new biased linear layer with deterministic small parameters.
    pub fn new(name: impl Into<String>, input_dim: usize, output_dim: usize) -> PureResult<Self> {
        let name = name.into();
        let weight = Self::default_weight(input_dim, output_dim)?;
        let bias = Tensor::zeros(1, output_dim)?;
        Self::from_weights(name, weight, Some(bias))
    }

    /// Creates a linear layer without a bias term.
    pub fn without_bias(
        name: impl Into<String>,
        input_dim: usize,
        output_dim: usize,
    ) -> PureResult<Self> {
        let weight = Self::default_weight(input_dim, output_dim)?;
        Self::from_weights(name, weight, None)
    }

    /// Constructs a layer from explicit weight and bias tensors.
    ///
    /// The weight is `(input_dim, output_dim)`; the bias, when present, must
    /// be a single row of `output_dim` values.
    pub fn from_weights(
        name: impl Into<String>,
        weight: Tensor,
        bias: Option<Tensor>,
    ) -> PureResult<Self> {
        let name = name.into();
        let output_dim = weight.shape().1;
        if let Some(bias) = &bias {
            if bias.shape() != (1, output_dim) {
                return Err(TensorError::ShapeMismatch {
                    left: bias.shape(),
                    right: (1, output_dim),
                });
            }
        }
        Ok(Self {
            weight: Parameter::new(format!("{name}::weight"), weight),
            bias: bias.map(|bias| Parameter::new(format!("{name}::bias"), bias)),
        })
    }

    fn default_weight(input_dim: usize, output_dim: usize) -> PureResult<Tensor> {
        if input_dim == 0 || output_dim == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: input_dim,
                cols: output_dim,
            });
        }
        // Low-discrepancy ramp inside the Xavier bound keeps fresh layers
        // reproducible without threading an RNG through every constructor.
        let limit = (6.0 / (input_dim + output_dim) as f32).sqrt();
        Tensor::from_fn(input_dim, output_dim, |r, c| {
            let idx = (r * output_dim + c) as f32;
            limit * (2.0 * (idx * 0.618_034).fract() - 1.0)
        })
    }

    /// Returns a reference to the weight parameter.
    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    /// Returns the bias parameter when the layer carries one.
    pub fn bias(&self) -> Option<&Parameter> {
        self.bias.as_ref()
    }
}

impl Module for Linear {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        if input.shape().1 != self.weight.value().shape().0 {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: self.weight.value().shape(),
            });
        }
        let mut out = input.matmul(self.weight.value())?;
        if let Some(bias) = &self.bias {
            out.add_row_inplace(bias.value().data())?;
        }
        Ok(out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        if input.shape().0 != grad_output.shape().0 {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        let batch = input.shape().0 as f32;
        let grad_weight = input.transpose().matmul(grad_output)?.scale(1.0 / batch)?;
        self.weight.accumulate(&grad_weight)?;

        if let Some(bias) = self.bias.as_mut() {
            let summed = grad_output.sum_axis0();
            let grad_bias = Tensor::from_vec(1, summed.len(), summed)?.scale(1.0 / batch)?;
            bias.accumulate(&grad_bias)?;
        }

        let weight_t = self.weight.value().transpose();
        grad_output.matmul(&weight_t)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        if let Some(bias) = &self.bias {
            visitor(bias)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        if let Some(bias) = self.bias.as_mut() {
            visitor(bias)?;
        }
        Ok(())
    }
}
