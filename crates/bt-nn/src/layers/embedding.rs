// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of BraidTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};

/// Learnable additive position embedding.
///
/// Holds a `(max_positions, features)` table and adds its first `rows` entries
/// to the input, so row `r` of every forward pass receives the same learned
/// offset.
#[derive(Debug)]
pub struct PositionEmbedding {
    table: Parameter,
    max_positions: usize,
    features: usize,
}

impl PositionEmbedding {
    /// Creates a new embedding table with deterministic small initial values.
    pub fn new(
        name: impl Into<String>,
        max_positions: usize,
        features: usize,
    ) -> PureResult<Self> {
        if max_positions == 0 || features == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: max_positions,
                cols: features,
            });
        }
        let name = name.into();
        let table = Tensor::from_fn(max_positions, features, |r, c| {
            let idx = (r * features + c) as f32;
            0.1 * (2.0 * (idx * 0.618_034).fract() - 1.0)
        })?;
        Ok(Self {
            table: Parameter::new(format!("{name}::table"), table),
            max_positions,
            features,
        })
    }

    /// Maximum number of positions the table covers.
    pub fn max_positions(&self) -> usize {
        self.max_positions
    }

    /// Returns the embedding table parameter.
    pub fn table(&self) -> &Parameter {
        &self.table
    }

    fn guard_input(&self, input: &Tensor) -> PureResult<()> {
        let (rows, cols) = input.shape();
        if cols != self.features {
            return Err(TensorError::ShapeMismatch {
                left: (rows, cols),
                right: (rows, self.features),
            });
        }
        if rows > self.max_positions {
            return Err(TensorError::ShapeMismatch {
                left: (rows, cols),
                right: (self.max_positions, cols),
            });
        }
        Ok(())
    }
}

impl Module for PositionEmbedding {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        let (rows, cols) = input.shape();
        let table = self.table.value().data();
        let mut output = input.clone();
        let data = output.data_mut();
        for (value, offset) in data.iter_mut().zip(table[..rows * cols].iter()) {
            *value += offset;
        }
        Ok(output)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        if input.shape() != grad_output.shape() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        let (rows, cols) = grad_output.shape();
        let mut grad_table = vec![0.0f32; self.max_positions * self.features];
        grad_table[..rows * cols].copy_from_slice(grad_output.data());
        let grad_table = Tensor::from_vec(self.max_positions, self.features, grad_table)?;
        self.table.accumulate(&grad_table)?;
        Ok(grad_output.clone())
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.table)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.table)
    }
}
