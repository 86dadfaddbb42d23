// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of BraidTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};

fn validate_positive(value: usize) -> PureResult<()> {
    if value == 0 {
        return Err(TensorError::InvalidDimensions {
            rows: 1,
            cols: value,
        });
    }
    Ok(())
}

fn dilated_extent(size: usize, dilation: usize) -> PureResult<usize> {
    size.checked_sub(1)
        .and_then(|value| value.checked_mul(dilation))
        .and_then(|value| value.checked_add(1))
        .ok_or(TensorError::InvalidDimensions {
            rows: size,
            cols: dilation,
        })
}

/// One-dimensional convolution over `(batch, channels * width)` rows with
/// independent left/right zero padding.
///
/// Symmetric padding gives the usual centered convolution; the asymmetric
/// constructors shift the receptive field so a position only sees the past
/// (`causal`) or only the future (`anticausal`) while preserving the input
/// width at stride one.
#[derive(Debug)]
pub struct Conv1d {
    weight: Parameter,
    bias: Parameter,
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    stride: usize,
    padding_left: usize,
    padding_right: usize,
    dilation: usize,
}

impl Conv1d {
    /// Creates a convolution with symmetric padding.
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        dilation: usize,
    ) -> PureResult<Self> {
        Self::asymmetric(
            name,
            in_channels,
            out_channels,
            kernel_size,
            stride,
            padding,
            padding,
            dilation,
        )
    }

    /// Creates a convolution with explicit left/right padding.
    #[allow(clippy::too_many_arguments)]
    pub fn asymmetric(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding_left: usize,
        padding_right: usize,
        dilation: usize,
    ) -> PureResult<Self> {
        validate_positive(in_channels)?;
        validate_positive(out_channels)?;
        validate_positive(kernel_size)?;
        validate_positive(stride)?;
        validate_positive(dilation)?;
        let name = name.into();
        let span = in_channels * kernel_size;
        let limit = (1.0 / span as f32).sqrt();
        let weight = Tensor::from_fn(out_channels, span, |r, c| {
            let idx = (r * span + c) as f32;
            limit * (2.0 * (idx * 0.618_034).fract() - 1.0)
        })?;
        let bias = Tensor::zeros(1, out_channels)?;
        Ok(Self {
            weight: Parameter::new(format!("{name}::weight"), weight),
            bias: Parameter::new(format!("{name}::bias"), bias),
            in_channels,
            out_channels,
            kernel_size,
            stride,
            padding_left,
            padding_right,
            dilation,
        })
    }

    /// Convolution whose output at a position depends only on that position
    /// and earlier ones. Width-preserving at stride one.
    pub fn causal(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        dilation: usize,
    ) -> PureResult<Self> {
        let reach = dilated_extent(kernel_size, dilation)? - 1;
        Self::asymmetric(
            name,
            in_channels,
            out_channels,
            kernel_size,
            stride,
            reach,
            0,
            dilation,
        )
    }

    /// Mirror of [`Conv1d::causal`]: a position only sees itself and later ones.
    pub fn anticausal(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        dilation: usize,
    ) -> PureResult<Self> {
        let reach = dilated_extent(kernel_size, dilation)? - 1;
        Self::asymmetric(
            name,
            in_channels,
            out_channels,
            kernel_size,
            stride,
            0,
            reach,
            dilation,
        )
    }

    /// Returns a reference to the kernel parameter, shaped
    /// `(out_channels, in_channels * kernel_size)`.
    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    /// Returns a reference to the bias parameter.
    pub fn bias(&self) -> &Parameter {
        &self.bias
    }

    fn infer_width(&self, cols: usize) -> PureResult<usize> {
        if cols % self.in_channels != 0 {
            return Err(TensorError::ShapeMismatch {
                left: (1, cols),
                right: (1, self.in_channels),
            });
        }
        Ok(cols / self.in_channels)
    }

    fn output_width(&self, input_width: usize) -> PureResult<usize> {
        let padded = input_width + self.padding_left + self.padding_right;
        let extent = dilated_extent(self.kernel_size, self.dilation)?;
        if padded < extent {
            return Err(TensorError::InvalidDimensions {
                rows: input_width,
                cols: extent,
            });
        }
        Ok((padded - extent) / self.stride + 1)
    }
}

impl Module for Conv1d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = input.shape();
        let width = self.infer_width(cols)?;
        let out_width = self.output_width(width)?;
        let mut out = Tensor::zeros(batch, self.out_channels * out_width)?;
        let weight = self.weight.value();
        let weight_data = weight.data();
        let bias_data = self.bias.value().data();
        let span = self.in_channels * self.kernel_size;
        let out_cols = out.shape().1;
        {
            let out_data = out.data_mut();
            for b in 0..batch {
                let row = &input.data()[b * cols..(b + 1) * cols];
                let out_row = &mut out_data[b * out_cols..(b + 1) * out_cols];
                for oc in 0..self.out_channels {
                    let weight_row = &weight_data[oc * span..(oc + 1) * span];
                    let bias = bias_data[oc];
                    for ow in 0..out_width {
                        let mut acc = bias;
                        for ic in 0..self.in_channels {
                            let channel_offset = ic * width;
                            for k in 0..self.kernel_size {
                                let pos = ow * self.stride + k * self.dilation;
                                if pos < self.padding_left {
                                    continue;
                                }
                                let idx = pos - self.padding_left;
                                if idx >= width {
                                    continue;
                                }
                                let weight_idx = ic * self.kernel_size + k;
                                acc += row[channel_offset + idx] * weight_row[weight_idx];
                            }
                        }
                        out_row[oc * out_width + ow] = acc;
                    }
                }
            }
        }
        Ok(out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = input.shape();
        let width = self.infer_width(cols)?;
        let out_width = self.output_width(width)?;
        if grad_output.shape() != (batch, self.out_channels * out_width) {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: (batch, self.out_channels * out_width),
            });
        }
        let span = self.in_channels * self.kernel_size;
        let mut grad_weight = Tensor::zeros(self.out_channels, span)?;
        let mut grad_bias = vec![0.0f32; self.out_channels];
        let mut grad_input = Tensor::zeros(batch, cols)?;
        let weight = self.weight.value();
        let weight_data = weight.data();
        let grad_out_cols = grad_output.shape().1;
        {
            let grad_weight_data = grad_weight.data_mut();
            let grad_input_data = grad_input.data_mut();
            for b in 0..batch {
                let row = &input.data()[b * cols..(b + 1) * cols];
                let grad_row = &grad_output.data()[b * grad_out_cols..(b + 1) * grad_out_cols];
                let grad_in_row = &mut grad_input_data[b * cols..(b + 1) * cols];
                for oc in 0..self.out_channels {
                    let weight_row = &weight_data[oc * span..(oc + 1) * span];
                    for ow in 0..out_width {
                        let go = grad_row[oc * out_width + ow];
                        grad_bias[oc] += go;
                        for ic in 0..self.in_channels {
                            let channel_offset = ic * width;
                            for k in 0..self.kernel_size {
                                let pos = ow * self.stride + k * self.dilation;
                                if pos < self.padding_left {
                                    continue;
                                }
                                let idx = pos - self.padding_left;
                                if idx >= width {
                                    continue;
                                }
                                let weight_idx = ic * self.kernel_size + k;
                                grad_weight_data[oc * span + weight_idx] +=
                                    go * row[channel_offset + idx];
                                grad_in_row[channel_offset + idx] += go * weight_row[weight_idx];
                            }
                        }
                    }
                }
            }
        }
        let inv_batch = 1.0 / batch as f32;
        let grad_weight = grad_weight.scale(inv_batch)?;
        let grad_bias = Tensor::from_vec(1, self.out_channels, grad_bias)?.scale(inv_batch)?;
        self.weight.accumulate(&grad_weight)?;
        self.bias.accumulate(&grad_bias)?;
        Ok(grad_input)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        visitor(&self.bias)?;
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        visitor(&mut self.bias)?;
        Ok(())
    }
}
