// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of BraidTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use std::collections::BTreeMap;

/// Extra data-flow edge injecting position `src`'s output into position
/// `dst`'s accumulator, optionally through a projection module.
struct Shortcut {
    src: usize,
    dst: usize,
    projection: Option<Box<dyn Module>>,
}

/// Residual composition engine.
///
/// Positions index the dataflow graph: position 0 is the external input,
/// positions `1..=N` are the outputs of the `N` backbone layers in insertion
/// order, and position `N + 1` is the virtual terminal position standing for
/// the graph output — it never has a layer of its own. Every position
/// `1..=N + 1` owns an accumulator: the previous position's output plus the
/// (optionally projected) output of every shortcut targeting it, summed in
/// registration order. A scale factor registered for a position multiplies
/// that accumulated sum *before* the position's layer runs (or before the
/// terminal value is returned), so the same graph always reproduces the same
/// arithmetic, bit for bit.
///
/// Registrations validate against the backbone length at the time of the
/// call and never mutate the graph on failure; positions are stored as
/// absolute indices, so a shortcut aimed at the terminal position becomes an
/// interior shortcut if more layers are pushed afterwards.
#[derive(Default)]
pub struct Residual {
    layers: Vec<Box<dyn Module>>,
    shortcuts: Vec<Shortcut>,
    scales: BTreeMap<usize, f32>,
}

impl core::fmt::Debug for Residual {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Residual(num_layers={},num_shortcuts={},num_scales={})",
            self.layers.len(),
            self.shortcuts.len(),
            self.scales.len()
        )
    }
}

impl Residual {
    /// Creates an empty graph. With no layers and no edges it behaves as the
    /// identity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a layer as the next backbone position.
    pub fn push<M>(&mut self, layer: M)
    where
        M: Module + 'static,
    {
        self.layers.push(Box::new(layer));
    }

    /// Appends a pre-boxed module as the next backbone position.
    pub fn push_boxed(&mut self, layer: Box<dyn Module>) {
        self.layers.push(layer);
    }

    /// Number of backbone layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Returns `true` when no backbone layer has been pushed yet.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Index of the virtual terminal position for the current backbone.
    pub fn terminal_position(&self) -> usize {
        self.layers.len() + 1
    }

    /// Registers a shortcut summing position `src`'s output into position
    /// `dst`'s accumulator.
    ///
    /// `src` may be 0 (the external input); `dst` may be the current terminal
    /// position. Fails with [`TensorError::InvalidTopology`] when the edge
    /// would not point strictly forward or when `dst` lies beyond the current
    /// terminal position; the graph is left untouched in that case. Because
    /// `src < dst <= N + 1`, a valid source always lies on the backbone or at
    /// the input.
    pub fn add_shortcut(&mut self, src: usize, dst: usize) -> PureResult<()> {
        self.insert_shortcut(src, dst, None)
    }

    /// Registers a shortcut whose source output is transformed by
    /// `projection` before being summed. The projection is a module like any
    /// other: it may carry parameters and participates in gradient flow.
    pub fn add_projected_shortcut<M>(
        &mut self,
        src: usize,
        dst: usize,
        projection: M,
    ) -> PureResult<()>
    where
        M: Module + 'static,
    {
        self.insert_shortcut(src, dst, Some(Box::new(projection)))
    }

    /// Registers or overwrites the scale factor applied to `position`'s
    /// accumulated input. Valid positions are `1..=N + 1`; the terminal
    /// position scales the graph output itself.
    pub fn add_scale(&mut self, position: usize, factor: f32) -> PureResult<()> {
        let terminal = self.terminal_position();
        if position == 0 || position > terminal {
            return Err(TensorError::InvalidTopology {
                label: "scale position",
                position,
                bound: terminal,
            });
        }
        if !factor.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "residual scale factor",
                value: factor,
            });
        }
        self.scales.insert(position, factor);
        Ok(())
    }

    fn insert_shortcut(
        &mut self,
        src: usize,
        dst: usize,
        projection: Option<Box<dyn Module>>,
    ) -> PureResult<()> {
        if dst <= src {
            return Err(TensorError::InvalidTopology {
                label: "shortcut must point forward",
                position: dst,
                bound: src,
            });
        }
        let terminal = self.terminal_position();
        if dst > terminal {
            return Err(TensorError::InvalidTopology {
                label: "shortcut destination",
                position: dst,
                bound: terminal,
            });
        }
        self.shortcuts.push(Shortcut {
            src,
            dst,
            projection,
        });
        Ok(())
    }

    /// Accumulated input of `position`: predecessor output, plus shortcut
    /// contributions in registration order, then the scale factor if any.
    fn accumulate(&self, position: usize, outputs: &[Tensor]) -> PureResult<Tensor> {
        let mut acc = outputs[position - 1].clone();
        for shortcut in &self.shortcuts {
            if shortcut.dst != position {
                continue;
            }
            let source = &outputs[shortcut.src];
            match &shortcut.projection {
                Some(projection) => {
                    let projected = projection.forward(source)?;
                    acc.add_scaled(&projected, 1.0)?;
                }
                None => acc.add_scaled(source, 1.0)?,
            }
        }
        if let Some(&factor) = self.scales.get(&position) {
            acc = acc.scale(factor)?;
        }
        Ok(acc)
    }

    /// Tuple-state counterpart of [`Residual::accumulate`], adding lane by lane.
    fn accumulate_seq(&self, position: usize, states: &[Vec<Tensor>]) -> PureResult<Vec<Tensor>> {
        let mut acc = states[position - 1].clone();
        for shortcut in &self.shortcuts {
            if shortcut.dst != position {
                continue;
            }
            let source = &states[shortcut.src];
            let contribution = match &shortcut.projection {
                Some(projection) => projection.forward_seq(source)?,
                None => source.clone(),
            };
            if contribution.len() != acc.len() {
                return Err(TensorError::DataLength {
                    expected: acc.len(),
                    got: contribution.len(),
                });
            }
            for (lane, extra) in acc.iter_mut().zip(contribution.iter()) {
                lane.add_scaled(extra, 1.0)?;
            }
        }
        if let Some(&factor) = self.scales.get(&position) {
            for lane in acc.iter_mut() {
                *lane = lane.scale(factor)?;
            }
        }
        Ok(acc)
    }

    /// Adds a gradient contribution for position `position`'s accumulator to
    /// the predecessor and to every shortcut source feeding it.
    fn spread_gradient(
        shortcuts: &mut [Shortcut],
        position: usize,
        grad_acc: &Tensor,
        outputs: &[Tensor],
        grads: &mut [Option<Tensor>],
    ) -> PureResult<()> {
        accumulate_gradient(&mut grads[position - 1], grad_acc)?;
        for shortcut in shortcuts.iter_mut() {
            if shortcut.dst != position {
                continue;
            }
            match shortcut.projection.as_mut() {
                Some(projection) => {
                    let through = projection.backward(&outputs[shortcut.src], grad_acc)?;
                    accumulate_gradient(&mut grads[shortcut.src], &through)?;
                }
                None => accumulate_gradient(&mut grads[shortcut.src], grad_acc)?,
            }
        }
        Ok(())
    }
}

fn accumulate_gradient(slot: &mut Option<Tensor>, grad: &Tensor) -> PureResult<()> {
    match slot.as_mut() {
        Some(existing) => existing.add_scaled(grad, 1.0),
        None => {
            *slot = Some(grad.clone());
            Ok(())
        }
    }
}

impl Module for Residual {
    /// Runs one forward pass over the assembled graph.
    ///
    /// Positions are evaluated in strictly increasing order; every edge points
    /// from a lower position to a higher one, so this walk is a valid
    /// topological order by construction. No validation happens here — the
    /// registration calls already rejected inconsistent edges — and layer
    /// failures propagate unchanged.
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let mut outputs = Vec::with_capacity(self.layers.len() + 1);
        outputs.push(input.clone());
        for (idx, layer) in self.layers.iter().enumerate() {
            let fed = self.accumulate(idx + 1, &outputs)?;
            outputs.push(layer.forward(&fed)?);
        }
        self.accumulate(self.terminal_position(), &outputs)
    }

    /// Reverse pass over the same walk.
    ///
    /// Replays the forward pass to recover every position's output and every
    /// layer's (scaled) accumulated input, then pushes gradients from the
    /// terminal position downwards: each accumulator's gradient flows to its
    /// backbone predecessor and through every shortcut (projections propagate
    /// their own parameter gradients on the way), while scale edges multiply
    /// the gradient exactly as they multiplied the activations.
    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let count = self.layers.len();
        let mut outputs = Vec::with_capacity(count + 1);
        outputs.push(input.clone());
        let mut fed = Vec::with_capacity(count);
        for idx in 0..count {
            let acc = self.accumulate(idx + 1, &outputs)?;
            let out = self.layers[idx].forward(&acc)?;
            fed.push(acc);
            outputs.push(out);
        }

        let mut grads: Vec<Option<Tensor>> = Vec::with_capacity(count + 1);
        grads.resize_with(count + 1, || None);

        let terminal = count + 1;
        let mut grad_acc = grad_output.clone();
        if let Some(&factor) = self.scales.get(&terminal) {
            grad_acc = grad_acc.scale(factor)?;
        }
        Self::spread_gradient(&mut self.shortcuts, terminal, &grad_acc, &outputs, &mut grads)?;

        for idx in (0..count).rev() {
            let position = idx + 1;
            let grad_out = grads[position]
                .take()
                .ok_or(TensorError::InvalidValue {
                    label: "residual position without consumers",
                })?;
            let mut grad_acc = self.layers[idx].backward(&fed[idx], &grad_out)?;
            if let Some(&factor) = self.scales.get(&position) {
                grad_acc = grad_acc.scale(factor)?;
            }
            Self::spread_gradient(
                &mut self.shortcuts,
                position,
                &grad_acc,
                &outputs,
                &mut grads,
            )?;
        }

        grads[0].take().ok_or(TensorError::InvalidValue {
            label: "residual position without consumers",
        })
    }

    /// Tuple-state forward pass: per-position state is a sequence of tensors
    /// and shortcut sums happen lane by lane under the same composition rules.
    fn forward_seq(&self, inputs: &[Tensor]) -> PureResult<Vec<Tensor>> {
        if inputs.is_empty() {
            return Err(TensorError::EmptyInput("residual sequence input"));
        }
        let mut states = Vec::with_capacity(self.layers.len() + 1);
        states.push(inputs.to_vec());
        for (idx, layer) in self.layers.iter().enumerate() {
            let fed = self.accumulate_seq(idx + 1, &states)?;
            states.push(layer.forward_seq(&fed)?);
        }
        self.accumulate_seq(self.terminal_position(), &states)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for layer in &self.layers {
            layer.visit_parameters(visitor)?;
        }
        for shortcut in &self.shortcuts {
            if let Some(projection) = &shortcut.projection {
                projection.visit_parameters(visitor)?;
            }
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for layer in &mut self.layers {
            layer.visit_parameters_mut(visitor)?;
        }
        for shortcut in &mut self.shortcuts {
            if let Some(projection) = shortcut.projection.as_mut() {
                projection.visit_parameters_mut(visitor)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::activation::Relu;
    use crate::layers::linear::Linear;

    #[test]
    fn empty_graph_is_identity() {
        let mut graph = Residual::new();
        let input = Tensor::from_vec(1, 3, vec![1.0, -2.0, 0.5]).unwrap();
        assert_eq!(graph.forward(&input).unwrap(), input);

        let grad = Tensor::from_vec(1, 3, vec![0.1, 0.2, 0.3]).unwrap();
        assert_eq!(graph.backward(&input, &grad).unwrap(), grad);
    }

    #[test]
    fn backward_edges_are_rejected() {
        let mut graph = Residual::new();
        graph.push(Relu::new());
        graph.push(Relu::new());
        graph.push(Relu::new());

        assert!(matches!(
            graph.add_shortcut(3, 2),
            Err(TensorError::InvalidTopology { .. })
        ));
        assert!(matches!(
            graph.add_shortcut(2, 2),
            Err(TensorError::InvalidTopology { .. })
        ));
        assert!(matches!(
            graph.add_shortcut(1, 5),
            Err(TensorError::InvalidTopology { .. })
        ));
        graph.add_shortcut(0, 4).unwrap();
    }

    #[test]
    fn scale_positions_are_bounded_and_overwritable() {
        let mut graph = Residual::new();
        graph.push(Relu::new());

        assert!(matches!(
            graph.add_scale(0, 0.5),
            Err(TensorError::InvalidTopology { .. })
        ));
        assert!(matches!(
            graph.add_scale(3, 0.5),
            Err(TensorError::InvalidTopology { .. })
        ));
        assert!(matches!(
            graph.add_scale(1, f32::NAN),
            Err(TensorError::NonFiniteValue { .. })
        ));

        graph.add_scale(2, 0.5).unwrap();
        graph.add_scale(2, 2.0).unwrap();
        let input = Tensor::from_vec(1, 2, vec![1.0, 3.0]).unwrap();
        let output = graph.forward(&input).unwrap();
        assert_eq!(output.data(), &[2.0, 6.0]);
    }

    #[test]
    fn terminal_shortcut_becomes_interior_as_backbone_grows() {
        // Registered while position 2 was the terminal; after another push the
        // edge targets the new layer's accumulator instead.
        let mut graph = Residual::new();
        graph.push(Relu::new());
        graph.add_shortcut(0, 2).unwrap();
        graph.push(Linear::from_weights(
            "scale2",
            Tensor::from_vec(2, 2, vec![2.0, 0.0, 0.0, 2.0]).unwrap(),
            None,
        )
        .unwrap());

        let input = Tensor::from_vec(1, 2, vec![1.0, -1.0]).unwrap();
        // relu(x) + x = [2, -1], then doubled by the linear layer.
        let output = graph.forward(&input).unwrap();
        assert_eq!(output.data(), &[4.0, -2.0]);
    }

    #[test]
    fn projection_parameters_are_visited() {
        let mut graph = Residual::new();
        graph.push(Linear::new("body", 2, 2).unwrap());
        graph
            .add_projected_shortcut(0, 2, Linear::new("proj", 2, 2).unwrap())
            .unwrap();

        let mut names = Vec::new();
        graph
            .visit_parameters(&mut |param| {
                names.push(param.name().to_string());
                Ok(())
            })
            .unwrap();
        assert!(names.iter().any(|name| name.starts_with("body::")));
        assert!(names.iter().any(|name| name.starts_with("proj::")));
    }

    #[test]
    fn forward_seq_threads_every_lane() {
        let mut graph = Residual::new();
        graph.push(Relu::new());
        graph.add_shortcut(0, 2).unwrap();

        let a = Tensor::from_vec(1, 2, vec![1.0, -2.0]).unwrap();
        let b = Tensor::from_vec(1, 2, vec![-0.5, 3.0]).unwrap();
        let lanes = graph.forward_seq(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(lanes.len(), 2);
        assert_eq!(lanes[0], graph.forward(&a).unwrap());
        assert_eq!(lanes[1], graph.forward(&b).unwrap());
    }
}
