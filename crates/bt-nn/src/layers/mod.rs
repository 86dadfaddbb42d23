// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of BraidTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

pub mod activation;
pub mod conv;
pub mod embedding;
pub mod gelu;
pub mod linear;
pub mod normalization;
pub mod residual;
pub mod sequential;

pub use activation::Relu;
pub use conv::Conv1d;
pub use embedding::PositionEmbedding;
pub use gelu::Gelu;
pub use linear::Linear;
pub use normalization::{BatchNorm1d, LayerNorm};
pub use residual::Residual;
pub use sequential::Sequential;
