//! High-level neural module API for BraidTorch.
//!
//! The crate offers a lightweight `nn.Module` style surface kept entirely in
//! Rust. Its centerpiece is [`Residual`], a composition engine that braids a
//! linear backbone of modules with shortcut edges — optionally projected
//! through their own module and rescaled — injecting earlier activations into
//! later accumulation points, including the virtual terminal position that
//! stands for the graph output.

pub mod io;
pub mod layers;
pub mod loss;
pub mod module;

pub use io::{load_bincode, load_json, save_bincode, save_json};
pub use layers::activation::Relu;
pub use layers::conv::Conv1d;
pub use layers::embedding::PositionEmbedding;
pub use layers::gelu::Gelu;
pub use layers::linear::Linear;
pub use layers::normalization::{BatchNorm1d, LayerNorm};
pub use layers::residual::Residual;
pub use layers::sequential::Sequential;
pub use loss::{Loss, MeanSquaredError};
pub use module::{Module, Parameter};

pub use bt_tensor::{PureResult, Tensor, TensorError};
