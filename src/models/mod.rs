//! Models a checkpoint can resolve to
//!
//! - `MlpHead`: the fixed-topology classifier head rebuilt from a state dict
//! - `ModuleNode` (in `checkpoint`): a full pickled module tree

mod mlp_head;

pub use mlp_head::MlpHead;

use anyhow::Result;
use candle_core::Tensor;

/// A concrete model instance: forward pass plus parameter iteration
pub trait Model {
    /// Python class name (`MLPHead`, `Sequential`, ...)
    fn class_name(&self) -> &str;

    /// All parameters with dotted names, in registration order
    fn named_parameters(&self) -> Vec<(String, Tensor)>;

    /// Evaluation-mode forward pass
    fn forward(&self, x: &Tensor) -> Result<Tensor>;
}
