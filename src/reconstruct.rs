//! Architecture reconstruction from a state dict
//!
//! Only the outer dimensions are read from the checkpoint: the input size
//! from the first linear layer's weight and the class count from the last
//! linear layer. Hidden widths and dropout come from `HeadConfig`, so a
//! checkpoint trained with other hidden widths fails the strict load.

use anyhow::{bail, Result};
use std::io::Write;

use crate::checkpoint::StateDict;
use crate::config::HeadConfig;
use crate::models::MlpHead;

/// Outer dimensions read from state dict keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InferredShape {
    /// From `mlp.0.weight` shape[1]
    pub input_size: Option<usize>,
    /// From `mlp.6.weight` shape[0], or `mlp.6.bias` shape[0]
    pub num_classes: Option<usize>,
}

impl InferredShape {
    /// Resolve to `(input_size, num_classes)`
    ///
    /// A missing input size falls back to `default_input_size`; a missing
    /// class count is an error.
    pub fn resolve(&self, default_input_size: usize) -> Result<(usize, usize)> {
        match (self.input_size, self.num_classes) {
            (Some(input_size), Some(num_classes)) => Ok((input_size, num_classes)),
            (None, Some(num_classes)) => Ok((default_input_size, num_classes)),
            _ => bail!("Could not infer model architecture from state_dict"),
        }
    }
}

/// Scan keys for the first and last linear layers
///
/// Keys are matched by substring, so prefixed keys such as
/// `module.mlp.0.weight` are still read. The last layer's weight takes
/// precedence over its bias regardless of key order. Zero-sized dimensions
/// count as not inferred.
pub fn infer_architecture(state: &StateDict, config: &HeadConfig) -> InferredShape {
    let [first, _, last] = config.linear_indices();
    let first_weight = config.param_key(first, "weight");
    let last_weight = config.param_key(last, "weight");
    let last_bias = config.param_key(last, "bias");

    let mut inferred = InferredShape::default();
    let mut classes_from_bias = None;

    for (key, tensor) in state.iter() {
        let dims = tensor.dims();
        if key.contains(&last_weight) {
            inferred.num_classes = dims.first().copied();
        } else if key.contains(&last_bias) {
            classes_from_bias = dims.first().copied();
        }
        if key.contains(&first_weight) {
            inferred.input_size = dims.get(1).copied();
        }
    }

    if inferred.num_classes.is_none() {
        inferred.num_classes = classes_from_bias;
    }
    inferred.input_size = inferred.input_size.filter(|&d| d > 0);
    inferred.num_classes = inferred.num_classes.filter(|&d| d > 0);
    inferred
}

/// Rebuild the classifier head from a state dict and load it strictly
pub fn reconstruct<W: Write>(state: &StateDict, config: &HeadConfig, out: &mut W) -> Result<MlpHead> {
    let inferred = infer_architecture(state, config);
    writeln!(out, "   Inferred input size: {}", display_dim(inferred.input_size))?;
    writeln!(out, "   Inferred num_classes: {}", display_dim(inferred.num_classes))?;

    let (input_size, num_classes) = inferred.resolve(config.default_input_size)?;
    if inferred.input_size.is_none() {
        tracing::warn!(
            "Input size not found in state_dict, assuming {}",
            config.default_input_size
        );
    }

    MlpHead::from_state_dict(state, input_size, num_classes, config)
}

fn display_dim(dim: Option<usize>) -> String {
    dim.map_or_else(|| "None".to_string(), |d| d.to_string())
}
