//! Head topology configuration
//!
//! The reconstructed classifier head has a fixed shape. These values can be
//! overridden from a YAML file, but the defaults are what checkpoints in the
//! wild were trained with.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Topology of the fixed three-layer perceptron head
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadConfig {
    /// Widths of the two hidden layers
    pub hidden_sizes: [usize; 2],
    /// Dropout rate after each hidden layer
    pub dropout: f32,
    /// Input size used when only the class count can be inferred
    pub default_input_size: usize,
    /// Module prefix of the sequential stack inside the checkpoint
    pub prefix: String,
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            hidden_sizes: [256, 128],
            dropout: 0.3,
            default_input_size: 512,
            prefix: "mlp".to_string(),
        }
    }
}

impl HeadConfig {
    /// Load configuration from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Load from `path` if given, otherwise use the defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Slots of the three linear layers in the sequential stack
    ///
    /// Each hidden layer occupies three slots (Linear, ReLU, Dropout).
    pub fn linear_indices(&self) -> [usize; 3] {
        [0, 3, 6]
    }

    /// Parameter key for a layer slot, e.g. `mlp.6.weight`
    pub fn param_key(&self, index: usize, kind: &str) -> String {
        format!("{}.{}.{}", self.prefix, index, kind)
    }
}
