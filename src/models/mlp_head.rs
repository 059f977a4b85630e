//! MLP classifier head
//!
//! Fixed topology, registered under a single `Sequential`:
//!
//! ```text
//! mlp.0  Linear(input, 256)
//! mlp.1  ReLU
//! mlp.2  Dropout(0.3)
//! mlp.3  Linear(256, 128)
//! mlp.4  ReLU
//! mlp.5  Dropout(0.3)
//! mlp.6  Linear(128, num_classes)
//! mlp.7  Sigmoid
//! ```

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Dropout, Linear, Module, VarBuilder};

use super::Model;
use crate::checkpoint::StateDict;
use crate::config::HeadConfig;
use crate::debug::KeyReport;

/// Three-layer perceptron with sigmoid outputs
pub struct MlpHead {
    layers: [Linear; 3],
    dropout: Dropout,
    input_size: usize,
    num_classes: usize,
    /// Parameter name of each linear layer, e.g. `mlp.3`
    layer_names: [String; 3],
}

impl MlpHead {
    /// Class name the head is saved under
    pub const CLASS_NAME: &'static str = "MLPHead";

    /// Load from a VarBuilder rooted at the checkpoint top level
    pub fn load(
        input_size: usize,
        num_classes: usize,
        config: &HeadConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let [h1, h2] = config.hidden_sizes;
        let dims = [(input_size, h1), (h1, h2), (h2, num_classes)];
        let indices = config.linear_indices();
        let vb = vb.pp(&config.prefix);

        let mut layers = Vec::with_capacity(3);
        for (&(in_dim, out_dim), index) in dims.iter().zip(indices) {
            let layer = candle_nn::linear(in_dim, out_dim, vb.pp(index))
                .with_context(|| format!("Failed to load {}.{}", config.prefix, index))?;
            layers.push(layer);
        }
        let layers: [Linear; 3] = match layers.try_into() {
            Ok(layers) => layers,
            Err(_) => bail!("Expected exactly three linear layers"),
        };

        Ok(Self {
            layers,
            dropout: Dropout::new(config.dropout),
            input_size,
            num_classes,
            layer_names: indices.map(|i| format!("{}.{}", config.prefix, i)),
        })
    }

    /// Load a state dict strictly, like `load_state_dict(strict=True)`
    ///
    /// Every expected key must be present with the expected shape and no
    /// other keys may be left over.
    pub fn from_state_dict(
        state: &StateDict,
        input_size: usize,
        num_classes: usize,
        config: &HeadConfig,
    ) -> Result<Self> {
        let available: Vec<String> = state.keys().map(str::to_string).collect();
        let report = KeyReport::compare(Self::CLASS_NAME, &Self::expected_keys(config), &available);
        if !report.is_exact() {
            bail!("{}", report.describe());
        }

        let vb = VarBuilder::from_tensors(state.to_map(), DType::F32, &Device::Cpu);
        Self::load(input_size, num_classes, config, vb)
            .with_context(|| format!("Error(s) in loading state_dict for {}", Self::CLASS_NAME))
    }

    /// Randomly initialised head, for testing forward passes
    pub fn new_random(
        input_size: usize,
        num_classes: usize,
        config: &HeadConfig,
        device: &Device,
    ) -> Result<Self> {
        let [h1, h2] = config.hidden_sizes;
        let make_linear = |in_dim: usize, out_dim: usize| -> Result<Linear> {
            let w = Tensor::randn(0.0f32, 0.02, (out_dim, in_dim), device)?;
            let b = Tensor::zeros((out_dim,), DType::F32, device)?;
            Ok(Linear::new(w, Some(b)))
        };

        Ok(Self {
            layers: [
                make_linear(input_size, h1)?,
                make_linear(h1, h2)?,
                make_linear(h2, num_classes)?,
            ],
            dropout: Dropout::new(config.dropout),
            input_size,
            num_classes,
            layer_names: config
                .linear_indices()
                .map(|i| format!("{}.{}", config.prefix, i)),
        })
    }

    /// State dict keys the head loads, in registration order
    pub fn expected_keys(config: &HeadConfig) -> Vec<String> {
        config
            .linear_indices()
            .iter()
            .flat_map(|&i| [config.param_key(i, "weight"), config.param_key(i, "bias")])
            .collect()
    }

    /// Width of the input features
    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// Number of output classes
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Forward pass; dropout is only applied when `train` is set
    ///
    /// Input: (batch, input_size)
    /// Output: (batch, num_classes) probabilities
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let [fc1, fc2, fc3] = &self.layers;

        let x = fc1.forward(x)?.relu()?;
        let x = self.dropout.forward(&x, train)?;
        let x = fc2.forward(&x)?.relu()?;
        let x = self.dropout.forward(&x, train)?;
        let x = fc3.forward(&x)?;

        Ok(candle_nn::ops::sigmoid(&x)?)
    }
}

impl Model for MlpHead {
    fn class_name(&self) -> &str {
        Self::CLASS_NAME
    }

    fn named_parameters(&self) -> Vec<(String, Tensor)> {
        let mut params = Vec::with_capacity(6);
        for (name, layer) in self.layer_names.iter().zip(&self.layers) {
            params.push((format!("{}.weight", name), layer.weight().clone()));
            if let Some(bias) = layer.bias() {
                params.push((format!("{}.bias", name), bias.clone()));
            }
        }
        params
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward_t(x, false)
    }
}
