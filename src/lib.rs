//! # mlp-ckpt
//!
//! Tools for PyTorch checkpoints of the composition classifier head, a small
//! multilayer perceptron (input → 256 → 128 → classes).
//!
//! ## Features
//!
//! - Reads PyTorch zip checkpoints directly via Candle's pickle reader
//! - Tells full pickled models apart from bare state dicts
//! - Rebuilds the fixed-topology head from state dict shapes
//! - Exports weights and biases to a flat JSON file
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mlp_ckpt::{load_model, HeadConfig, WeightsFile};
//!
//! let mut out = std::io::stdout();
//! let model = load_model("composition_classifier.pt".as_ref(), None, &HeadConfig::default(), &mut out)?;
//! let weights = WeightsFile::from_model(model.as_ref(), &mut out)?;
//! weights.save("mlp_weights.json")?;
//! ```

#![warn(missing_docs)]
#![allow(rustdoc::missing_crate_level_docs)]

pub mod checkpoint;
pub mod config;
pub mod debug;
pub mod inspect;
pub mod loader;
pub mod models;
pub mod reconstruct;
pub mod utils;
pub mod weights;

// Re-exports for convenience
pub use checkpoint::{Checkpoint, ModuleNode, StateDict};
pub use config::HeadConfig;
pub use debug::{ExportValidator, KeyReport, ValidationConfig, ValidationResult};
pub use loader::load_model;
pub use models::{MlpHead, Model};
pub use weights::{ExportedTensor, NestedData, WeightsFile};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Checkpoint both tools read when no path is given
pub const DEFAULT_CHECKPOINT: &str = "composition_classifier.pt";

/// File the exporter writes when no path is given
pub const DEFAULT_WEIGHTS_FILE: &str = "mlp_weights.json";

/// Number of state dict entries the inspector lists
pub const INSPECT_PREVIEW_KEYS: usize = 10;
