//! Model loading for the exporter
//!
//! Tries the checkpoint as a full pickled model first. A state dict is
//! rebuilt into an `MlpHead` from its tensor shapes.

use anyhow::{anyhow, Context, Result};
use std::io::Write;
use std::path::Path;

use crate::checkpoint::Checkpoint;
use crate::config::HeadConfig;
use crate::models::Model;
use crate::reconstruct::reconstruct;

/// Load a model instance from a checkpoint
///
/// Progress lines are written to `out`. A full model is returned as saved;
/// a state dict goes through architecture reconstruction and a strict load.
pub fn load_model<W: Write>(
    path: &Path,
    key: Option<&str>,
    config: &HeadConfig,
    out: &mut W,
) -> Result<Box<dyn Model>> {
    writeln!(out, "Attempting to load full model from file...")?;

    let checkpoint = match Checkpoint::load(path, key) {
        Ok(checkpoint) => checkpoint,
        Err(e) => {
            writeln!(out, "Could not load as full model: {:#}", e)?;
            writeln!(out, "Trying to load as state_dict...")?;
            return Err(e).context("Could not load model");
        }
    };

    match checkpoint {
        Checkpoint::Model(module) => {
            writeln!(out, "✓ Successfully loaded full model")?;
            tracing::info!("Loaded {} with {} parameters", module.qualified_name(), module.named_parameters().len());
            Ok(Box::new(module))
        }
        Checkpoint::StateDict(state) => {
            writeln!(out, "\n⚠️  Model was saved as state_dict. Reconstructing architecture...")?;
            tracing::info!("State dict holds {} tensors", state.len());
            let head = reconstruct(&state, config, out).context("Could not load model")?;
            writeln!(out, "✓ Successfully loaded model from state_dict")?;
            Ok(Box::new(head))
        }
        Checkpoint::Other { type_name, .. }
            if matches!(type_name.as_str(), "dict" | "collections.OrderedDict") =>
        {
            Err(anyhow!(
                "Could not load model: checkpoint holds a {} with no tensors at the top level; pass --key to select the nested state_dict",
                type_name
            ))
        }
        Checkpoint::Other { type_name, .. } => Err(anyhow!(
            "Could not load model: checkpoint holds a {}, not a model or state_dict",
            type_name
        )),
    }
}
