//! Checkpoint inspection report
//!
//! Tells whether a checkpoint can be loaded as-is or needs an architecture
//! definition first.

use anyhow::Result;
use std::io::Write;
use std::path::Path;

use crate::checkpoint::Checkpoint;
use crate::INSPECT_PREVIEW_KEYS;

/// Keys checked in order for a classification head's weight
const HEAD_WEIGHT_KEYS: [&str; 3] = ["classifier.weight", "fc.weight", "head.weight"];

/// Load `path` and write the report to `out`
///
/// Returns `true` only for a full model. A file that cannot be decoded is
/// reported as `Error loading file: ...` rather than returned as an error.
pub fn inspect_file<W: Write>(path: &Path, key: Option<&str>, out: &mut W) -> Result<bool> {
    writeln!(out, "Inspecting {}...\n", path.display())?;

    match Checkpoint::load(path, key) {
        Ok(checkpoint) => report(&checkpoint, out),
        Err(e) => {
            tracing::debug!("Load failed: {:?}", e);
            writeln!(out, "Error loading file: {:#}", e)?;
            Ok(false)
        }
    }
}

/// Write the report for an already loaded checkpoint
pub fn report<W: Write>(checkpoint: &Checkpoint, out: &mut W) -> Result<bool> {
    writeln!(out, "Type: <class '{}'>", checkpoint.type_name())?;

    match checkpoint {
        Checkpoint::Model(module) => {
            writeln!(out, "✓ This is a full model (saved with torch.save(model, ...))")?;
            writeln!(out, "  Model class: {}", module.class_name)?;
            writeln!(out, "  Model: {}", module)?;
            writeln!(out, "\n✓ You can load this directly - no architecture definition needed!")?;
            Ok(true)
        }
        Checkpoint::StateDict(state) => {
            writeln!(out, "⚠️  This is a state_dict (saved with torch.save(model.state_dict(), ...))")?;
            let total = state.total_keys();
            writeln!(out, "  Number of layers: {}", total)?;
            if !state.skipped().is_empty() {
                writeln!(out, "  Non-tensor entries: {}", state.skipped().len())?;
            }
            writeln!(out, "\n  Layer names:")?;
            let lines = state
                .iter()
                .map(|(key, tensor)| format!("{}: shape {}", key, torch_size(tensor.dims())))
                .chain(state.skipped().iter().map(|key| format!("{}: not a tensor", key)));
            for line in lines.take(INSPECT_PREVIEW_KEYS) {
                writeln!(out, "    - {}", line)?;
            }
            if total > INSPECT_PREVIEW_KEYS {
                writeln!(out, "    ... and {} more layers", total - INSPECT_PREVIEW_KEYS)?;
            }

            let head = HEAD_WEIGHT_KEYS
                .iter()
                .find_map(|&key| state.get(key).map(|t| (key, t)));
            if let Some((key, tensor)) = head {
                if let Some(num_classes) = tensor.dims().first() {
                    writeln!(out, "\n  Inferred num_classes: {} (from {})", num_classes, key)?;
                }
            }

            writeln!(out, "\n⚠️  You need to define the model architecture to load this.")?;
            writeln!(out, "   Use export_mlp_weights to rebuild the MLP head from its shapes.")?;
            Ok(false)
        }
        Checkpoint::Other { type_name, preview } => {
            writeln!(out, "⚠️  Unknown format: <class '{}'>", type_name)?;
            writeln!(out, "  Content: {}...", preview)?;
            Ok(false)
        }
    }
}

/// `torch.Size([..])` rendering of a shape
fn torch_size(dims: &[usize]) -> String {
    let dims: Vec<String> = dims.iter().map(ToString::to_string).collect();
    format!("torch.Size([{}])", dims.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::StateDict;
    use candle_core::{DType, Device, Tensor};

    fn report_text(checkpoint: &Checkpoint) -> (bool, String) {
        let mut out = Vec::new();
        let is_model = report(checkpoint, &mut out).unwrap();
        (is_model, String::from_utf8(out).unwrap())
    }

    fn state(entries: &[(&str, &[usize])]) -> StateDict {
        StateDict::new(
            entries
                .iter()
                .map(|(k, shape)| {
                    (
                        k.to_string(),
                        Tensor::zeros(*shape, DType::F32, &Device::Cpu).unwrap(),
                    )
                })
                .collect(),
        )
    }

    #[test]
    fn test_torch_size() {
        assert_eq!(torch_size(&[256, 512]), "torch.Size([256, 512])");
        assert_eq!(torch_size(&[]), "torch.Size([])");
    }

    #[test]
    fn test_state_dict_report() {
        let checkpoint = Checkpoint::StateDict(state(&[
            ("backbone.weight", &[64, 32]),
            ("fc.weight", &[7, 64]),
            ("fc.bias", &[7]),
        ]));
        let (is_model, text) = report_text(&checkpoint);
        assert!(!is_model);
        assert!(text.starts_with("Type: <class 'collections.OrderedDict'>\n"));
        assert!(text.contains("  Number of layers: 3\n"));
        assert!(text.contains("    - fc.weight: shape torch.Size([7, 64])\n"));
        assert!(text.contains("Inferred num_classes: 7 (from fc.weight)"));
        assert!(!text.contains("more layers"));
    }

    #[test]
    fn test_state_dict_report_truncates_listing() {
        let names: Vec<String> = (0..13).map(|i| format!("layers.{}.weight", i)).collect();
        let entries: Vec<(&str, &[usize])> = names.iter().map(|n| (n.as_str(), &[2usize][..])).collect();
        let (_, text) = report_text(&Checkpoint::StateDict(state(&entries)));
        assert!(text.contains("    - layers.9.weight"));
        assert!(!text.contains("    - layers.10.weight"));
        assert!(text.contains("    ... and 3 more layers\n"));
        assert!(!text.contains("Inferred num_classes"));
    }

    #[test]
    fn test_head_key_priority() {
        let checkpoint = Checkpoint::StateDict(state(&[
            ("head.weight", &[3, 8]),
            ("classifier.weight", &[5, 8]),
        ]));
        let (_, text) = report_text(&checkpoint);
        assert!(text.contains("Inferred num_classes: 5 (from classifier.weight)"));
    }

    #[test]
    fn test_unknown_format_report() {
        let checkpoint = Checkpoint::Other {
            type_name: "list".to_string(),
            preview: "[1, 2, 3]".to_string(),
        };
        let (is_model, text) = report_text(&checkpoint);
        assert!(!is_model);
        assert!(text.contains("⚠️  Unknown format: <class 'list'>\n"));
        assert!(text.contains("  Content: [1, 2, 3]...\n"));
    }

    #[test]
    fn test_inspect_file_reports_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.pt");
        std::fs::write(&path, b"\x80\x02garbage").unwrap();

        let mut out = Vec::new();
        let is_model = inspect_file(&path, None, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(!is_model);
        assert!(text.contains("Error loading file: "));
    }
}
