//! State dict key diagnostics
//!
//! Loading a state dict into a fixed architecture fails on any key mismatch.
//! This module reports what was expected against what the checkpoint holds,
//! in the same terms PyTorch's `load_state_dict` error uses.

use std::collections::HashSet;

/// Expected vs. available keys for one component
#[derive(Debug, Clone)]
pub struct KeyReport {
    /// Name of the component (e.g. "MLPHead")
    pub component_name: String,
    /// Expected keys that were absent, in registration order
    pub missing_keys: Vec<String>,
    /// Keys in the checkpoint the component does not load, in saved order
    pub unexpected_keys: Vec<String>,
}

impl KeyReport {
    /// Compare expected keys against the keys of a checkpoint
    pub fn compare(component_name: &str, expected_keys: &[String], available_keys: &[String]) -> Self {
        let available_set: HashSet<&str> = available_keys.iter().map(String::as_str).collect();
        let expected_set: HashSet<&str> = expected_keys.iter().map(String::as_str).collect();

        let missing_keys = expected_keys
            .iter()
            .filter(|k| !available_set.contains(k.as_str()))
            .cloned()
            .collect();
        let unexpected_keys = available_keys
            .iter()
            .filter(|k| !expected_set.contains(k.as_str()))
            .cloned()
            .collect();

        Self {
            component_name: component_name.to_string(),
            missing_keys,
            unexpected_keys,
        }
    }

    /// No missing and no unexpected keys
    pub fn is_exact(&self) -> bool {
        self.missing_keys.is_empty() && self.unexpected_keys.is_empty()
    }

    /// `load_state_dict`-style description of the mismatch, empty when exact
    pub fn describe(&self) -> String {
        let quote = |keys: &[String]| {
            keys.iter()
                .map(|k| format!("\"{}\"", k))
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut parts = Vec::new();
        if !self.missing_keys.is_empty() {
            parts.push(format!(
                "Missing key(s) in state_dict: {}.",
                quote(&self.missing_keys)
            ));
        }
        if !self.unexpected_keys.is_empty() {
            parts.push(format!(
                "Unexpected key(s) in state_dict: {}.",
                quote(&self.unexpected_keys)
            ));
        }
        if parts.is_empty() {
            return String::new();
        }
        format!(
            "Error(s) in loading state_dict for {}: {}",
            self.component_name,
            parts.join(" ")
        )
    }
}
