//! Export verification
//!
//! Reloads an exported weights file and compares every entry against the
//! model parameter it came from. The default tolerance is zero: exported
//! values must come back bit-for-bit.

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};
use std::io::Write;

use crate::models::Model;
use crate::weights::{is_exported_name, ExportedTensor, WeightsFile};

/// Validation configuration
#[derive(Clone)]
pub struct ValidationConfig {
    /// Absolute tolerance for float comparisons
    pub atol: f64,
    /// Relative tolerance for float comparisons
    pub rtol: f64,
    /// Whether to log individual differences
    pub verbose: bool,
    /// Maximum number of differences to log
    pub max_diffs: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            atol: 0.0,
            rtol: 0.0,
            verbose: false,
            max_diffs: 10,
        }
    }
}

impl ValidationConfig {
    fn is_exact(&self) -> bool {
        self.atol == 0.0 && self.rtol == 0.0
    }
}

/// Result of validating one parameter
#[derive(Debug, Clone)]
pub struct ValidationResult {
    /// Parameter name
    pub name: String,
    /// Whether validation passed
    pub passed: bool,
    /// Shape matches
    pub shape_match: bool,
    /// Shape of the model parameter
    pub expected_shape: Vec<usize>,
    /// Shape recorded in the weights file
    pub actual_shape: Vec<usize>,
    /// Maximum absolute difference
    pub max_abs_diff: f64,
    /// Mean absolute difference
    pub mean_abs_diff: f64,
    /// Number of elements that differ beyond tolerance
    pub num_diffs: usize,
    /// Total number of elements
    pub total_elements: usize,
    /// Error message if any
    pub error: Option<String>,
}

impl ValidationResult {
    /// Create a failing result
    pub fn fail(name: &str, error: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            shape_match: false,
            expected_shape: vec![],
            actual_shape: vec![],
            max_abs_diff: 0.0,
            mean_abs_diff: 0.0,
            num_diffs: 0,
            total_elements: 0,
            error: Some(error.to_string()),
        }
    }

    /// Summary string
    pub fn summary(&self) -> String {
        if self.passed {
            format!(
                "[PASS] {} - shape {:?}, max_diff={:.2e}",
                self.name, self.actual_shape, self.max_abs_diff
            )
        } else if let Some(ref err) = self.error {
            format!("[FAIL] {} - {}", self.name, err)
        } else {
            format!(
                "[FAIL] {} - {} of {} elements differ, max_diff={:.2e}, mean_diff={:.2e}",
                self.name, self.num_diffs, self.total_elements, self.max_abs_diff, self.mean_abs_diff
            )
        }
    }
}

/// Compares a weights file against the model it was exported from
pub struct ExportValidator {
    config: ValidationConfig,
    results: Vec<ValidationResult>,
}

impl Default for ExportValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl ExportValidator {
    /// Create a validator requiring exact equality
    pub fn new() -> Self {
        Self::with_config(ValidationConfig::default())
    }

    /// Create with custom config
    pub fn with_config(config: ValidationConfig) -> Self {
        Self {
            config,
            results: Vec::new(),
        }
    }

    /// Validate every exported parameter of `model` against `weights`
    ///
    /// Entries missing from the file and entries with no matching parameter
    /// both fail.
    pub fn validate_model(&mut self, model: &dyn Model, weights: &WeightsFile) -> Result<bool> {
        let params: Vec<(String, Tensor)> = model
            .named_parameters()
            .into_iter()
            .filter(|(name, _)| is_exported_name(name))
            .collect();

        for (name, param) in &params {
            match weights.get(name) {
                Some(exported) => {
                    self.validate_tensor(name, param, exported)?;
                }
                None => self
                    .results
                    .push(ValidationResult::fail(name, "missing from weights file")),
            }
        }

        for (name, _) in weights.iter() {
            if !params.iter().any(|(n, _)| n == name) {
                self.results
                    .push(ValidationResult::fail(name, "no such parameter in model"));
            }
        }

        Ok(self.all_passed())
    }

    /// Validate one exported tensor against the parameter it came from
    pub fn validate_tensor(
        &mut self,
        name: &str,
        expected: &Tensor,
        exported: &ExportedTensor,
    ) -> Result<ValidationResult> {
        let expected_shape = expected.dims().to_vec();
        let actual_shape = exported.shape.clone();

        if expected_shape != actual_shape {
            let result = ValidationResult {
                name: name.to_string(),
                passed: false,
                shape_match: false,
                expected_shape,
                actual_shape,
                max_abs_diff: 0.0,
                mean_abs_diff: 0.0,
                num_diffs: 0,
                total_elements: expected.elem_count(),
                error: Some("Shape mismatch".to_string()),
            };
            self.results.push(result.clone());
            return Ok(result);
        }

        let expected_data: Vec<f64> = expected
            .to_dtype(DType::F64)?
            .flatten_all()?
            .to_vec1()
            .with_context(|| format!("Failed to read parameter {}", name))?;
        let actual_data = match exported.flatten_f64() {
            Ok(data) => data,
            Err(e) => {
                let result = ValidationResult::fail(name, &format!("{:#}", e));
                self.results.push(result.clone());
                return Ok(result);
            }
        };

        let (max_abs_diff, mean_abs_diff, num_diffs, diffs) =
            self.compare_values(&expected_data, &actual_data);
        let passed = num_diffs == 0;

        if self.config.verbose && !passed {
            for (i, (idx, e, a, diff)) in diffs.iter().enumerate() {
                if i >= self.config.max_diffs {
                    tracing::debug!("  ... and {} more", diffs.len() - i);
                    break;
                }
                tracing::debug!("{}[{}] expected={:e}, actual={:e}, diff={:.2e}", name, idx, e, a, diff);
            }
        }

        let result = ValidationResult {
            name: name.to_string(),
            passed,
            shape_match: true,
            expected_shape,
            actual_shape,
            max_abs_diff,
            mean_abs_diff,
            num_diffs,
            total_elements: expected_data.len(),
            error: None,
        };

        self.results.push(result.clone());
        Ok(result)
    }

    /// Compare values element-wise, returning (max, mean, count, diffs)
    fn compare_values(
        &self,
        expected: &[f64],
        actual: &[f64],
    ) -> (f64, f64, usize, Vec<(usize, f64, f64, f64)>) {
        let exact = self.config.is_exact();
        let mut max_diff = 0.0f64;
        let mut sum_diff = 0.0f64;
        let mut diffs = Vec::new();

        for (i, (&e, &a)) in expected.iter().zip(actual.iter()).enumerate() {
            let diff = (e - a).abs();
            if diff.is_finite() {
                max_diff = max_diff.max(diff);
                sum_diff += diff;
            }

            let differs = if exact {
                e.to_bits() != a.to_bits()
            } else {
                let tol = self.config.atol + self.config.rtol * e.abs();
                diff.is_nan() || diff > tol
            };
            if differs {
                diffs.push((i, e, a, diff));
            }
        }

        let mean_diff = sum_diff / expected.len().max(1) as f64;
        (max_diff, mean_diff, diffs.len(), diffs)
    }

    /// Get all validation results
    pub fn results(&self) -> &[ValidationResult] {
        &self.results
    }

    /// Check if all validations passed
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    /// Print summary
    pub fn print_summary<W: Write>(&self, out: &mut W) -> Result<()> {
        writeln!(out, "\n=== Export Verification ===\n")?;

        let passed = self.results.iter().filter(|r| r.passed).count();
        let total = self.results.len();

        for result in &self.results {
            writeln!(out, "{}", result.summary())?;
        }

        writeln!(out, "\nTotal: {}/{} passed", passed, total)?;

        if passed == total {
            writeln!(out, "✓ Exported weights match the model exactly")?;
        } else {
            writeln!(out, "✗ {} parameter(s) do not match", total - passed)?;
        }
        Ok(())
    }
}
