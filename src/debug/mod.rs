//! Debug and validation utilities
//!
//! - State dict key diagnostics for strict loading
//! - Exported weights verification against the source model

mod export_validator;
mod key_report;

pub use export_validator::{ExportValidator, ValidationConfig, ValidationResult};
pub use key_report::KeyReport;
