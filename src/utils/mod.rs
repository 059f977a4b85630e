//! Utility functions shared across the crate

/// Tensor layout utilities
pub mod tensor_utils {
    /// True when `stride` describes a dense row-major (C order) layout of `shape`
    ///
    /// Dimensions of size one are skipped, their stride is arbitrary in PyTorch.
    pub fn is_row_major(shape: &[usize], stride: &[usize]) -> bool {
        if shape.len() != stride.len() {
            return false;
        }
        let mut expected = 1;
        for (&dim, &s) in shape.iter().zip(stride).rev() {
            if dim > 1 && s != expected {
                return false;
            }
            expected *= dim;
        }
        true
    }

    /// True when `stride` describes a dense column-major (Fortran order) layout,
    /// which is what a transposed tensor saves as
    pub fn is_column_major(shape: &[usize], stride: &[usize]) -> bool {
        if shape.len() != stride.len() {
            return false;
        }
        let mut expected = 1;
        for (&dim, &s) in shape.iter().zip(stride) {
            if dim > 1 && s != expected {
                return false;
            }
            expected *= dim;
        }
        true
    }
}

/// Logging setup shared by the binaries
pub mod logging {
    use tracing::Level;
    use tracing_subscriber::FmtSubscriber;

    /// Install a compact stderr subscriber, WARN by default and DEBUG when verbose
    ///
    /// stdout is left to the report lines.
    pub fn setup_logging(verbose: bool) {
        let level = if verbose { Level::DEBUG } else { Level::WARN };
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(false)
            .with_thread_ids(false)
            .with_writer(std::io::stderr)
            .compact()
            .finish();
        if tracing::subscriber::set_global_default(subscriber).is_err() {
            eprintln!("Failed to set tracing subscriber");
        }
    }
}

/// Python-style value formatting for reports that mirror PyTorch output
pub mod repr_utils {
    /// `True` / `False`
    pub fn python_bool(value: bool) -> &'static str {
        if value {
            "True"
        } else {
            "False"
        }
    }

    /// Float as Python's `repr` would print it (`0.3`, `1.0`, `1e-05`)
    ///
    /// Shortest round-trip digits, in scientific notation when the decimal
    /// exponent is below -4 or at least 16.
    pub fn python_float(value: f64) -> String {
        if value.is_nan() {
            return "nan".to_string();
        }
        if value.is_infinite() {
            return if value > 0.0 { "inf" } else { "-inf" }.to_string();
        }

        let sci = format!("{:e}", value);
        let (mantissa, exponent) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
        let exponent: i32 = exponent.parse().unwrap_or(0);

        if (-4..16).contains(&exponent) {
            let fixed = value.to_string();
            if fixed.contains('.') {
                fixed
            } else {
                format!("{}.0", fixed)
            }
        } else {
            let sign = if exponent < 0 { '-' } else { '+' };
            format!("{}e{}{:02}", mantissa, sign, exponent.abs())
        }
    }

    /// Truncate to at most `max_chars` characters
    pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
        match text.char_indices().nth(max_chars) {
            Some((idx, _)) => &text[..idx],
            None => text,
        }
    }
}
