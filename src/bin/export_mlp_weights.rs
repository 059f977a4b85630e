//! Export the MLP head's weights and biases to JSON

use anyhow::{bail, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

use mlp_ckpt::utils::logging::setup_logging;
use mlp_ckpt::{
    load_model, ExportValidator, HeadConfig, ValidationConfig, WeightsFile, DEFAULT_CHECKPOINT,
    DEFAULT_WEIGHTS_FILE, VERSION,
};

/// Export weights and biases of the composition classifier to JSON
#[derive(Parser, Debug)]
#[command(name = "export_mlp_weights")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Checkpoint to read
    #[arg(long, default_value = DEFAULT_CHECKPOINT)]
    checkpoint: PathBuf,

    /// Output JSON file
    #[arg(short, long, default_value = DEFAULT_WEIGHTS_FILE)]
    output: PathBuf,

    /// Entry of a top-level dict holding the model or state dict
    #[arg(long)]
    key: Option<String>,

    /// YAML file overriding the head topology
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Reload the JSON and compare it against the model
    #[arg(long)]
    verify: bool,

    /// Enable verbose logging, including per-element mismatches under --verify
    #[arg(short, long)]
    verbose: bool,
}

fn create_progress_bar(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(msg.to_string());
    pb
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if !cli.checkpoint.exists() {
        eprintln!("Error: {} not found!", cli.checkpoint.display());
        std::process::exit(1);
    }

    setup_logging(cli.verbose);
    info!("export_mlp_weights v{}", VERSION);

    let config = HeadConfig::load_or_default(cli.config.as_deref())?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    writeln!(out, "Loading model from {}...", cli.checkpoint.display())?;
    let model = load_model(&cli.checkpoint, cli.key.as_deref(), &config, &mut out)?;

    let weights = WeightsFile::from_model(model.as_ref(), &mut out)?;
    out.flush()?;

    let pb = create_progress_bar("Writing weights...");
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    weights.save(&cli.output)?;
    pb.finish_and_clear();

    writeln!(out, "\n✓ Successfully exported weights to {}", cli.output.display())?;
    writeln!(out, "\nModel architecture:")?;
    let layers = weights.linear_layers();
    if let Some((_, input_size, _)) = layers.first() {
        writeln!(out, "  Input: {}", input_size)?;
    }
    for (i, (name, in_features, out_features)) in layers.iter().enumerate() {
        tracing::debug!("Layer {} is {}", i + 1, name);
        writeln!(out, "  Layer {}: Linear({} -> {})", i + 1, in_features, out_features)?;
    }

    if cli.verify {
        let reloaded = WeightsFile::load(&cli.output)?;
        let mut validator = ExportValidator::with_config(ValidationConfig {
            verbose: cli.verbose,
            ..ValidationConfig::default()
        });
        let passed = validator.validate_model(model.as_ref(), &reloaded)?;
        validator.print_summary(&mut out)?;
        if !passed {
            bail!("Exported weights do not match the model");
        }
    }

    Ok(())
}
