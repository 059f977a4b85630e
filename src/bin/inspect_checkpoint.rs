//! Report how a checkpoint was saved

use anyhow::Result;
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

use mlp_ckpt::utils::logging::setup_logging;
use mlp_ckpt::{inspect::inspect_file, DEFAULT_CHECKPOINT, VERSION};

/// Tell a full pickled model apart from a bare state dict
#[derive(Parser, Debug)]
#[command(name = "inspect_checkpoint")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Checkpoint to inspect
    #[arg(long, default_value = DEFAULT_CHECKPOINT)]
    checkpoint: PathBuf,

    /// Entry of a top-level dict to inspect instead of the whole file
    #[arg(long)]
    key: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if !cli.checkpoint.exists() {
        eprintln!("Error: {} not found!", cli.checkpoint.display());
        std::process::exit(1);
    }

    setup_logging(cli.verbose);
    info!("inspect_checkpoint v{}", VERSION);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let is_model = inspect_file(&cli.checkpoint, cli.key.as_deref(), &mut out)?;
    out.flush()?;
    info!("Full model: {}", is_model);
    Ok(())
}
