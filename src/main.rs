//! potholenet - Main Entry Point
//!
//! Training and full-integer quantization pipeline for an on-device
//! road-defect classifier.

use clap::Parser;
use potholenet::cli::{cmd_evaluate, cmd_prepare, cmd_quantize, cmd_train, Cli, Commands};

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "potholenet=info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Prepare { config } => cmd_prepare(&config)?,
        Commands::Train { config } => cmd_train(&config)?,
        Commands::Quantize { config } => cmd_quantize(&config)?,
        Commands::Evaluate { config } => cmd_evaluate(&config)?,
    }

    Ok(())
}
