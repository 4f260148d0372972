//! Command-line interface for the pipeline stages

use std::path::Path;

use clap::{Parser, Subcommand};
use tracing::info;

use crate::config::PipelineConfig;
use crate::data::prepare::prepare_data;
use crate::error::Result;
use crate::inference::evaluate_artifact;
use crate::quantization::convert_saved_model;
use crate::training::run_training;

#[derive(Parser)]
#[command(
    name = "potholenet",
    version,
    about = "Train and quantize an on-device road-defect classifier"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Split raw captures into the train/val/test layout
    Prepare {
        /// Path to the pipeline config JSON
        #[arg(short, long, default_value = "config.json")]
        config: String,
    },
    /// Train the float model and save it
    Train {
        #[arg(short, long, default_value = "config.json")]
        config: String,
    },
    /// Convert the saved model into the int8 artifact
    Quantize {
        #[arg(short, long, default_value = "config.json")]
        config: String,
    },
    /// Score the int8 artifact on the test split
    Evaluate {
        #[arg(short, long, default_value = "config.json")]
        config: String,
    },
}

pub fn cmd_prepare(config_path: &str) -> Result<()> {
    let config = PipelineConfig::from_file(Path::new(config_path))?;
    prepare_data(&config)
}

pub fn cmd_train(config_path: &str) -> Result<()> {
    let config = PipelineConfig::from_file(Path::new(config_path))?;
    let summary = run_training(&config)?;
    info!(
        epochs = summary.epochs,
        steps_per_epoch = summary.steps_per_epoch,
        val_accuracy = summary.final_val_accuracy,
        test_accuracy = summary.test_accuracy,
        "training finished"
    );
    Ok(())
}

pub fn cmd_quantize(config_path: &str) -> Result<()> {
    let config = PipelineConfig::from_file(Path::new(config_path))?;
    convert_saved_model(&config)
}

pub fn cmd_evaluate(config_path: &str) -> Result<()> {
    let config = PipelineConfig::from_file(Path::new(config_path))?;
    let report = evaluate_artifact(&config)?;
    info!(
        samples = report.samples,
        correct = report.correct,
        accuracy = report.accuracy,
        "evaluation finished"
    );
    Ok(())
}
