//! Pipeline configuration
//!
//! A single flat, typed config drives every stage (prepare, train, quantize,
//! evaluate). It is loaded from a JSON file once at startup, validated, and
//! never mutated afterwards. A missing required key or an out-of-range value
//! aborts the run.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PotholeError, Result};

fn default_raw_data_dir() -> String {
    String::new()
}

fn default_seed() -> u64 {
    42
}

/// Configuration for the full training and quantization pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Width multiplier applied to every convolution's filter count
    pub alpha: f32,
    /// Dropout rate before the classification head
    pub dropout_rate: f32,
    /// Number of output classes
    pub classes: usize,
    /// Training batch size
    pub batch_size: usize,
    /// Number of training epochs
    pub epochs: usize,
    /// Learning rate at step 0
    pub initial_learning_rate: f32,
    /// Learning rate after the linear decay has run its course
    pub final_learning_rate: f32,
    /// Directory holding the train/val/test splits
    pub train_data_dir: String,
    /// Directory the trained float model is saved to
    pub model_save_path: String,
    /// File the quantized int8 artifact is written to
    pub tflite_model_path: String,

    /// Directory of raw capture folders consumed by `prepare`
    #[serde(default = "default_raw_data_dir")]
    pub raw_data_dir: String,
    /// Fraction of non-test samples held out for validation
    #[serde(default)]
    pub validation_split: f32,
    /// Fraction of all samples held out for the test split
    #[serde(default)]
    pub test_split: f32,
    /// Double the train split with horizontally flipped copies
    #[serde(default)]
    pub augment_train_data: bool,
    /// Double the validation split with horizontally flipped copies
    #[serde(default)]
    pub augment_val_data: bool,
    /// Double the test split with horizontally flipped copies
    #[serde(default)]
    pub augment_test_data: bool,
    /// Seed for weight init, shuffling and dropout
    #[serde(default = "default_seed")]
    pub random_seed: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            dropout_rate: 0.5,
            classes: 2,
            batch_size: 50,
            epochs: 10,
            initial_learning_rate: 0.045,
            final_learning_rate: 0.0001,
            train_data_dir: "data/processed".to_string(),
            model_save_path: "out/model".to_string(),
            tflite_model_path: "out/model.ptq".to_string(),
            raw_data_dir: default_raw_data_dir(),
            validation_split: 0.2,
            test_split: 0.1,
            augment_train_data: true,
            augment_val_data: false,
            augment_test_data: false,
            random_seed: default_seed(),
        }
    }
}

impl PipelineConfig {
    /// Load a config from a JSON file and validate it
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).map_err(|e| {
            PotholeError::ConfigError(format!(
                "cannot read config {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let config: PipelineConfig = serde_json::from_str(&contents)
            .map_err(|e| PotholeError::ConfigError(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field against its documented range
    pub fn validate(&self) -> Result<()> {
        if !(self.alpha > 0.0) {
            return Err(invalid("alpha", self.alpha, "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.dropout_rate) {
            return Err(invalid("dropout_rate", self.dropout_rate, "must be in [0, 1]"));
        }
        if self.classes < 2 {
            return Err(invalid("classes", self.classes, "must be at least 2"));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size", self.batch_size, "must be at least 1"));
        }
        if self.epochs == 0 {
            return Err(invalid("epochs", self.epochs, "must be at least 1"));
        }
        if !(self.initial_learning_rate > 0.0) {
            return Err(invalid(
                "initial_learning_rate",
                self.initial_learning_rate,
                "must be positive",
            ));
        }
        if !(self.final_learning_rate >= 0.0) {
            return Err(invalid(
                "final_learning_rate",
                self.final_learning_rate,
                "must be non-negative",
            ));
        }
        if !(0.0..1.0).contains(&self.validation_split) {
            return Err(invalid(
                "validation_split",
                self.validation_split,
                "must be in [0, 1)",
            ));
        }
        if !(0.0..1.0).contains(&self.test_split) {
            return Err(invalid("test_split", self.test_split, "must be in [0, 1)"));
        }
        if self.train_data_dir.is_empty() {
            return Err(invalid("train_data_dir", "\"\"", "must not be empty"));
        }
        if self.model_save_path.is_empty() {
            return Err(invalid("model_save_path", "\"\"", "must not be empty"));
        }
        if self.tflite_model_path.is_empty() {
            return Err(invalid("tflite_model_path", "\"\"", "must not be empty"));
        }
        Ok(())
    }

    pub fn split_dir(&self, split: &str) -> PathBuf {
        Path::new(&self.train_data_dir).join(split)
    }
}

fn invalid<V: std::fmt::Display>(name: &str, value: V, reason: &str) -> PotholeError {
    PotholeError::InvalidParameter {
        name: name.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
