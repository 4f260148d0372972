//! Calibration inputs and activation-range observation
//!
//! Conversion runs eval-mode forward passes over a small representative
//! sample of training data and records the min/max of every tensor that ends
//! up quantized.

use std::collections::BTreeMap;

use ndarray::Array4;

use crate::config::PipelineConfig;
use crate::data::Dataset;
use crate::error::{PotholeError, Result};

/// A finite, restartable sequence of calibration batches
#[derive(Debug, Clone)]
pub struct RepresentativeDataset {
    batches: Vec<Array4<f32>>,
}

impl RepresentativeDataset {
    pub fn new(batches: Vec<Array4<f32>>) -> Result<Self> {
        if batches.is_empty() || batches.iter().any(|b| b.is_empty()) {
            return Err(PotholeError::QuantizationError(
                "empty calibration data".to_string(),
            ));
        }
        Ok(Self { batches })
    }

    /// One shuffled training batch, the same sample the original training run
    /// would draw first
    pub fn from_training_split(config: &PipelineConfig) -> Result<Self> {
        let train = Dataset::load(
            &config.split_dir("train"),
            config.classes,
            config.batch_size,
            false,
            config.random_seed,
        )?;
        let batch = train.batches().next().ok_or_else(|| {
            PotholeError::QuantizationError("training split yields no calibration batch".to_string())
        })?;
        Self::new(vec![batch.images])
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Array4<f32>> {
        self.batches.iter()
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

/// Running min/max of one observed tensor
#[derive(Debug, Clone, Copy)]
pub struct TensorStats {
    pub min: f32,
    pub max: f32,
}

impl TensorStats {
    fn update(&mut self, value: f32) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn is_finite(&self) -> bool {
        self.min.is_finite() && self.max.is_finite()
    }
}

/// Collects per-tensor ranges across observed forward passes
#[derive(Debug, Clone, Default)]
pub struct ActivationObserver {
    stats: BTreeMap<String, TensorStats>,
}

impl ActivationObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe<'a>(&mut self, name: &str, values: impl IntoIterator<Item = &'a f32>) {
        let entry = self.stats.entry(name.to_string()).or_insert(TensorStats {
            min: f32::INFINITY,
            max: f32::NEG_INFINITY,
        });
        for &v in values {
            if v.is_nan() {
                entry.min = f32::NAN;
                entry.max = f32::NAN;
                return;
            }
            entry.update(v);
        }
    }

    pub fn stats(&self, name: &str) -> Result<&TensorStats> {
        self.stats.get(name).ok_or_else(|| {
            PotholeError::QuantizationError(format!("no observed range for tensor {}", name))
        })
    }
}
