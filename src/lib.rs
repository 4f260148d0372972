//! potholenet: training and full-integer quantization for an on-device
//! road-defect classifier
//!
//! The pipeline runs in four stages, each driven by the same flat config:
//! `prepare` splits raw captures into train/val/test, `train` fits a
//! MobileNet-style float model on 96x96 grayscale frames, `quantize` converts
//! it into a fully int8 artifact calibrated on a representative training
//! batch, and `evaluate` scores that artifact with a minimal int8
//! interpreter. All errors are fatal; a failed stage writes nothing.

pub mod cli;
pub mod config;
pub mod data;
pub mod error;
pub mod inference;
pub mod network;
pub mod quantization;
pub mod training;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::PipelineConfig;
pub use error::{PotholeError, Result};
