//! Post-training full-integer quantization

pub mod artifact;
pub mod calibration;
pub mod converter;

pub use artifact::{QuantOp, QuantParams, QuantizedModel, TensorSpec};
pub use calibration::RepresentativeDataset;
pub use converter::convert_saved_model;
