//! Dataset loading, batching and raw-capture preparation

pub mod dataset;
pub mod grayscale;
pub mod prepare;

pub use dataset::{Batch, Dataset, IMAGE_SIZE};
