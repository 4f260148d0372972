//! Model architecture: layers and the DefectNet graph

pub mod layers;
pub mod model;

pub use model::{BlockDescriptor, DefectNet};
