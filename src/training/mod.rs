//! Float training: optimizer, metrics and the epoch driver

pub mod driver;
pub mod metrics;
pub mod optimizer;

pub use driver::{run_training, TrainingSummary};
