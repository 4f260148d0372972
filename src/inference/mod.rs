//! Int8 inference against the quantized artifact

pub mod evaluate;
pub mod interpreter;

pub use evaluate::{evaluate_artifact, EvaluationReport};
pub use interpreter::Interpreter;
