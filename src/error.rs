//! Error types for the potholenet pipeline
//!
//! Every failure in the pipeline is fatal: errors propagate up to the
//! subcommand entry point and abort the run. There are no retries and no
//! partial outputs.

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PotholeError>;

/// Main error type for the pipeline
#[derive(Error, Debug)]
pub enum PotholeError {
    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Data error: {0}")]
    DataError(String),

    #[error("Training error: {0}")]
    TrainingError(String),

    #[error("Quantization error: {0}")]
    QuantizationError(String),

    #[error("Inference error: {0}")]
    InferenceError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid shape: expected {expected}, got {actual}")]
    ShapeError { expected: String, actual: String },

    #[error("Invalid parameter: {name} = {value}, {reason}")]
    InvalidParameter {
        name: String,
        value: String,
        reason: String,
    },
}

impl From<serde_json::Error> for PotholeError {
    fn from(err: serde_json::Error) -> Self {
        PotholeError::SerializationError(err.to_string())
    }
}

impl From<bincode::Error> for PotholeError {
    fn from(err: bincode::Error) -> Self {
        PotholeError::SerializationError(err.to_string())
    }
}

impl From<csv::Error> for PotholeError {
    fn from(err: csv::Error) -> Self {
        PotholeError::DataError(err.to_string())
    }
}

impl From<ndarray::ShapeError> for PotholeError {
    fn from(err: ndarray::ShapeError) -> Self {
        PotholeError::ShapeError {
            expected: "valid shape".to_string(),
            actual: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PotholeError::DataError("labels.csv missing".to_string());
        assert_eq!(err.to_string(), "Data error: labels.csv missing");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: PotholeError = io_err.into();
        assert!(matches!(err, PotholeError::IoError(_)));
    }

    #[test]
    fn test_invalid_parameter_display() {
        let err = PotholeError::InvalidParameter {
            name: "alpha".to_string(),
            value: "0".to_string(),
            reason: "must be positive".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid parameter: alpha = 0, must be positive"
        );
    }
}
