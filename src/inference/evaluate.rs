//! Artifact evaluation
//!
//! Scores the quantized artifact on the test split, one int8 sample per
//! invoke, comparing arg-max predictions against arg-max labels.

use std::path::Path;

use ndarray::Array1;
use tracing::info;

use crate::config::PipelineConfig;
use crate::data::Dataset;
use crate::error::{PotholeError, Result};
use crate::inference::interpreter::Interpreter;
use crate::training::metrics::argmax;

/// Outcome of one evaluation run
#[derive(Debug, Clone)]
pub struct EvaluationReport {
    pub samples: usize,
    pub correct: usize,
    pub accuracy: f32,
}

/// Evaluate the artifact at `tflite_model_path` against the test split.
pub fn evaluate_artifact(config: &PipelineConfig) -> Result<EvaluationReport> {
    let interpreter = Interpreter::from_file(Path::new(&config.tflite_model_path))?;
    if interpreter.classes() != config.classes {
        return Err(PotholeError::InferenceError(format!(
            "artifact has {} classes, config expects {}",
            interpreter.classes(),
            config.classes
        )));
    }

    let test = Dataset::load(
        &config.split_dir("test"),
        config.classes,
        1,
        false,
        config.random_seed,
    )?;

    let mut correct = 0usize;
    for (image, label) in test.samples() {
        let output = interpreter.run(&image.to_owned())?;
        if argmax_i8(&output) == argmax(label) {
            correct += 1;
        }
    }

    let samples = test.len();
    let accuracy = correct as f32 / samples as f32;
    info!(samples, correct, accuracy, "artifact evaluation");
    Ok(EvaluationReport {
        samples,
        correct,
        accuracy,
    })
}

fn argmax_i8(values: &Array1<i8>) -> usize {
    let mut best = 0;
    let mut best_value = i8::MIN;
    for (i, &v) in values.iter().enumerate() {
        if v > best_value {
            best = i;
            best_value = v;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantization::convert_saved_model;
    use crate::testutil::{small_config, write_synthetic_split};
    use crate::training::run_training;

    #[test]
    fn test_argmax_i8_prefers_first_maximum() {
        let values = Array1::from_vec(vec![-3i8, 7, 7, 0]);
        assert_eq!(argmax_i8(&values), 1);
    }

    #[test]
    fn test_full_pipeline_reports_accuracy_in_range() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(dir.path());
        write_synthetic_split(dir.path(), "train", 6);
        write_synthetic_split(dir.path(), "val", 2);
        write_synthetic_split(dir.path(), "test", 3);

        run_training(&config).unwrap();
        convert_saved_model(&config).unwrap();
        let report = evaluate_artifact(&config).unwrap();

        assert_eq!(report.samples, 6);
        assert!(report.correct <= report.samples);
        assert!((0.0..=1.0).contains(&report.accuracy));
    }

    #[test]
    fn test_missing_artifact_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(dir.path());
        write_synthetic_split(dir.path(), "test", 2);
        assert!(evaluate_artifact(&config).is_err());
    }

    #[test]
    fn test_class_count_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = small_config(dir.path());
        write_synthetic_split(dir.path(), "train", 4);
        write_synthetic_split(dir.path(), "val", 2);
        write_synthetic_split(dir.path(), "test", 2);
        run_training(&config).unwrap();
        convert_saved_model(&config).unwrap();

        config.classes = 3;
        let err = evaluate_artifact(&config).unwrap_err();
        assert!(matches!(err, PotholeError::InferenceError(_)));
    }
}
