//! Training driver
//!
//! Loads the three splits, runs the epoch loop with a repeating train
//! iterator, validates after every epoch, scores the test split once at the
//! end and persists the trained model.

use std::path::Path;

use ndarray::Axis;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use tracing::info;

use crate::config::PipelineConfig;
use crate::data::Dataset;
use crate::error::{PotholeError, Result};
use crate::network::DefectNet;
use crate::training::metrics::{accuracy, cross_entropy};
use crate::training::optimizer::{Adam, PolynomialDecay};

/// What a finished training run reports back
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub epochs: usize,
    pub steps_per_epoch: usize,
    pub final_train_loss: f32,
    pub final_val_loss: f32,
    pub final_val_accuracy: f32,
    pub test_loss: f32,
    pub test_accuracy: f32,
}

/// Train a fresh model per the config and save it to `model_save_path`.
pub fn run_training(config: &PipelineConfig) -> Result<TrainingSummary> {
    let train = Dataset::load(
        &config.split_dir("train"),
        config.classes,
        config.batch_size,
        true,
        config.random_seed,
    )?;
    let val = Dataset::load(
        &config.split_dir("val"),
        config.classes,
        config.batch_size,
        false,
        config.random_seed,
    )?;
    let test = Dataset::load(
        &config.split_dir("test"),
        config.classes,
        config.batch_size,
        false,
        config.random_seed,
    )?;

    let steps_per_epoch = train.len() / config.batch_size;
    if steps_per_epoch == 0 {
        return Err(PotholeError::TrainingError(format!(
            "batch size {} exceeds the {} training samples",
            config.batch_size,
            train.len()
        )));
    }
    let total_steps = steps_per_epoch * config.epochs;
    info!(
        train = train.len(),
        val = val.len(),
        test = test.len(),
        steps_per_epoch,
        total_steps,
        "starting training"
    );

    let mut model = DefectNet::new(
        config.alpha,
        config.classes,
        config.dropout_rate,
        config.random_seed,
    );
    let mut opt = Adam::new();
    let schedule = PolynomialDecay::new(
        config.initial_learning_rate,
        config.final_learning_rate,
        total_steps,
    );
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(config.random_seed);

    let mut batches = train.batches();
    let mut global_step = 0usize;
    let mut epoch_loss = 0.0;
    let mut final_val = (0.0, 0.0);
    for epoch in 0..config.epochs {
        let mut loss_sum = 0.0;
        let mut acc_sum = 0.0;
        for _ in 0..steps_per_epoch {
            let batch = batches.next().ok_or_else(|| {
                PotholeError::TrainingError("training iterator exhausted".to_string())
            })?;
            let n = batch.images.len_of(Axis(0)) as f32;
            let probs = model.forward(&batch.images, true, &mut rng);
            loss_sum += cross_entropy(&probs, &batch.labels);
            acc_sum += accuracy(&probs, &batch.labels);

            let grad_logits = (&probs - &batch.labels) / n;
            model.backward(&grad_logits);
            opt.begin_step();
            let lr = schedule.learning_rate(global_step);
            model.apply_gradients(&mut opt, lr);
            global_step += 1;
        }
        epoch_loss = loss_sum / steps_per_epoch as f32;
        let train_acc = acc_sum / steps_per_epoch as f32;
        final_val = evaluate_model(&mut model, &val, &mut rng);
        info!(
            epoch = epoch + 1,
            loss = epoch_loss,
            accuracy = train_acc,
            val_loss = final_val.0,
            val_accuracy = final_val.1,
            lr = schedule.learning_rate(global_step.saturating_sub(1)),
            "epoch finished"
        );
    }

    let (test_loss, test_accuracy) = evaluate_model(&mut model, &test, &mut rng);
    info!(test_loss, test_accuracy, "test evaluation");

    model.is_fitted = true;
    model.save(Path::new(&config.model_save_path))?;
    info!(path = %config.model_save_path, "model saved");

    Ok(TrainingSummary {
        epochs: config.epochs,
        steps_per_epoch,
        final_train_loss: epoch_loss,
        final_val_loss: final_val.0,
        final_val_accuracy: final_val.1,
        test_loss,
        test_accuracy,
    })
}

/// Average loss and accuracy over one pass of a non-repeating split
pub fn evaluate_model(
    model: &mut DefectNet,
    dataset: &Dataset,
    rng: &mut Xoshiro256PlusPlus,
) -> (f32, f32) {
    let mut total = 0usize;
    let mut loss_sum = 0.0;
    let mut correct = 0.0;
    for batch in dataset.batches() {
        let n = batch.images.len_of(Axis(0));
        let probs = model.forward(&batch.images, false, rng);
        loss_sum += cross_entropy(&probs, &batch.labels) * n as f32;
        correct += accuracy(&probs, &batch.labels) * n as f32;
        total += n;
    }
    if total == 0 {
        (0.0, 0.0)
    } else {
        (loss_sum / total as f32, correct / total as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{small_config, write_synthetic_split};

    #[test]
    fn test_run_training_saves_model_and_reports_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(dir.path());
        write_synthetic_split(dir.path(), "train", 6);
        write_synthetic_split(dir.path(), "val", 2);
        write_synthetic_split(dir.path(), "test", 2);

        let summary = run_training(&config).unwrap();
        assert_eq!(summary.epochs, config.epochs);
        assert_eq!(summary.steps_per_epoch, 12 / config.batch_size);
        assert!(summary.final_train_loss.is_finite());
        assert!((0.0..=1.0).contains(&summary.final_val_accuracy));
        assert!((0.0..=1.0).contains(&summary.test_accuracy));

        let model_dir = std::path::Path::new(&config.model_save_path);
        assert!(model_dir.join("graph.json").is_file());
        assert!(model_dir.join("weights.bin").is_file());
        let model = DefectNet::load(model_dir).unwrap();
        assert!(model.is_fitted());
    }

    #[test]
    fn test_batch_size_larger_than_split_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = small_config(dir.path());
        config.batch_size = 64;
        write_synthetic_split(dir.path(), "train", 2);
        write_synthetic_split(dir.path(), "val", 1);
        write_synthetic_split(dir.path(), "test", 1);
        let err = run_training(&config).unwrap_err();
        assert!(matches!(err, PotholeError::TrainingError(_)));
    }

    #[test]
    fn test_missing_split_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(dir.path());
        write_synthetic_split(dir.path(), "train", 4);
        // no val/test splits on disk
        assert!(run_training(&config).is_err());
    }
}
