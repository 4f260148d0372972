//! Shared fixtures for the integration-style tests

use std::io::Write;
use std::path::Path;

use ndarray::Array2;

use crate::config::PipelineConfig;
use crate::data::grayscale::write_grayscale;
use crate::data::IMAGE_SIZE;

/// Write a split of `2 * per_class` frames: dark frames labeled 0 and bright
/// frames labeled 1, with a little per-frame variation.
pub fn write_synthetic_split(root: &Path, split: &str, per_class: usize) {
    let split_dir = root.join(split);
    let features = split_dir.join("features");
    std::fs::create_dir_all(&features).unwrap();
    let mut labels = std::fs::File::create(split_dir.join("labels.csv")).unwrap();
    for i in 0..per_class * 2 {
        let class = i % 2;
        let base = if class == 0 { 40 } else { 210 };
        let fill = (base + (i as i32 % 8) * 3) as u8;
        let image = Array2::from_shape_fn((IMAGE_SIZE, IMAGE_SIZE), |(r, c)| {
            fill.wrapping_add(((r + c) % 5) as u8)
        });
        write_grayscale(features.join(format!("{}_{:06}.gs", split, i)), &image).unwrap();
        writeln!(labels, "{}.0", class).unwrap();
    }
}

/// A config small and fast enough for debug-mode tests, rooted in a temp dir
pub fn small_config(root: &Path) -> PipelineConfig {
    PipelineConfig {
        alpha: 0.125,
        dropout_rate: 0.1,
        classes: 2,
        batch_size: 4,
        epochs: 1,
        initial_learning_rate: 0.01,
        final_learning_rate: 0.001,
        train_data_dir: root.to_string_lossy().into_owned(),
        model_save_path: root.join("model").to_string_lossy().into_owned(),
        tflite_model_path: root.join("model.ptq").to_string_lossy().into_owned(),
        raw_data_dir: String::new(),
        validation_split: 0.2,
        test_split: 0.1,
        augment_train_data: false,
        augment_val_data: false,
        augment_test_data: false,
        random_seed: 42,
    }
}
