//! Integration test: Full pipeline (prepare → train → quantize → evaluate)

use std::io::Write;
use std::path::Path;

use ndarray::Array2;
use potholenet::data::grayscale::write_grayscale;
use potholenet::data::prepare::prepare_data;
use potholenet::data::IMAGE_SIZE;
use potholenet::inference::{evaluate_artifact, Interpreter};
use potholenet::quantization::convert_saved_model;
use potholenet::training::run_training;
use potholenet::PipelineConfig;

fn seed_capture(raw: &Path, name: &str, frames: usize) {
    let dir = raw.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    let mut index = std::fs::File::create(dir.join("labels.csv")).unwrap();
    writeln!(index, "file;label").unwrap();
    for i in 0..frames {
        // even frames are dark negatives, odd frames bright positives
        let class = i % 2;
        let base = if class == 0 { 40u8 } else { 210u8 };
        let image = Array2::from_shape_fn((IMAGE_SIZE, IMAGE_SIZE), |(r, c)| {
            base.wrapping_add(((r + c + i) % 7) as u8)
        });
        let file = format!("frame_{:03}.gs", i);
        write_grayscale(dir.join(&file), &image).unwrap();
        writeln!(index, "{};{}.0", file, class).unwrap();
    }
}

fn pipeline_config(root: &Path) -> PipelineConfig {
    PipelineConfig {
        alpha: 0.125,
        dropout_rate: 0.1,
        classes: 2,
        batch_size: 4,
        epochs: 1,
        initial_learning_rate: 0.01,
        final_learning_rate: 0.001,
        raw_data_dir: root.join("raw").to_string_lossy().into_owned(),
        train_data_dir: root.join("processed").to_string_lossy().into_owned(),
        model_save_path: root.join("model").to_string_lossy().into_owned(),
        tflite_model_path: root.join("model.int8").to_string_lossy().into_owned(),
        validation_split: 0.25,
        test_split: 0.25,
        augment_train_data: false,
        augment_val_data: false,
        augment_test_data: false,
        random_seed: 42,
    }
}

#[test]
fn test_full_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let config = pipeline_config(dir.path());

    // Step 1: Prepare raw captures into splits
    seed_capture(&dir.path().join("raw"), "capture_a", 8);
    seed_capture(&dir.path().join("raw"), "capture_b", 8);
    prepare_data(&config).unwrap();
    // 16 frames: 4 test, 3 val (25% of remaining 12), 9 train

    // Step 2: Train the float model
    let summary = run_training(&config).unwrap();
    assert_eq!(summary.steps_per_epoch, 9 / config.batch_size);
    assert!(summary.final_train_loss.is_finite());
    assert!((0.0..=1.0).contains(&summary.final_val_accuracy));

    // Step 3: Quantize the saved model
    convert_saved_model(&config).unwrap();
    let interpreter = Interpreter::from_file(Path::new(&config.tflite_model_path)).unwrap();
    assert_eq!(interpreter.classes(), 2);
    assert_eq!(interpreter.input_spec().shape, vec![1, 96, 96, 1]);

    // Step 4: Evaluate the artifact on the test split
    let report = evaluate_artifact(&config).unwrap();
    assert_eq!(report.samples, 4);
    assert!(report.correct <= report.samples);
    assert!((0.0..=1.0).contains(&report.accuracy));
}
