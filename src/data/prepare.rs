//! Raw capture preparation
//!
//! Walks the capture folders under `raw_data_dir`, each holding labeled
//! grayscale frames and a `file;label` index, then shuffles and splits them
//! into the train/val/test layout the loader expects. Splits can optionally be
//! doubled with horizontally flipped copies.

use std::io::Write;
use std::path::{Path, PathBuf};

use ndarray::{s, Array2};
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;
use tracing::info;

use crate::config::PipelineConfig;
use crate::data::dataset::IMAGE_SIZE;
use crate::data::grayscale::{read_grayscale, write_grayscale};
use crate::error::{PotholeError, Result};

/// Split the raw captures into train/val/test under `train_data_dir`.
pub fn prepare_data(config: &PipelineConfig) -> Result<()> {
    if config.raw_data_dir.is_empty() {
        return Err(PotholeError::ConfigError(
            "raw_data_dir must be set for prepare".to_string(),
        ));
    }

    let mut entries = collect_captures(Path::new(&config.raw_data_dir))?;
    if entries.is_empty() {
        return Err(PotholeError::DataError(format!(
            "no labeled frames under {}",
            config.raw_data_dir
        )));
    }
    info!(frames = entries.len(), "collected raw captures");

    let mut rng = Xoshiro256PlusPlus::seed_from_u64(config.random_seed);
    entries.shuffle(&mut rng);

    let n = entries.len();
    let n_test = (n as f32 * config.test_split).round() as usize;
    let n_val = ((n - n_test) as f32 * config.validation_split).round() as usize;
    let (test, rest) = entries.split_at(n_test);
    let (val, train) = rest.split_at(n_val);

    let out_root = Path::new(&config.train_data_dir);
    write_split(out_root, "train", train, config.augment_train_data)?;
    write_split(out_root, "val", val, config.augment_val_data)?;
    write_split(out_root, "test", test, config.augment_test_data)?;
    info!(
        train = train.len(),
        val = val.len(),
        test = test.len(),
        "wrote splits to {}",
        out_root.display()
    );
    Ok(())
}

fn collect_captures(raw_dir: &Path) -> Result<Vec<(PathBuf, f32)>> {
    let mut captures: Vec<PathBuf> = std::fs::read_dir(raw_dir)
        .map_err(|e| {
            PotholeError::DataError(format!("cannot read raw dir {}: {}", raw_dir.display(), e))
        })?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|entry| entry.path())
        .filter(|p| p.is_dir())
        .collect();
    captures.sort();

    let mut entries = Vec::new();
    for capture in &captures {
        let index = capture.join("labels.csv");
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b';')
            .has_headers(true)
            .from_path(&index)
            .map_err(|e| {
                PotholeError::DataError(format!("cannot read index {}: {}", index.display(), e))
            })?;
        for record in reader.records() {
            let record = record?;
            let file = record.get(0).unwrap_or("").trim();
            let label_field = record.get(1).unwrap_or("").trim();
            let label: f32 = label_field.parse().map_err(|_| {
                PotholeError::DataError(format!(
                    "malformed label {:?} in {}",
                    label_field,
                    index.display()
                ))
            })?;
            if file.is_empty() || !label.is_finite() {
                return Err(PotholeError::DataError(format!(
                    "bad index row in {}",
                    index.display()
                )));
            }
            entries.push((capture.join(file), label));
        }
    }
    Ok(entries)
}

fn write_split(
    out_root: &Path,
    name: &str,
    entries: &[(PathBuf, f32)],
    augment: bool,
) -> Result<()> {
    let features_dir = out_root.join(name).join("features");
    std::fs::create_dir_all(&features_dir)?;

    let mut frames: Vec<(Array2<u8>, f32)> = Vec::with_capacity(entries.len() * 2);
    for (path, label) in entries {
        let image = read_grayscale(path, IMAGE_SIZE)?;
        frames.push((image, *label));
    }
    if augment {
        let flipped: Vec<(Array2<u8>, f32)> = frames
            .iter()
            .map(|(image, label)| (image.slice(s![.., ..;-1]).to_owned(), *label))
            .collect();
        frames.extend(flipped);
    }

    let mut labels_file = std::fs::File::create(out_root.join(name).join("labels.csv"))?;
    for (i, (image, label)) in frames.iter().enumerate() {
        write_grayscale(features_dir.join(format!("{}_{:06}.gs", name, i)), image)?;
        writeln!(labels_file, "{}", label)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::Dataset;

    fn seed_capture(raw: &Path, name: &str, frames: &[(u8, f32)]) {
        let dir = raw.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        let mut index = std::fs::File::create(dir.join("labels.csv")).unwrap();
        writeln!(index, "file;label").unwrap();
        for (i, (fill, label)) in frames.iter().enumerate() {
            let file = format!("frame_{:03}.gs", i);
            let image = Array2::from_elem((IMAGE_SIZE, IMAGE_SIZE), *fill);
            write_grayscale(dir.join(&file), &image).unwrap();
            writeln!(index, "{};{}", file, label).unwrap();
        }
    }

    fn test_config(raw: &Path, out: &Path) -> PipelineConfig {
        PipelineConfig {
            raw_data_dir: raw.to_string_lossy().into_owned(),
            train_data_dir: out.to_string_lossy().into_owned(),
            validation_split: 0.25,
            test_split: 0.25,
            augment_train_data: false,
            augment_val_data: false,
            augment_test_data: false,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_prepare_splits_and_loads() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw");
        let out = dir.path().join("processed");
        seed_capture(
            &raw,
            "capture_a",
            &[(10, 0.0), (20, 1.0), (30, 0.0), (40, 1.0)],
        );
        seed_capture(
            &raw,
            "capture_b",
            &[(50, 0.0), (60, 1.0), (70, 0.0), (80, 1.0)],
        );

        let config = test_config(&raw, &out);
        prepare_data(&config).unwrap();

        // 8 frames: 2 test, 2 val (25% of remaining 6, rounded), 4 train
        let train = Dataset::load(&out.join("train"), 2, 4, false, 1).unwrap();
        let val = Dataset::load(&out.join("val"), 2, 4, false, 1).unwrap();
        let test = Dataset::load(&out.join("test"), 2, 4, false, 1).unwrap();
        assert_eq!(train.len() + val.len() + test.len(), 8);
        assert_eq!(test.len(), 2);
    }

    #[test]
    fn test_augmentation_doubles_split() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw");
        let out = dir.path().join("processed");
        seed_capture(&raw, "capture_a", &[(10, 0.0), (20, 1.0), (30, 0.0), (40, 1.0)]);

        let mut config = test_config(&raw, &out);
        config.validation_split = 0.0;
        config.test_split = 0.0;
        config.augment_train_data = true;
        prepare_data(&config).unwrap();

        let train = Dataset::load(&out.join("train"), 2, 4, false, 1).unwrap();
        assert_eq!(train.len(), 8);
    }

    #[test]
    fn test_flip_reverses_rows() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw");
        let out = dir.path().join("processed");

        // one frame with a bright left edge
        let capture = raw.join("capture_a");
        std::fs::create_dir_all(&capture).unwrap();
        let mut image = Array2::from_elem((IMAGE_SIZE, IMAGE_SIZE), 0u8);
        image.column_mut(0).fill(255);
        write_grayscale(capture.join("frame.gs"), &image).unwrap();
        let mut index = std::fs::File::create(capture.join("labels.csv")).unwrap();
        writeln!(index, "file;label").unwrap();
        writeln!(index, "frame.gs;1.0").unwrap();

        let mut config = test_config(&raw, &out);
        config.validation_split = 0.0;
        config.test_split = 0.0;
        config.augment_train_data = true;
        prepare_data(&config).unwrap();

        let original = read_grayscale(out.join("train/features/train_000000.gs"), IMAGE_SIZE)
            .unwrap();
        let flipped = read_grayscale(out.join("train/features/train_000001.gs"), IMAGE_SIZE)
            .unwrap();
        assert_eq!(original[[0, 0]], 255);
        assert_eq!(flipped[[0, IMAGE_SIZE - 1]], 255);
        assert_eq!(flipped[[0, 0]], 0);
    }

    #[test]
    fn test_missing_raw_dir_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir.path().join("nope"), &dir.path().join("out"));
        assert!(prepare_data(&config).is_err());
    }
}
