//! Split loader and batch pipeline
//!
//! A split directory holds `features/` (raw 96x96 grayscale blobs, consumed in
//! lexicographic order) and `labels.csv` (one `;`-delimited class id per row).
//! Pixels are re-centered from u8 to i8 by subtracting 128, which is also the
//! exact input encoding of the quantized artifact. Batching goes through a
//! bounded shuffle buffer, optionally repeating forever for training.

use std::path::Path;

use ndarray::{Array2, Array4, ArrayView1, ArrayView3, Axis};
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::data::grayscale::read_grayscale;
use crate::error::{PotholeError, Result};

/// Fixed input width and height of every frame
pub const IMAGE_SIZE: usize = 96;

/// Capacity of the shuffle buffer
const SHUFFLE_BUFFER: usize = 10_000;

/// An in-memory split with its batching parameters
#[derive(Debug, Clone)]
pub struct Dataset {
    images: Array4<i8>,
    labels: Array2<f32>,
    batch_size: usize,
    repeat: bool,
    seed: u64,
}

/// One batch of samples, cast to f32 for the float network
#[derive(Debug, Clone)]
pub struct Batch {
    pub images: Array4<f32>,
    pub labels: Array2<f32>,
}

impl Dataset {
    /// Load a split directory. Fatal on a missing directory, a feature file of
    /// the wrong size, a malformed or non-finite label, or a label/image count
    /// mismatch.
    pub fn load(
        data_path: &Path,
        classes: usize,
        batch_size: usize,
        repeat: bool,
        seed: u64,
    ) -> Result<Self> {
        let features_dir = data_path.join("features");
        let mut files: Vec<_> = std::fs::read_dir(&features_dir)
            .map_err(|e| {
                PotholeError::DataError(format!(
                    "cannot read features dir {}: {}",
                    features_dir.display(),
                    e
                ))
            })?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .map(|entry| entry.path())
            .filter(|p| p.is_file())
            .collect();
        files.sort();
        if files.is_empty() {
            return Err(PotholeError::DataError(format!(
                "no feature files in {}",
                features_dir.display()
            )));
        }

        let label_values = read_labels(&data_path.join("labels.csv"))?;
        if label_values.len() != files.len() {
            return Err(PotholeError::DataError(format!(
                "{} labels for {} feature files in {}",
                label_values.len(),
                files.len(),
                data_path.display()
            )));
        }

        let n = files.len();
        let mut images = Array4::<i8>::zeros((n, IMAGE_SIZE, IMAGE_SIZE, 1));
        for (i, file) in files.iter().enumerate() {
            let raw = read_grayscale(file, IMAGE_SIZE)?;
            if raw.dim() != (IMAGE_SIZE, IMAGE_SIZE) {
                return Err(PotholeError::ShapeError {
                    expected: format!("{}x{}", IMAGE_SIZE, IMAGE_SIZE),
                    actual: format!("{}x{} ({})", raw.dim().0, raw.dim().1, file.display()),
                });
            }
            let mut dst = images.index_axis_mut(Axis(0), i);
            for (r, row) in raw.outer_iter().enumerate() {
                for (c, &pixel) in row.iter().enumerate() {
                    dst[[r, c, 0]] = (pixel as i16 - 128) as i8;
                }
            }
        }

        let mut labels = Array2::<f32>::zeros((n, classes));
        for (i, &value) in label_values.iter().enumerate() {
            let class = value.round();
            if class < 0.0 || class as usize >= classes {
                return Err(PotholeError::DataError(format!(
                    "label {} out of range for {} classes",
                    value, classes
                )));
            }
            labels[[i, class as usize]] = 1.0;
        }

        Ok(Self {
            images,
            labels,
            batch_size,
            repeat,
            seed,
        })
    }

    /// Number of samples in the split
    pub fn len(&self) -> usize {
        self.images.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn classes(&self) -> usize {
        self.labels.ncols()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// A fresh batch iterator. Infinite when the split repeats, one pass over
    /// every sample otherwise (last batch may be short).
    pub fn batches(&self) -> BatchIter<'_> {
        BatchIter {
            dataset: self,
            rng: Xoshiro256PlusPlus::seed_from_u64(self.seed),
            buffer: Vec::new(),
            next_index: 0,
        }
    }

    /// Raw int8 samples in stored order, one at a time
    pub fn samples(&self) -> impl Iterator<Item = (ArrayView3<'_, i8>, ArrayView1<'_, f32>)> {
        self.images.outer_iter().zip(self.labels.outer_iter())
    }
}

fn read_labels(path: &Path) -> Result<Vec<f32>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(false)
        .from_path(path)
        .map_err(|e| {
            PotholeError::DataError(format!("cannot read labels {}: {}", path.display(), e))
        })?;
    let mut labels = Vec::new();
    for record in reader.records() {
        let record = record?;
        let field = record.get(0).unwrap_or("");
        let value: f32 = field.trim().parse().map_err(|_| {
            PotholeError::DataError(format!("malformed label {:?} in {}", field, path.display()))
        })?;
        if !value.is_finite() {
            return Err(PotholeError::DataError(format!(
                "non-finite label in {}",
                path.display()
            )));
        }
        labels.push(value);
    }
    Ok(labels)
}

/// Batch iterator with a bounded shuffle buffer
pub struct BatchIter<'a> {
    dataset: &'a Dataset,
    rng: Xoshiro256PlusPlus,
    buffer: Vec<usize>,
    next_index: usize,
}

impl BatchIter<'_> {
    fn next_sample(&mut self) -> Option<usize> {
        let n = self.dataset.len();
        while self.buffer.len() < SHUFFLE_BUFFER {
            if self.next_index == n {
                if !self.dataset.repeat {
                    break;
                }
                self.next_index = 0;
            }
            self.buffer.push(self.next_index);
            self.next_index += 1;
        }
        if self.buffer.is_empty() {
            return None;
        }
        let pick = self.rng.gen_range(0..self.buffer.len());
        Some(self.buffer.swap_remove(pick))
    }
}

impl Iterator for BatchIter<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        let mut picked = Vec::with_capacity(self.dataset.batch_size);
        while picked.len() < self.dataset.batch_size {
            match self.next_sample() {
                Some(idx) => picked.push(idx),
                None => break,
            }
        }
        if picked.is_empty() {
            return None;
        }

        let (_, h, w, c) = self.dataset.images.dim();
        let mut images = Array4::<f32>::zeros((picked.len(), h, w, c));
        let mut labels = Array2::<f32>::zeros((picked.len(), self.dataset.classes()));
        for (bi, &si) in picked.iter().enumerate() {
            images
                .index_axis_mut(Axis(0), bi)
                .zip_mut_with(&self.dataset.images.index_axis(Axis(0), si), |d, &s| {
                    *d = s as f32
                });
            labels
                .index_axis_mut(Axis(0), bi)
                .assign(&self.dataset.labels.index_axis(Axis(0), si));
        }
        Some(Batch { images, labels })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::grayscale::write_grayscale;
    use ndarray::Array2 as Image;
    use std::io::Write;

    fn write_split(dir: &Path, pixels: &[u8], labels: &[&str]) {
        let features = dir.join("features");
        std::fs::create_dir_all(&features).unwrap();
        for (i, &fill) in pixels.iter().enumerate() {
            let image = Image::from_elem((IMAGE_SIZE, IMAGE_SIZE), fill);
            write_grayscale(features.join(format!("frame_{:06}.gs", i)), &image).unwrap();
        }
        let mut f = std::fs::File::create(dir.join("labels.csv")).unwrap();
        for label in labels {
            writeln!(f, "{}", label).unwrap();
        }
    }

    #[test]
    fn test_load_recenters_pixels() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), &[0, 255, 128], &["0.0", "1.0", "0.0"]);
        let ds = Dataset::load(dir.path(), 2, 2, false, 42).unwrap();
        assert_eq!(ds.len(), 3);

        let values: Vec<i8> = ds.samples().map(|(img, _)| img[[0, 0, 0]]).collect();
        assert_eq!(values, vec![-128, 127, 0]);

        let onehot: Vec<(f32, f32)> = ds.samples().map(|(_, l)| (l[0], l[1])).collect();
        assert_eq!(onehot, vec![(1.0, 0.0), (0.0, 1.0), (1.0, 0.0)]);
    }

    #[test]
    fn test_one_pass_yields_every_sample_once() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), &[10, 20, 30, 40, 50], &["0", "1", "0", "1", "0"]);
        let ds = Dataset::load(dir.path(), 2, 2, false, 7).unwrap();

        let batches: Vec<Batch> = ds.batches().collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].images.len_of(Axis(0)), 1);
        let total: usize = batches.iter().map(|b| b.images.len_of(Axis(0))).sum();
        assert_eq!(total, 5);

        // every stored pixel value shows up exactly once, shuffled
        let mut seen: Vec<i32> = batches
            .iter()
            .flat_map(|b| {
                b.images
                    .axis_iter(Axis(0))
                    .map(|img| img[[0, 0, 0]] as i32 + 128)
                    .collect::<Vec<_>>()
            })
            .collect();
        seen.sort();
        assert_eq!(seen, vec![10, 20, 30, 40, 50]);
    }

    #[test]
    fn test_repeat_is_unbounded() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), &[1, 2], &["0", "1"]);
        let ds = Dataset::load(dir.path(), 2, 2, true, 42).unwrap();
        let batches: Vec<Batch> = ds.batches().take(10).collect();
        assert_eq!(batches.len(), 10);
    }

    #[test]
    fn test_malformed_label_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), &[1, 2], &["0", "not-a-number"]);
        let err = Dataset::load(dir.path(), 2, 2, false, 42).unwrap_err();
        assert!(matches!(err, PotholeError::DataError(_)));
    }

    #[test]
    fn test_non_finite_label_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), &[1], &["NaN"]);
        assert!(Dataset::load(dir.path(), 2, 2, false, 42).is_err());
    }

    #[test]
    fn test_count_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), &[1, 2, 3], &["0", "1"]);
        assert!(Dataset::load(dir.path(), 2, 2, false, 42).is_err());
    }

    #[test]
    fn test_missing_split_dir_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Dataset::load(&dir.path().join("nope"), 2, 2, false, 42).is_err());
    }
}
