//! Raw grayscale image blobs
//!
//! Feature files are headerless byte dumps, one byte per pixel, row-major.
//! The width is fixed by convention and the height falls out of the file
//! length.

use std::fs;
use std::path::Path;

use ndarray::Array2;

use crate::error::{PotholeError, Result};

/// Read a raw grayscale blob with the given row width.
pub fn read_grayscale<P: AsRef<Path>>(path: P, width: usize) -> Result<Array2<u8>> {
    let bytes = fs::read(path.as_ref()).map_err(|e| {
        PotholeError::DataError(format!(
            "cannot read grayscale file {}: {}",
            path.as_ref().display(),
            e
        ))
    })?;
    if width == 0 || bytes.len() % width != 0 {
        return Err(PotholeError::DataError(format!(
            "grayscale file {} has {} bytes, not a multiple of width {}",
            path.as_ref().display(),
            bytes.len(),
            width
        )));
    }
    let height = bytes.len() / width;
    Ok(Array2::from_shape_vec((height, width), bytes)?)
}

/// Write a raw grayscale blob.
pub fn write_grayscale<P: AsRef<Path>>(path: P, image: &Array2<u8>) -> Result<()> {
    let bytes: Vec<u8> = image.iter().copied().collect();
    fs::write(path, bytes)?;
    Ok(())
}
