//! The quantized artifact
//!
//! A single binary file: scale/zero-point metadata, int8 weight tensors and an
//! ordered op list. Everything the on-device interpreter needs, nothing else.

use std::fs;
use std::path::Path;

use ndarray::{Array2, Array3, Array4};
use serde::{Deserialize, Serialize};

use crate::error::{PotholeError, Result};
use crate::network::layers::Padding;

pub const ARTIFACT_FORMAT: &str = "potholenet-int8";
pub const ARTIFACT_VERSION: u32 = 1;

/// Affine quantization parameters of one tensor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantParams {
    pub scale: f32,
    pub zero_point: i32,
}

impl QuantParams {
    pub fn quantize(&self, value: f32) -> i8 {
        ((value / self.scale).round() as i32 + self.zero_point).clamp(-128, 127) as i8
    }

    pub fn dequantize(&self, q: i8) -> f32 {
        (q as i32 - self.zero_point) as f32 * self.scale
    }
}

/// Shape and quantization of an input or output tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub shape: Vec<usize>,
    pub params: QuantParams,
}

/// One executable operation of the quantized graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QuantOp {
    /// Spatial padding filled with the current tensor's zero point
    Pad { padding: Padding },
    /// Standard convolution, int8 weights `[kh, kw, cin, cout]` with
    /// per-output-channel symmetric scales and int32 biases
    Conv2d {
        weights: Array4<i8>,
        stride: usize,
        weight_scales: Vec<f32>,
        bias: Vec<i32>,
        output: QuantParams,
        relu6: bool,
    },
    /// Depthwise convolution, int8 weights `[kh, kw, c]`
    DepthwiseConv2d {
        weights: Array3<i8>,
        stride: usize,
        weight_scales: Vec<f32>,
        bias: Vec<i32>,
        output: QuantParams,
        relu6: bool,
    },
    /// Global average pooling; quantization parameters pass through
    AveragePool,
    /// Fully connected layer on the pooled features
    Dense {
        weights: Array2<i8>,
        weight_scales: Vec<f32>,
        bias: Vec<i32>,
        output: QuantParams,
    },
    /// Softmax with a fixed int8 probability encoding
    Softmax { output: QuantParams },
}

/// The complete quantized model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantizedModel {
    pub format: String,
    pub version: u32,
    pub classes: usize,
    pub input: TensorSpec,
    pub output: TensorSpec,
    pub ops: Vec<QuantOp>,
}

impl QuantizedModel {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let model: QuantizedModel = bincode::deserialize(bytes)?;
        if model.format != ARTIFACT_FORMAT || model.version != ARTIFACT_VERSION {
            return Err(PotholeError::SerializationError(format!(
                "unsupported artifact format {} v{}",
                model.format, model.version
            )));
        }
        Ok(model)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| {
            PotholeError::SerializationError(format!(
                "cannot read artifact {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_bytes(&bytes)
    }
}
