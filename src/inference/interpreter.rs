//! Minimal int8 interpreter
//!
//! Executes the artifact's op list on one sample at a time: int8 tensors,
//! int32 accumulators, padding filled with the zero point, per-channel
//! requantization multipliers and a fused ReLU6 clamp on conv outputs.

use std::path::Path;

use ndarray::{Array1, Array3, Array4};

use crate::error::{PotholeError, Result};
use crate::network::layers::Padding;
use crate::quantization::artifact::{QuantOp, QuantParams, QuantizedModel, TensorSpec};

pub struct Interpreter {
    model: QuantizedModel,
}

impl Interpreter {
    pub fn new(model: QuantizedModel) -> Self {
        Self { model }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Ok(Self::new(QuantizedModel::from_file(path)?))
    }

    pub fn classes(&self) -> usize {
        self.model.classes
    }

    pub fn input_spec(&self) -> &TensorSpec {
        &self.model.input
    }

    pub fn output_spec(&self) -> &TensorSpec {
        &self.model.output
    }

    /// Run one int8 image through the graph, returning the int8 class vector.
    pub fn run(&self, image: &Array3<i8>) -> Result<Array1<i8>> {
        let expected = &self.model.input.shape;
        if expected.len() != 4 || image.dim() != (expected[1], expected[2], expected[3]) {
            return Err(PotholeError::ShapeError {
                expected: format!("{:?}", &expected[1..]),
                actual: format!("{:?}", image.shape()),
            });
        }

        let mut act = image.clone();
        let mut params = self.model.input.params;
        for op in &self.model.ops {
            match op {
                QuantOp::Pad { padding } => {
                    act = pad_i8(&act, *padding, params.zero_point.clamp(-128, 127) as i8);
                }
                QuantOp::Conv2d {
                    weights,
                    stride,
                    weight_scales,
                    bias,
                    output,
                    relu6,
                } => {
                    act = conv_i8(
                        &act,
                        weights,
                        *stride,
                        params,
                        weight_scales,
                        bias,
                        *output,
                        *relu6,
                    )?;
                    params = *output;
                }
                QuantOp::DepthwiseConv2d {
                    weights,
                    stride,
                    weight_scales,
                    bias,
                    output,
                    relu6,
                } => {
                    act = depthwise_i8(
                        &act,
                        weights,
                        *stride,
                        params,
                        weight_scales,
                        bias,
                        *output,
                        *relu6,
                    )?;
                    params = *output;
                }
                QuantOp::AveragePool => {
                    act = average_pool_i8(&act, params);
                }
                QuantOp::Dense {
                    weights,
                    weight_scales,
                    bias,
                    output,
                } => {
                    act = dense_i8(&act, weights, params, weight_scales, bias, *output)?;
                    params = *output;
                }
                QuantOp::Softmax { output } => {
                    act = softmax_i8(&act, params, *output);
                    params = *output;
                }
            }
        }

        let (h, w, c) = act.dim();
        if h != 1 || w != 1 || c != self.model.classes {
            return Err(PotholeError::InferenceError(format!(
                "graph produced {:?} instead of {} classes",
                act.shape(),
                self.model.classes
            )));
        }
        Ok(act.into_shape_with_order(c)?)
    }
}

fn pad_i8(input: &Array3<i8>, pad: Padding, fill: i8) -> Array3<i8> {
    if pad.is_none() {
        return input.clone();
    }
    let (h, w, c) = input.dim();
    let mut out = Array3::from_elem((h + pad.top + pad.bottom, w + pad.left + pad.right, c), fill);
    out.slice_mut(ndarray::s![pad.top..pad.top + h, pad.left..pad.left + w, ..])
        .assign(input);
    out
}

fn fused_clamp(out: QuantParams, relu6: bool) -> (i32, i32) {
    if relu6 {
        (out.quantize(0.0) as i32, out.quantize(6.0) as i32)
    } else {
        (-128, 127)
    }
}

#[allow(clippy::too_many_arguments)]
fn conv_i8(
    input: &Array3<i8>,
    weights: &Array4<i8>,
    stride: usize,
    in_params: QuantParams,
    weight_scales: &[f32],
    bias: &[i32],
    out: QuantParams,
    relu6: bool,
) -> Result<Array3<i8>> {
    let (h, w, cin) = input.dim();
    let (kh, kw, wcin, cout) = weights.dim();
    if wcin != cin || h < kh || w < kw {
        return Err(PotholeError::InferenceError(format!(
            "conv weights {:?} do not fit activation {:?}",
            weights.shape(),
            input.shape()
        )));
    }
    let oh = (h - kh) / stride + 1;
    let ow = (w - kw) / stride + 1;
    let zp_in = in_params.zero_point;
    let (lo, hi) = fused_clamp(out, relu6);

    let mut result = Array3::<i8>::zeros((oh, ow, cout));
    for y in 0..oh {
        for x in 0..ow {
            for oc in 0..cout {
                let mut acc = bias[oc];
                for ky in 0..kh {
                    for kx in 0..kw {
                        for ic in 0..cin {
                            let q = input[[y * stride + ky, x * stride + kx, ic]] as i32;
                            acc += (q - zp_in) * weights[[ky, kx, ic, oc]] as i32;
                        }
                    }
                }
                let m = in_params.scale * weight_scales[oc] / out.scale;
                let q = (acc as f32 * m).round() as i32 + out.zero_point;
                result[[y, x, oc]] = q.clamp(lo, hi) as i8;
            }
        }
    }
    Ok(result)
}

#[allow(clippy::too_many_arguments)]
fn depthwise_i8(
    input: &Array3<i8>,
    weights: &ndarray::Array3<i8>,
    stride: usize,
    in_params: QuantParams,
    weight_scales: &[f32],
    bias: &[i32],
    out: QuantParams,
    relu6: bool,
) -> Result<Array3<i8>> {
    let (h, w, c) = input.dim();
    let (kh, kw, wc) = weights.dim();
    if wc != c || h < kh || w < kw {
        return Err(PotholeError::InferenceError(format!(
            "depthwise weights {:?} do not fit activation {:?}",
            weights.shape(),
            input.shape()
        )));
    }
    let oh = (h - kh) / stride + 1;
    let ow = (w - kw) / stride + 1;
    let zp_in = in_params.zero_point;
    let (lo, hi) = fused_clamp(out, relu6);

    let mut result = Array3::<i8>::zeros((oh, ow, c));
    for y in 0..oh {
        for x in 0..ow {
            for ch in 0..c {
                let mut acc = bias[ch];
                for ky in 0..kh {
                    for kx in 0..kw {
                        let q = input[[y * stride + ky, x * stride + kx, ch]] as i32;
                        acc += (q - zp_in) * weights[[ky, kx, ch]] as i32;
                    }
                }
                let m = in_params.scale * weight_scales[ch] / out.scale;
                let q = (acc as f32 * m).round() as i32 + out.zero_point;
                result[[y, x, ch]] = q.clamp(lo, hi) as i8;
            }
        }
    }
    Ok(result)
}

fn average_pool_i8(input: &Array3<i8>, params: QuantParams) -> Array3<i8> {
    let (h, w, c) = input.dim();
    let count = (h * w) as f32;
    let zp = params.zero_point;
    let mut out = Array3::<i8>::zeros((1, 1, c));
    for ch in 0..c {
        let mut sum = 0i32;
        for y in 0..h {
            for x in 0..w {
                sum += input[[y, x, ch]] as i32 - zp;
            }
        }
        let q = (sum as f32 / count).round() as i32 + zp;
        out[[0, 0, ch]] = q.clamp(-128, 127) as i8;
    }
    out
}

fn dense_i8(
    input: &Array3<i8>,
    weights: &ndarray::Array2<i8>,
    in_params: QuantParams,
    weight_scales: &[f32],
    bias: &[i32],
    out: QuantParams,
) -> Result<Array3<i8>> {
    let (h, w, cin) = input.dim();
    if h != 1 || w != 1 || weights.nrows() != cin {
        return Err(PotholeError::InferenceError(format!(
            "dense weights {:?} do not fit activation {:?}",
            weights.shape(),
            input.shape()
        )));
    }
    let cout = weights.ncols();
    let zp_in = in_params.zero_point;

    let mut result = Array3::<i8>::zeros((1, 1, cout));
    for oc in 0..cout {
        let mut acc = bias[oc];
        for ic in 0..cin {
            acc += (input[[0, 0, ic]] as i32 - zp_in) * weights[[ic, oc]] as i32;
        }
        let m = in_params.scale * weight_scales[oc] / out.scale;
        let q = (acc as f32 * m).round() as i32 + out.zero_point;
        result[[0, 0, oc]] = q.clamp(-128, 127) as i8;
    }
    Ok(result)
}

fn softmax_i8(input: &Array3<i8>, in_params: QuantParams, out: QuantParams) -> Array3<i8> {
    let logits: Vec<f32> = input.iter().map(|&q| in_params.dequantize(q)).collect();
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    let mut result = Array3::<i8>::zeros(input.raw_dim());
    for (dst, e) in result.iter_mut().zip(&exps) {
        *dst = out.quantize(e / sum);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantization::artifact::{ARTIFACT_FORMAT, ARTIFACT_VERSION};

    fn unit_params() -> QuantParams {
        QuantParams {
            scale: 1.0,
            zero_point: 0,
        }
    }

    #[test]
    fn test_pad_fills_zero_point() {
        let input = Array3::from_elem((2, 2, 1), 5i8);
        let out = pad_i8(&input, Padding::SAME_S2, -7);
        assert_eq!(out.dim(), (3, 3, 1));
        assert_eq!(out[[2, 0, 0]], -7);
        assert_eq!(out[[0, 2, 0]], -7);
        assert_eq!(out[[1, 1, 0]], 5);
    }

    #[test]
    fn test_identity_conv_requantization() {
        // 1x1 conv with real weight 1.0 (q=127, scale=1/127) between two
        // unit-scale tensors must reproduce its input
        let input = Array3::from_shape_vec((1, 3, 1), vec![-5i8, 0, 42]).unwrap();
        let weights = Array4::from_elem((1, 1, 1, 1), 127i8);
        let out = conv_i8(
            &input,
            &weights,
            1,
            unit_params(),
            &[1.0 / 127.0],
            &[0],
            unit_params(),
            false,
        )
        .unwrap();
        assert_eq!(out.as_slice().unwrap(), &[-5, 0, 42]);
    }

    #[test]
    fn test_fused_relu6_clamps_negative_accumulators() {
        // output encodes [0, 6] across the int8 range
        let out_params = QuantParams {
            scale: 6.0 / 255.0,
            zero_point: -128,
        };
        let input = Array3::from_shape_vec((1, 2, 1), vec![-40i8, 40]).unwrap();
        let weights = Array4::from_elem((1, 1, 1, 1), 127i8);
        let out = conv_i8(
            &input,
            &weights,
            1,
            unit_params(),
            &[1.0 / 127.0],
            &[0],
            out_params,
            true,
        )
        .unwrap();
        // -40 clamps to q(0), +40 saturates at q(6)
        assert_eq!(out[[0, 0, 0]], -128);
        assert_eq!(out[[0, 1, 0]], 127);
    }

    #[test]
    fn test_depthwise_counts_per_channel() {
        let input = Array3::from_elem((3, 3, 2), 1i8);
        let mut weights = ndarray::Array3::<i8>::zeros((3, 3, 2));
        weights.fill(1);
        let out = depthwise_i8(
            &input,
            &weights,
            1,
            unit_params(),
            &[1.0, 1.0],
            &[0, 0],
            unit_params(),
            false,
        )
        .unwrap();
        // 9 taps of 1*1 per channel
        assert_eq!(out.dim(), (1, 1, 2));
        assert_eq!(out[[0, 0, 0]], 9);
        assert_eq!(out[[0, 0, 1]], 9);
    }

    #[test]
    fn test_average_pool_rounds_to_nearest() {
        let input = Array3::from_shape_vec((2, 2, 1), vec![1i8, 2, 3, 5]).unwrap();
        let out = average_pool_i8(&input, unit_params());
        // mean 2.75 rounds to 3
        assert_eq!(out[[0, 0, 0]], 3);
    }

    #[test]
    fn test_softmax_produces_fixed_encoding() {
        let out_params = QuantParams {
            scale: 1.0 / 256.0,
            zero_point: -128,
        };
        let input = Array3::from_shape_vec((1, 1, 2), vec![2i8, 0]).unwrap();
        let out = softmax_i8(&input, unit_params(), out_params);
        // softmax([2, 0]) = [0.881, 0.119] -> round(p * 256) - 128
        assert_eq!(out[[0, 0, 0]], 97);
        assert_eq!(out[[0, 0, 1]], -97);
        assert!(out[[0, 0, 0]] > out[[0, 0, 1]]);
    }

    #[test]
    fn test_run_checks_input_shape() {
        let model = QuantizedModel {
            format: ARTIFACT_FORMAT.to_string(),
            version: ARTIFACT_VERSION,
            classes: 2,
            input: TensorSpec {
                shape: vec![1, 96, 96, 1],
                params: unit_params(),
            },
            output: TensorSpec {
                shape: vec![1, 2],
                params: unit_params(),
            },
            ops: Vec::new(),
        };
        let interpreter = Interpreter::new(model);
        let wrong = Array3::<i8>::zeros((32, 32, 1));
        assert!(interpreter.run(&wrong).is_err());
    }
}
