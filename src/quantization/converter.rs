//! Float-to-int8 conversion
//!
//! Folds every batch norm into its preceding convolution, quantizes weights
//! per output channel (symmetric, zero point 0), biases to int32 at the
//! product of input and weight scales, and activations per tensor from the
//! calibrated ranges. The softmax output keeps a fixed 1/256 encoding so int8
//! probabilities mean the same thing in every artifact. The artifact is
//! serialized fully before a single write; a failed conversion leaves nothing
//! behind.

use std::fs;
use std::path::Path;

use ndarray::{s, Array2, Array3, Array4, Axis};
use tracing::info;

use crate::config::PipelineConfig;
use crate::error::{PotholeError, Result};
use crate::network::layers::BatchNorm2d;
use crate::network::DefectNet;
use crate::quantization::artifact::{
    QuantOp, QuantParams, QuantizedModel, TensorSpec, ARTIFACT_FORMAT, ARTIFACT_VERSION,
};
use crate::quantization::calibration::{ActivationObserver, RepresentativeDataset, TensorStats};

/// Convert the saved model at `model_save_path` and write the artifact to
/// `tflite_model_path`.
pub fn convert_saved_model(config: &PipelineConfig) -> Result<()> {
    let mut model = DefectNet::load(Path::new(&config.model_save_path))?;
    let rep = RepresentativeDataset::from_training_split(config)?;
    let artifact = convert(&mut model, &rep)?;
    let bytes = artifact.to_bytes()?;

    let path = Path::new(&config.tflite_model_path);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, &bytes)?;
    info!(
        path = %path.display(),
        bytes = bytes.len(),
        ops = artifact.ops.len(),
        "artifact written"
    );
    Ok(())
}

/// Build the quantized graph from a fitted model and calibration data.
pub fn convert(model: &mut DefectNet, rep: &RepresentativeDataset) -> Result<QuantizedModel> {
    if !model.is_fitted() {
        return Err(PotholeError::QuantizationError(
            "model is not fitted".to_string(),
        ));
    }

    let mut observer = ActivationObserver::new();
    for batch in rep.iter() {
        model.forward_observed(batch, &mut observer);
    }

    let input_params = activation_params(observer.stats("input")?)?;
    let mut ops = Vec::new();
    let mut current = input_params;

    // stem conv with its batch norm folded in
    let stem_out = activation_params(observer.stats("stem")?)?;
    let (folded_w, folded_b) = fold_bn_conv(&model.stem.weights, &model.stem_bn);
    let (weights, weight_scales) = quantize_conv_weights(&folded_w);
    let bias = quantize_bias(&folded_b, current.scale, &weight_scales);
    ops.push(QuantOp::Pad {
        padding: model.stem.padding,
    });
    ops.push(QuantOp::Conv2d {
        weights,
        stride: model.stem.stride,
        weight_scales,
        bias,
        output: stem_out,
        relu6: true,
    });
    current = stem_out;

    for (i, block) in model.blocks.iter().enumerate() {
        let dw_out = activation_params(observer.stats(&format!("block{}_dw", i))?)?;
        let (folded_w, folded_b) = fold_bn_depthwise(&block.depthwise.weights, &block.bn);
        let (weights, weight_scales) = quantize_depthwise_weights(&folded_w);
        let bias = quantize_bias(&folded_b, current.scale, &weight_scales);
        ops.push(QuantOp::Pad {
            padding: block.depthwise.padding,
        });
        ops.push(QuantOp::DepthwiseConv2d {
            weights,
            stride: block.depthwise.stride,
            weight_scales,
            bias,
            output: dw_out,
            relu6: true,
        });
        current = dw_out;

        // the pointwise conv carries its own bias and no batch norm
        let pw_out = activation_params(observer.stats(&format!("block{}_pw", i))?)?;
        let w4 = block
            .pointwise
            .weights
            .clone()
            .insert_axis(Axis(0))
            .insert_axis(Axis(0));
        let (weights, weight_scales) = quantize_conv_weights(&w4);
        let bias = quantize_bias(
            block.pointwise.bias.as_slice().unwrap(),
            current.scale,
            &weight_scales,
        );
        ops.push(QuantOp::Conv2d {
            weights,
            stride: 1,
            weight_scales,
            bias,
            output: pw_out,
            relu6: true,
        });
        current = pw_out;
    }

    // pooling keeps the incoming quantization
    ops.push(QuantOp::AveragePool);

    let logits_params = activation_params(observer.stats("logits")?)?;
    let (weights, weight_scales) = quantize_dense_weights(&model.dense.weights);
    let bias = quantize_bias(
        model.dense.bias.as_slice().unwrap(),
        current.scale,
        &weight_scales,
    );
    ops.push(QuantOp::Dense {
        weights,
        weight_scales,
        bias,
        output: logits_params,
    });

    let output_params = QuantParams {
        scale: 1.0 / 256.0,
        zero_point: -128,
    };
    ops.push(QuantOp::Softmax {
        output: output_params,
    });

    Ok(QuantizedModel {
        format: ARTIFACT_FORMAT.to_string(),
        version: ARTIFACT_VERSION,
        classes: model.classes(),
        input: TensorSpec {
            shape: vec![1, 96, 96, 1],
            params: input_params,
        },
        output: TensorSpec {
            shape: vec![1, model.classes()],
            params: output_params,
        },
        ops,
    })
}

/// Asymmetric per-tensor activation parameters from an observed range. Zero
/// must stay exactly representable.
pub(crate) fn activation_params(stats: &TensorStats) -> Result<QuantParams> {
    if !stats.is_finite() {
        return Err(PotholeError::QuantizationError(format!(
            "non-finite observed range [{}, {}]",
            stats.min, stats.max
        )));
    }
    let min = stats.min.min(0.0);
    let max = stats.max.max(0.0);
    let scale = ((max - min) / 255.0).max(1e-6);
    let zero_point = (-128.0 - min / scale).round().clamp(-128.0, 127.0) as i32;
    Ok(QuantParams { scale, zero_point })
}

fn symmetric_scale(max_abs: f32) -> f32 {
    if max_abs > 0.0 {
        max_abs / 127.0
    } else {
        1.0
    }
}

fn quantize_value(value: f32, scale: f32) -> i8 {
    ((value / scale).round() as i32).clamp(-127, 127) as i8
}

fn quantize_conv_weights(weights: &Array4<f32>) -> (Array4<i8>, Vec<f32>) {
    let cout = weights.len_of(Axis(3));
    let mut scales = Vec::with_capacity(cout);
    for c in 0..cout {
        let max_abs = weights
            .slice(s![.., .., .., c])
            .iter()
            .fold(0.0f32, |a, w| a.max(w.abs()));
        scales.push(symmetric_scale(max_abs));
    }
    let q = Array4::from_shape_fn(weights.raw_dim(), |(ky, kx, ic, oc)| {
        quantize_value(weights[[ky, kx, ic, oc]], scales[oc])
    });
    (q, scales)
}

fn quantize_depthwise_weights(weights: &Array3<f32>) -> (Array3<i8>, Vec<f32>) {
    let channels = weights.len_of(Axis(2));
    let mut scales = Vec::with_capacity(channels);
    for c in 0..channels {
        let max_abs = weights
            .slice(s![.., .., c])
            .iter()
            .fold(0.0f32, |a, w| a.max(w.abs()));
        scales.push(symmetric_scale(max_abs));
    }
    let q = Array3::from_shape_fn(weights.raw_dim(), |(ky, kx, c)| {
        quantize_value(weights[[ky, kx, c]], scales[c])
    });
    (q, scales)
}

fn quantize_dense_weights(weights: &Array2<f32>) -> (Array2<i8>, Vec<f32>) {
    let cout = weights.ncols();
    let mut scales = Vec::with_capacity(cout);
    for c in 0..cout {
        let max_abs = weights.column(c).iter().fold(0.0f32, |a, w| a.max(w.abs()));
        scales.push(symmetric_scale(max_abs));
    }
    let q = Array2::from_shape_fn(weights.raw_dim(), |(i, c)| {
        quantize_value(weights[[i, c]], scales[c])
    });
    (q, scales)
}

fn quantize_bias(bias: &[f32], input_scale: f32, weight_scales: &[f32]) -> Vec<i32> {
    bias.iter()
        .zip(weight_scales)
        .map(|(b, ws)| {
            (b / (input_scale * ws))
                .round()
                .clamp(i32::MIN as f32, i32::MAX as f32) as i32
        })
        .collect()
}

fn fold_bn_conv(weights: &Array4<f32>, bn: &BatchNorm2d) -> (Array4<f32>, Vec<f32>) {
    let cout = weights.len_of(Axis(3));
    let mut folded = weights.clone();
    let mut bias = vec![0.0; cout];
    for c in 0..cout {
        let factor = bn.gamma[c] / (bn.running_var[c] + bn.eps).sqrt();
        folded.slice_mut(s![.., .., .., c]).mapv_inplace(|w| w * factor);
        bias[c] = bn.beta[c] - bn.running_mean[c] * factor;
    }
    (folded, bias)
}

fn fold_bn_depthwise(weights: &Array3<f32>, bn: &BatchNorm2d) -> (Array3<f32>, Vec<f32>) {
    let channels = weights.len_of(Axis(2));
    let mut folded = weights.clone();
    let mut bias = vec![0.0; channels];
    for c in 0..channels {
        let factor = bn.gamma[c] / (bn.running_var[c] + bn.eps).sqrt();
        folded.slice_mut(s![.., .., c]).mapv_inplace(|w| w * factor);
        bias[c] = bn.beta[c] - bn.running_mean[c] * factor;
    }
    (folded, bias)
}
