//! Network layers
//!
//! Hand-rolled NHWC layers with explicit forward and backward passes. Forward
//! in training mode caches whatever the matching backward pass needs; eval
//! forward leaves the layer untouched. Gradients land in the layer until the
//! optimizer consumes them.

use ndarray::parallel::prelude::*;
use ndarray::{s, Array1, Array2, Array3, Array4, Axis};
use rand::Rng;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};

use crate::training::optimizer::Adam;

/// Explicit spatial zero padding, possibly asymmetric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Padding {
    pub top: usize,
    pub bottom: usize,
    pub left: usize,
    pub right: usize,
}

impl Padding {
    pub const NONE: Padding = Padding {
        top: 0,
        bottom: 0,
        left: 0,
        right: 0,
    };
    /// Same padding for a 3x3 kernel at stride 1
    pub const SAME_S1: Padding = Padding {
        top: 1,
        bottom: 1,
        left: 1,
        right: 1,
    };
    /// Same padding for a 3x3 kernel at stride 2 on an even input: one row at
    /// the bottom and one column at the right only
    pub const SAME_S2: Padding = Padding {
        top: 0,
        bottom: 1,
        left: 0,
        right: 1,
    };

    pub fn is_none(&self) -> bool {
        *self == Padding::NONE
    }
}

/// Pad an NHWC tensor spatially with a fill value.
pub fn pad_nhwc(input: &Array4<f32>, pad: Padding, fill: f32) -> Array4<f32> {
    if pad.is_none() {
        return input.clone();
    }
    let (n, h, w, c) = input.dim();
    let mut out = Array4::from_elem(
        (n, h + pad.top + pad.bottom, w + pad.left + pad.right, c),
        fill,
    );
    out.slice_mut(s![.., pad.top..pad.top + h, pad.left..pad.left + w, ..])
        .assign(input);
    out
}

fn crop_nhwc(grad: &Array4<f32>, pad: Padding, h: usize, w: usize) -> Array4<f32> {
    grad.slice(s![.., pad.top..pad.top + h, pad.left..pad.left + w, ..])
        .to_owned()
}

fn glorot_uniform(rng: &mut Xoshiro256PlusPlus, fan_in: usize, fan_out: usize, count: usize) -> Vec<f32> {
    let scale = (2.0 / (fan_in + fan_out) as f32).sqrt();
    (0..count)
        .map(|_| rng.gen::<f32>() * 2.0 * scale - scale)
        .collect()
}

fn channel_sum(x: &Array4<f32>) -> Array1<f32> {
    x.sum_axis(Axis(0)).sum_axis(Axis(0)).sum_axis(Axis(0))
}

/// Let the optimizer consume one gradient slot.
pub(crate) fn apply_update<D: ndarray::Dimension>(
    opt: &mut Adam,
    lr: f32,
    slot: &mut usize,
    param: &mut ndarray::Array<f32, D>,
    grad: &mut Option<ndarray::Array<f32, D>>,
) {
    if let Some(g) = grad.take() {
        opt.update(
            *slot,
            lr,
            param.as_slice_mut().unwrap(),
            g.as_slice().unwrap(),
        );
    }
    *slot += 1;
}

fn conv_nhwc(padded: &Array4<f32>, weights: &Array4<f32>, stride: usize) -> Array4<f32> {
    let (n, ph, pw, cin) = padded.dim();
    let (kh, kw, _, cout) = weights.dim();
    let oh = (ph - kh) / stride + 1;
    let ow = (pw - kw) / stride + 1;
    let mut out = Array4::<f32>::zeros((n, oh, ow, cout));
    out.outer_iter_mut()
        .into_par_iter()
        .zip(padded.outer_iter().into_par_iter())
        .for_each(|(mut out_n, in_n)| {
            for y in 0..oh {
                for x in 0..ow {
                    for ky in 0..kh {
                        for kx in 0..kw {
                            for ic in 0..cin {
                                let xv = in_n[[y * stride + ky, x * stride + kx, ic]];
                                for oc in 0..cout {
                                    out_n[[y, x, oc]] += xv * weights[[ky, kx, ic, oc]];
                                }
                            }
                        }
                    }
                }
            }
        });
    out
}

/// Standard convolution without bias (the stem)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conv2d {
    pub(crate) weights: Array4<f32>,
    pub(crate) stride: usize,
    pub(crate) padding: Padding,
    #[serde(skip)]
    grad_weights: Option<Array4<f32>>,
    #[serde(skip)]
    cache: Option<Array4<f32>>,
}

impl Conv2d {
    pub fn new(
        kernel: usize,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        padding: Padding,
        rng: &mut Xoshiro256PlusPlus,
    ) -> Self {
        let fan_in = kernel * kernel * in_channels;
        let fan_out = kernel * kernel * out_channels;
        let data = glorot_uniform(rng, fan_in, fan_out, fan_in * out_channels);
        Self {
            weights: Array4::from_shape_vec((kernel, kernel, in_channels, out_channels), data)
                .unwrap(),
            stride,
            padding,
            grad_weights: None,
            cache: None,
        }
    }

    pub fn out_channels(&self) -> usize {
        self.weights.len_of(Axis(3))
    }

    pub fn forward(&mut self, input: &Array4<f32>, train: bool) -> Array4<f32> {
        let padded = pad_nhwc(input, self.padding, 0.0);
        let out = conv_nhwc(&padded, &self.weights, self.stride);
        if train {
            self.cache = Some(padded);
        }
        out
    }

    pub fn backward(&mut self, grad_out: &Array4<f32>) -> Array4<f32> {
        let padded = self.cache.take().unwrap();
        let (kh, kw, cin, cout) = self.weights.dim();
        let (n, ph, pw, _) = padded.dim();
        let (_, oh, ow, _) = grad_out.dim();
        let stride = self.stride;

        let mut grad_w = Array4::<f32>::zeros((kh, kw, cin, cout));
        let mut grad_padded = Array4::<f32>::zeros((n, ph, pw, cin));
        for bi in 0..n {
            for y in 0..oh {
                for x in 0..ow {
                    for ky in 0..kh {
                        for kx in 0..kw {
                            let iy = y * stride + ky;
                            let ix = x * stride + kx;
                            for ic in 0..cin {
                                let xv = padded[[bi, iy, ix, ic]];
                                let mut acc = 0.0;
                                for oc in 0..cout {
                                    let g = grad_out[[bi, y, x, oc]];
                                    grad_w[[ky, kx, ic, oc]] += xv * g;
                                    acc += self.weights[[ky, kx, ic, oc]] * g;
                                }
                                grad_padded[[bi, iy, ix, ic]] += acc;
                            }
                        }
                    }
                }
            }
        }
        self.grad_weights = Some(grad_w);
        let h = ph - self.padding.top - self.padding.bottom;
        let w = pw - self.padding.left - self.padding.right;
        crop_nhwc(&grad_padded, self.padding, h, w)
    }

    pub fn apply_gradients(&mut self, opt: &mut Adam, lr: f32, slot: &mut usize) {
        apply_update(opt, lr, slot, &mut self.weights, &mut self.grad_weights);
    }
}

/// Depthwise 3x3 convolution without bias
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthwiseConv2d {
    pub(crate) weights: Array3<f32>,
    pub(crate) stride: usize,
    pub(crate) padding: Padding,
    #[serde(skip)]
    grad_weights: Option<Array3<f32>>,
    #[serde(skip)]
    cache: Option<Array4<f32>>,
}

impl DepthwiseConv2d {
    pub fn new(
        kernel: usize,
        channels: usize,
        stride: usize,
        padding: Padding,
        rng: &mut Xoshiro256PlusPlus,
    ) -> Self {
        let fan = kernel * kernel;
        let data = glorot_uniform(rng, fan, fan, fan * channels);
        Self {
            weights: Array3::from_shape_vec((kernel, kernel, channels), data).unwrap(),
            stride,
            padding,
            grad_weights: None,
            cache: None,
        }
    }

    pub fn forward(&mut self, input: &Array4<f32>, train: bool) -> Array4<f32> {
        let padded = pad_nhwc(input, self.padding, 0.0);
        let (n, ph, pw, c) = padded.dim();
        let (kh, kw, _) = self.weights.dim();
        let stride = self.stride;
        let oh = (ph - kh) / stride + 1;
        let ow = (pw - kw) / stride + 1;

        let mut out = Array4::<f32>::zeros((n, oh, ow, c));
        let weights = &self.weights;
        out.outer_iter_mut()
            .into_par_iter()
            .zip(padded.outer_iter().into_par_iter())
            .for_each(|(mut out_n, in_n)| {
                for y in 0..oh {
                    for x in 0..ow {
                        for ky in 0..kh {
                            for kx in 0..kw {
                                for ch in 0..c {
                                    out_n[[y, x, ch]] += in_n
                                        [[y * stride + ky, x * stride + kx, ch]]
                                        * weights[[ky, kx, ch]];
                                }
                            }
                        }
                    }
                }
            });
        if train {
            self.cache = Some(padded);
        }
        out
    }

    pub fn backward(&mut self, grad_out: &Array4<f32>) -> Array4<f32> {
        let padded = self.cache.take().unwrap();
        let (kh, kw, c) = self.weights.dim();
        let (n, ph, pw, _) = padded.dim();
        let (_, oh, ow, _) = grad_out.dim();
        let stride = self.stride;

        let mut grad_w = Array3::<f32>::zeros((kh, kw, c));
        let mut grad_padded = Array4::<f32>::zeros((n, ph, pw, c));
        for bi in 0..n {
            for y in 0..oh {
                for x in 0..ow {
                    for ky in 0..kh {
                        for kx in 0..kw {
                            let iy = y * stride + ky;
                            let ix = x * stride + kx;
                            for ch in 0..c {
                                let g = grad_out[[bi, y, x, ch]];
                                grad_w[[ky, kx, ch]] += padded[[bi, iy, ix, ch]] * g;
                                grad_padded[[bi, iy, ix, ch]] += self.weights[[ky, kx, ch]] * g;
                            }
                        }
                    }
                }
            }
        }
        self.grad_weights = Some(grad_w);
        let h = ph - self.padding.top - self.padding.bottom;
        let w = pw - self.padding.left - self.padding.right;
        crop_nhwc(&grad_padded, self.padding, h, w)
    }

    pub fn apply_gradients(&mut self, opt: &mut Adam, lr: f32, slot: &mut usize) {
        apply_update(opt, lr, slot, &mut self.weights, &mut self.grad_weights);
    }
}

/// Pointwise 1x1 convolution with bias, evaluated as a matmul over positions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointwiseConv2d {
    pub(crate) weights: Array2<f32>,
    pub(crate) bias: Array1<f32>,
    #[serde(skip)]
    grad_weights: Option<Array2<f32>>,
    #[serde(skip)]
    grad_bias: Option<Array1<f32>>,
    #[serde(skip)]
    cache: Option<Array4<f32>>,
}

impl PointwiseConv2d {
    pub fn new(in_channels: usize, out_channels: usize, rng: &mut Xoshiro256PlusPlus) -> Self {
        let data = glorot_uniform(rng, in_channels, out_channels, in_channels * out_channels);
        Self {
            weights: Array2::from_shape_vec((in_channels, out_channels), data).unwrap(),
            bias: Array1::zeros(out_channels),
            grad_weights: None,
            grad_bias: None,
            cache: None,
        }
    }

    pub fn out_channels(&self) -> usize {
        self.weights.ncols()
    }

    pub fn forward(&mut self, input: &Array4<f32>, train: bool) -> Array4<f32> {
        let (n, h, w, cin) = input.dim();
        let x2 = input.to_shape((n * h * w, cin)).unwrap();
        let y2 = x2.dot(&self.weights) + &self.bias;
        if train {
            self.cache = Some(input.clone());
        }
        y2.into_shape_with_order((n, h, w, self.weights.ncols()))
            .unwrap()
    }

    pub fn backward(&mut self, grad_out: &Array4<f32>) -> Array4<f32> {
        let input = self.cache.take().unwrap();
        let (n, h, w, cin) = input.dim();
        let cout = self.weights.ncols();
        let x2 = input.to_shape((n * h * w, cin)).unwrap();
        let dy2 = grad_out.to_shape((n * h * w, cout)).unwrap();
        self.grad_weights = Some(x2.t().dot(&dy2));
        self.grad_bias = Some(dy2.sum_axis(Axis(0)));
        let dx2 = dy2.dot(&self.weights.t());
        dx2.into_shape_with_order((n, h, w, cin)).unwrap()
    }

    pub fn apply_gradients(&mut self, opt: &mut Adam, lr: f32, slot: &mut usize) {
        apply_update(opt, lr, slot, &mut self.weights, &mut self.grad_weights);
        apply_update(opt, lr, slot, &mut self.bias, &mut self.grad_bias);
    }
}

#[derive(Debug, Clone)]
struct BnCache {
    xhat: Array4<f32>,
    inv_std: Array1<f32>,
}

/// Batch normalization over the channel axis of NHWC tensors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchNorm2d {
    pub(crate) gamma: Array1<f32>,
    pub(crate) beta: Array1<f32>,
    pub(crate) running_mean: Array1<f32>,
    pub(crate) running_var: Array1<f32>,
    pub(crate) momentum: f32,
    pub(crate) eps: f32,
    #[serde(skip)]
    grad_gamma: Option<Array1<f32>>,
    #[serde(skip)]
    grad_beta: Option<Array1<f32>>,
    #[serde(skip)]
    cache: Option<BnCache>,
}

impl BatchNorm2d {
    pub fn new(channels: usize) -> Self {
        Self {
            gamma: Array1::ones(channels),
            beta: Array1::zeros(channels),
            running_mean: Array1::zeros(channels),
            running_var: Array1::ones(channels),
            momentum: 0.99,
            eps: 1e-3,
            grad_gamma: None,
            grad_beta: None,
            cache: None,
        }
    }

    pub fn forward(&mut self, input: &Array4<f32>, train: bool) -> Array4<f32> {
        if train {
            let (n, h, w, _) = input.dim();
            let m = (n * h * w) as f32;
            let mean = channel_sum(input) / m;
            let centered = input - &mean;
            let var = channel_sum(&centered.mapv(|v| v * v)) / m;
            let inv_std = var.mapv(|v| 1.0 / (v + self.eps).sqrt());
            let xhat = &centered * &inv_std;
            let out = &xhat * &self.gamma + &self.beta;
            self.running_mean =
                &self.running_mean * self.momentum + &mean * (1.0 - self.momentum);
            self.running_var = &self.running_var * self.momentum + &var * (1.0 - self.momentum);
            self.cache = Some(BnCache { xhat, inv_std });
            out
        } else {
            let inv_std = self.running_var.mapv(|v| 1.0 / (v + self.eps).sqrt());
            (input - &self.running_mean) * &inv_std * &self.gamma + &self.beta
        }
    }

    pub fn backward(&mut self, grad_out: &Array4<f32>) -> Array4<f32> {
        let BnCache { xhat, inv_std } = self.cache.take().unwrap();
        let (n, h, w, _) = grad_out.dim();
        let m = (n * h * w) as f32;
        let sum_dy = channel_sum(grad_out);
        let sum_dy_xhat = channel_sum(&(grad_out * &xhat));
        let coeff = &self.gamma * &inv_std / m;
        let dx = (grad_out * m - &sum_dy - &xhat * &sum_dy_xhat) * &coeff;
        self.grad_gamma = Some(sum_dy_xhat);
        self.grad_beta = Some(sum_dy);
        dx
    }

    pub fn apply_gradients(&mut self, opt: &mut Adam, lr: f32, slot: &mut usize) {
        apply_update(opt, lr, slot, &mut self.gamma, &mut self.grad_gamma);
        apply_update(opt, lr, slot, &mut self.beta, &mut self.grad_beta);
    }
}

/// ReLU capped at 6
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Relu6 {
    #[serde(skip)]
    mask: Option<Array4<f32>>,
}

impl Relu6 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forward(&mut self, input: &Array4<f32>, train: bool) -> Array4<f32> {
        if train {
            self.mask = Some(input.mapv(|v| if v > 0.0 && v < 6.0 { 1.0 } else { 0.0 }));
        }
        input.mapv(|v| v.clamp(0.0, 6.0))
    }

    pub fn backward(&mut self, grad_out: &Array4<f32>) -> Array4<f32> {
        grad_out * &self.mask.take().unwrap()
    }
}

/// Global average pooling to one value per channel
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalAvgPool {
    #[serde(skip)]
    cache: Option<(usize, usize)>,
}

impl GlobalAvgPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forward(&mut self, input: &Array4<f32>, train: bool) -> Array2<f32> {
        let (_, h, w, _) = input.dim();
        if train {
            self.cache = Some((h, w));
        }
        input.sum_axis(Axis(1)).sum_axis(Axis(1)) / (h * w) as f32
    }

    pub fn backward(&mut self, grad_out: &Array2<f32>) -> Array4<f32> {
        let (h, w) = self.cache.take().unwrap();
        let (n, c) = grad_out.dim();
        let scale = 1.0 / (h * w) as f32;
        Array4::from_shape_fn((n, h, w, c), |(bi, _, _, ch)| grad_out[[bi, ch]] * scale)
    }
}

/// Inverted dropout on the pooled features
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dropout {
    pub(crate) rate: f32,
    #[serde(skip)]
    mask: Option<Array2<f32>>,
}

impl Dropout {
    pub fn new(rate: f32) -> Self {
        Self { rate, mask: None }
    }

    pub fn forward(
        &mut self,
        input: &Array2<f32>,
        train: bool,
        rng: &mut Xoshiro256PlusPlus,
    ) -> Array2<f32> {
        if !train || self.rate == 0.0 {
            return input.clone();
        }
        let keep = 1.0 - self.rate;
        let mask = Array2::from_shape_fn(input.raw_dim(), |_| {
            if rng.gen::<f32>() < keep {
                1.0 / keep
            } else {
                0.0
            }
        });
        let out = input * &mask;
        self.mask = Some(mask);
        out
    }

    pub fn backward(&mut self, grad_out: &Array2<f32>) -> Array2<f32> {
        match self.mask.take() {
            Some(mask) => grad_out * &mask,
            None => grad_out.clone(),
        }
    }
}

/// Fully connected classification head
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dense {
    pub(crate) weights: Array2<f32>,
    pub(crate) bias: Array1<f32>,
    #[serde(skip)]
    grad_weights: Option<Array2<f32>>,
    #[serde(skip)]
    grad_bias: Option<Array1<f32>>,
    #[serde(skip)]
    cache: Option<Array2<f32>>,
}

impl Dense {
    pub fn new(in_features: usize, out_features: usize, rng: &mut Xoshiro256PlusPlus) -> Self {
        let data = glorot_uniform(rng, in_features, out_features, in_features * out_features);
        Self {
            weights: Array2::from_shape_vec((in_features, out_features), data).unwrap(),
            bias: Array1::zeros(out_features),
            grad_weights: None,
            grad_bias: None,
            cache: None,
        }
    }

    pub fn forward(&mut self, input: &Array2<f32>, train: bool) -> Array2<f32> {
        if train {
            self.cache = Some(input.clone());
        }
        input.dot(&self.weights) + &self.bias
    }

    pub fn backward(&mut self, grad_out: &Array2<f32>) -> Array2<f32> {
        let input = self.cache.take().unwrap();
        self.grad_weights = Some(input.t().dot(grad_out));
        self.grad_bias = Some(grad_out.sum_axis(Axis(0)));
        grad_out.dot(&self.weights.t())
    }

    pub fn apply_gradients(&mut self, opt: &mut Adam, lr: f32, slot: &mut usize) {
        apply_update(opt, lr, slot, &mut self.weights, &mut self.grad_weights);
        apply_update(opt, lr, slot, &mut self.bias, &mut self.grad_bias);
    }
}
