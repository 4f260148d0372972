//! DefectNet model
//!
//! A MobileNet-style classifier for 96x96 single-channel frames: a strided
//! stem convolution, thirteen depthwise-separable blocks and a pooled dense
//! head. The width multiplier `alpha` scales every filter count. Spatial
//! resolution halves five times (stem plus four strided blocks), leaving a
//! 3x3 map in front of the pooling layer.

use std::fs;
use std::path::Path;

use ndarray::{Array2, Array4};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};

use crate::error::{PotholeError, Result};
use crate::network::layers::{
    BatchNorm2d, Conv2d, Dense, DepthwiseConv2d, Dropout, GlobalAvgPool, Padding,
    PointwiseConv2d, Relu6,
};
use crate::quantization::calibration::ActivationObserver;
use crate::training::optimizer::Adam;

const MODEL_FORMAT: &str = "potholenet-model";
const MODEL_VERSION: u32 = 1;

/// Unscaled pointwise widths and strides of the thirteen separable blocks.
/// Strided blocks sit at each width increase after the first.
const BLOCK_LAYOUT: [(usize, usize); 13] = [
    (64, 1),
    (128, 2),
    (128, 1),
    (256, 2),
    (256, 1),
    (512, 2),
    (512, 1),
    (512, 1),
    (512, 1),
    (512, 1),
    (512, 1),
    (1024, 2),
    (1024, 1),
];

fn scaled(filters: usize, alpha: f32) -> usize {
    ((filters as f32 * alpha).round() as usize).max(1)
}

/// Static description of one separable block
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BlockDescriptor {
    /// Unscaled pointwise filter count
    pub filters: usize,
    pub stride: usize,
    /// Strided blocks pad bottom/right explicitly before a valid convolution
    pub needs_explicit_pad: bool,
}

/// One depthwise-separable block: depthwise conv, batch norm, ReLU6,
/// pointwise conv, ReLU6 again
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeparableBlock {
    pub(crate) descriptor: BlockDescriptor,
    pub(crate) depthwise: DepthwiseConv2d,
    pub(crate) bn: BatchNorm2d,
    pub(crate) relu_dw: Relu6,
    pub(crate) pointwise: PointwiseConv2d,
    pub(crate) relu_pw: Relu6,
}

impl SeparableBlock {
    fn new(
        in_channels: usize,
        filters: usize,
        stride: usize,
        alpha: f32,
        rng: &mut Xoshiro256PlusPlus,
    ) -> Self {
        let needs_explicit_pad = stride == 2;
        let padding = if needs_explicit_pad {
            Padding::SAME_S2
        } else {
            Padding::SAME_S1
        };
        Self {
            descriptor: BlockDescriptor {
                filters,
                stride,
                needs_explicit_pad,
            },
            depthwise: DepthwiseConv2d::new(3, in_channels, stride, padding, rng),
            bn: BatchNorm2d::new(in_channels),
            relu_dw: Relu6::new(),
            pointwise: PointwiseConv2d::new(in_channels, scaled(filters, alpha), rng),
            relu_pw: Relu6::new(),
        }
    }

    pub fn forward(&mut self, input: &Array4<f32>, train: bool) -> Array4<f32> {
        let mut x = self.depthwise.forward(input, train);
        x = self.bn.forward(&x, train);
        x = self.relu_dw.forward(&x, train);
        x = self.pointwise.forward(&x, train);
        self.relu_pw.forward(&x, train)
    }

    fn forward_observed(
        &mut self,
        input: &Array4<f32>,
        index: usize,
        observer: &mut ActivationObserver,
    ) -> Array4<f32> {
        let mut x = self.depthwise.forward(input, false);
        x = self.bn.forward(&x, false);
        x = self.relu_dw.forward(&x, false);
        observer.observe(&format!("block{}_dw", index), x.iter());
        x = self.pointwise.forward(&x, false);
        let out = self.relu_pw.forward(&x, false);
        observer.observe(&format!("block{}_pw", index), out.iter());
        out
    }

    fn backward(&mut self, grad_out: &Array4<f32>) -> Array4<f32> {
        let g = self.relu_pw.backward(grad_out);
        let g = self.pointwise.backward(&g);
        let g = self.relu_dw.backward(&g);
        let g = self.bn.backward(&g);
        self.depthwise.backward(&g)
    }

    fn apply_gradients(&mut self, opt: &mut Adam, lr: f32, slot: &mut usize) {
        self.depthwise.apply_gradients(opt, lr, slot);
        self.bn.apply_gradients(opt, lr, slot);
        self.pointwise.apply_gradients(opt, lr, slot);
    }
}

/// Self-describing metadata written next to the weight blob
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ModelGraph {
    format: String,
    version: u32,
    alpha: f32,
    classes: usize,
    dropout_rate: f32,
    input_shape: [usize; 3],
    blocks: Vec<BlockDescriptor>,
}

/// The full network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefectNet {
    pub(crate) alpha: f32,
    pub(crate) classes: usize,
    pub(crate) dropout_rate: f32,
    pub(crate) stem: Conv2d,
    pub(crate) stem_bn: BatchNorm2d,
    pub(crate) stem_relu: Relu6,
    pub(crate) blocks: Vec<SeparableBlock>,
    pub(crate) pool: GlobalAvgPool,
    pub(crate) dropout: Dropout,
    pub(crate) dense: Dense,
    pub(crate) is_fitted: bool,
}

impl DefectNet {
    pub fn new(alpha: f32, classes: usize, dropout_rate: f32, seed: u64) -> Self {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let stem_channels = scaled(32, alpha);
        let stem = Conv2d::new(3, 1, stem_channels, 2, Padding::SAME_S2, &mut rng);
        let stem_bn = BatchNorm2d::new(stem_channels);

        let mut blocks = Vec::with_capacity(BLOCK_LAYOUT.len());
        let mut in_channels = stem_channels;
        for (filters, stride) in BLOCK_LAYOUT {
            let block = SeparableBlock::new(in_channels, filters, stride, alpha, &mut rng);
            in_channels = block.pointwise.out_channels();
            blocks.push(block);
        }

        let dense = Dense::new(in_channels, classes, &mut rng);
        Self {
            alpha,
            classes,
            dropout_rate,
            stem,
            stem_bn,
            stem_relu: Relu6::new(),
            blocks,
            pool: GlobalAvgPool::new(),
            dropout: Dropout::new(dropout_rate),
            dense,
            is_fitted: false,
        }
    }

    pub fn classes(&self) -> usize {
        self.classes
    }

    pub fn is_fitted(&self) -> bool {
        self.is_fitted
    }

    /// Forward pass to class probabilities
    pub fn forward(
        &mut self,
        input: &Array4<f32>,
        train: bool,
        rng: &mut Xoshiro256PlusPlus,
    ) -> Array2<f32> {
        let mut x = self.stem.forward(input, train);
        x = self.stem_bn.forward(&x, train);
        x = self.stem_relu.forward(&x, train);
        for block in &mut self.blocks {
            x = block.forward(&x, train);
        }
        let pooled = self.pool.forward(&x, train);
        let dropped = self.dropout.forward(&pooled, train, rng);
        let logits = self.dense.forward(&dropped, train);
        softmax(&logits)
    }

    /// Eval-mode forward pass that reports every quantization-relevant tensor
    /// to the observer
    pub fn forward_observed(
        &mut self,
        input: &Array4<f32>,
        observer: &mut ActivationObserver,
    ) -> Array2<f32> {
        observer.observe("input", input.iter());
        let mut x = self.stem.forward(input, false);
        x = self.stem_bn.forward(&x, false);
        x = self.stem_relu.forward(&x, false);
        observer.observe("stem", x.iter());
        for (i, block) in self.blocks.iter_mut().enumerate() {
            x = block.forward_observed(&x, i, observer);
        }
        let pooled = self.pool.forward(&x, false);
        observer.observe("pool", pooled.iter());
        let logits = self.dense.forward(&pooled, false);
        observer.observe("logits", logits.iter());
        let probs = softmax(&logits);
        observer.observe("probs", probs.iter());
        probs
    }

    /// Backpropagate from the softmax/cross-entropy gradient at the logits
    pub fn backward(&mut self, grad_logits: &Array2<f32>) {
        let g = self.dense.backward(grad_logits);
        let g = self.dropout.backward(&g);
        let mut g4 = self.pool.backward(&g);
        for block in self.blocks.iter_mut().rev() {
            g4 = block.backward(&g4);
        }
        let g4 = self.stem_relu.backward(&g4);
        let g4 = self.stem_bn.backward(&g4);
        self.stem.backward(&g4);
    }

    /// Consume the gradients of the last backward pass. Slot order is fixed,
    /// so optimizer state stays attached to the same parameter across steps.
    pub fn apply_gradients(&mut self, opt: &mut Adam, lr: f32) {
        let mut slot = 0;
        self.stem.apply_gradients(opt, lr, &mut slot);
        self.stem_bn.apply_gradients(opt, lr, &mut slot);
        for block in &mut self.blocks {
            block.apply_gradients(opt, lr, &mut slot);
        }
        self.dense.apply_gradients(opt, lr, &mut slot);
    }

    /// Save as a directory: `graph.json` metadata plus `weights.bin`
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let graph = ModelGraph {
            format: MODEL_FORMAT.to_string(),
            version: MODEL_VERSION,
            alpha: self.alpha,
            classes: self.classes,
            dropout_rate: self.dropout_rate,
            input_shape: [96, 96, 1],
            blocks: self.blocks.iter().map(|b| b.descriptor).collect(),
        };
        let graph_json = serde_json::to_string_pretty(&graph)?;
        fs::write(dir.join("graph.json"), graph_json)?;
        let weights = bincode::serialize(self)?;
        fs::write(dir.join("weights.bin"), weights)?;
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let graph_json = fs::read_to_string(dir.join("graph.json")).map_err(|e| {
            PotholeError::SerializationError(format!(
                "cannot read model graph in {}: {}",
                dir.display(),
                e
            ))
        })?;
        let graph: ModelGraph = serde_json::from_str(&graph_json)?;
        if graph.format != MODEL_FORMAT || graph.version != MODEL_VERSION {
            return Err(PotholeError::SerializationError(format!(
                "unsupported model format {} v{}",
                graph.format, graph.version
            )));
        }
        let model: DefectNet = bincode::deserialize(&fs::read(dir.join("weights.bin"))?)?;
        if model.classes != graph.classes || model.blocks.len() != graph.blocks.len() {
            return Err(PotholeError::SerializationError(
                "model graph does not match weight blob".to_string(),
            ));
        }
        Ok(model)
    }
}

/// Row-wise stable softmax
pub fn softmax(logits: &Array2<f32>) -> Array2<f32> {
    let mut result = logits.clone();
    for mut row in result.rows_mut() {
        let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let exp_sum: f32 = row.iter().map(|&v| (v - max).exp()).sum();
        for v in row.iter_mut() {
            *v = (*v - max).exp() / exp_sum;
        }
    }
    result
}
