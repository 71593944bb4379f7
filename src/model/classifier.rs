//! Domain classifier operating on the latent code.

use crate::nn::{Conv2d, Linear, MaxPool2d, Module, Norm2d, NormKind, ReLU};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Output channels of the convolutional stages.
pub const CLASSIFIER_CONV_CHANNELS: [usize; 3] = [48, 48, 48];
/// Output features of the fully connected stages; the last one is the number of domains.
pub const CLASSIFIER_FC_CHANNELS: [usize; 3] = [48, 24, 2];

struct ConvStage {
    conv: Conv2d,
    norm: Norm2d,
}

/// Small CNN: per stage a 3x3 conv, normalization, ReLU and 2x2 max-pool, then
/// fully connected layers with ReLU in between. Produces unnormalized domain
/// logits `[N, 2]`.
pub struct DomainClassifier {
    stages: Vec<ConvStage>,
    fcs: Vec<Linear>,
    pool: MaxPool2d,
    relu: ReLU,
}

impl DomainClassifier {
    /// `input_shape` is the `(channels, height, width)` of one latent sample.
    pub fn new(
        ctx: &Rc<RefCell<GraphContext>>,
        name: &str,
        input_shape: (usize, usize, usize),
        conv_channels: &[usize],
        fc_channels: &[usize],
        norm: NormKind,
    ) -> Self {
        let (mut channels, mut height, mut width) = input_shape;
        let mut stages = Vec::with_capacity(conv_channels.len());
        for (i, &out) in conv_channels.iter().enumerate() {
            stages.push(ConvStage {
                conv: Conv2d::new(ctx, &format!("{name}.conv{i}"), channels, out, (3, 3)).with_padding((1, 1)),
                norm: norm.build(ctx, &format!("{name}.norm{i}"), out),
            });
            channels = out;
            height /= 2;
            width /= 2;
        }

        let mut features = channels * height * width;
        let mut fcs = Vec::with_capacity(fc_channels.len());
        for (i, &out) in fc_channels.iter().enumerate() {
            fcs.push(Linear::new(ctx, features, out, &format!("{name}.fc{i}")));
            features = out;
        }
        Self { stages, fcs, pool: MaxPool2d::square(2), relu: ReLU::new() }
    }

    /// Classifier with the default layout.
    pub fn standard(
        ctx: &Rc<RefCell<GraphContext>>,
        name: &str,
        input_shape: (usize, usize, usize),
        norm: NormKind,
    ) -> Self {
        Self::new(ctx, name, input_shape, &CLASSIFIER_CONV_CHANNELS, &CLASSIFIER_FC_CHANNELS, norm)
    }
}

impl Module for DomainClassifier {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        let mut x = inputs.clone();
        for stage in &self.stages {
            let h = self.relu.forward(&stage.norm.forward(&stage.conv.forward(&x)));
            x = self.pool.forward(&h);
        }
        let mut x = x.flatten();
        let last = self.fcs.len().saturating_sub(1);
        for (i, fc) in self.fcs.iter().enumerate() {
            x = fc.forward(&x);
            if i < last {
                x = self.relu.forward(&x);
            }
        }
        x
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = Vec::new();
        for stage in &self.stages {
            params.extend(stage.conv.parameters());
            params.extend(stage.norm.parameters());
        }
        for fc in &self.fcs {
            params.extend(fc.parameters());
        }
        params
    }
}
