//! Contracting half of the U-Net.

use crate::nn::{GradientReversal, MaxPool2d, Module, NormKind, UNetConvBlock2D};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Symbolic results of [`UNetEncoder::forward`].
pub struct EncoderOutput {
    /// Output of every level before pooling, shallowest first.
    pub encoder_outputs: Vec<Tensor>,
    /// Latent code produced by the center block.
    pub center: Tensor,
    /// `center` behind the gradient reversal layer.
    pub reversed_center: Tensor,
}

/// Level `i` maps to `2^i * feature_maps` channels and halves the spatial size;
/// the center block maps to `2^levels * feature_maps` channels.
pub struct UNetEncoder {
    pub features: Vec<UNetConvBlock2D>,
    pub center: UNetConvBlock2D,
    pool: MaxPool2d,
    grl: GradientReversal,
}

impl UNetEncoder {
    pub fn new(
        ctx: &Rc<RefCell<GraphContext>>,
        name: &str,
        in_channels: usize,
        feature_maps: usize,
        levels: usize,
        norm: NormKind,
        grl_scale: f32,
    ) -> Self {
        let mut features = Vec::with_capacity(levels);
        let mut channels = in_channels;
        for i in 0..levels {
            let out = feature_maps << i;
            features.push(UNetConvBlock2D::new(ctx, &format!("{name}.convblock{}", i + 1), channels, out, norm));
            channels = out;
        }
        let center = UNetConvBlock2D::new(ctx, &format!("{name}.center"), channels, feature_maps << levels, norm);
        Self { features, center, pool: MaxPool2d::square(2), grl: GradientReversal::new(grl_scale) }
    }

    pub fn forward(&self, inputs: &Tensor) -> EncoderOutput {
        let mut encoder_outputs = Vec::with_capacity(self.features.len());
        let mut x = inputs.clone();
        for block in &self.features {
            let features = block.forward(&x);
            x = self.pool.forward(&features);
            encoder_outputs.push(features);
        }
        let center = self.center.forward(&x);
        let reversed_center = self.grl.forward(&center);
        EncoderOutput { encoder_outputs, center, reversed_center }
    }

    pub fn parameters(&self) -> Vec<Tensor> {
        let mut params: Vec<Tensor> = self.features.iter().flat_map(|b| b.parameters()).collect();
        params.extend(self.center.parameters());
        params
    }
}
