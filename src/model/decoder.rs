//! Expanding half of the U-Net.

use crate::nn::{Conv2d, Module, NormKind, UNetConvBlock2D, UNetUpSamplingBlock2D};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Level `i` up-samples `2^(levels-i) * fm` channels to `2^(levels-i-1) * fm`,
/// optionally concatenates the matching encoder output and applies a conv
/// block. A final 1x1 convolution produces `out_channels` logits.
pub struct UNetDecoder {
    pub upconvs: Vec<UNetUpSamplingBlock2D>,
    pub features: Vec<UNetConvBlock2D>,
    pub output: Conv2d,
    pub skip_connections: bool,
}

impl UNetDecoder {
    pub fn new(
        ctx: &Rc<RefCell<GraphContext>>,
        name: &str,
        out_channels: usize,
        feature_maps: usize,
        levels: usize,
        skip_connections: bool,
        norm: NormKind,
    ) -> Self {
        let mut upconvs = Vec::with_capacity(levels);
        let mut features = Vec::with_capacity(levels);
        for i in 0..levels {
            let wide = feature_maps << (levels - i);
            let narrow = feature_maps << (levels - i - 1);
            upconvs.push(UNetUpSamplingBlock2D::new(ctx, &format!("{name}.upconv{}", i + 1), wide, narrow));
            let block_in = if skip_connections { wide } else { narrow };
            features.push(UNetConvBlock2D::new(ctx, &format!("{name}.convblock{}", i + 1), block_in, narrow, norm));
        }
        let output = Conv2d::new(ctx, &format!("{name}.output"), feature_maps, out_channels, (1, 1));
        Self { upconvs, features, output, skip_connections }
    }

    /// Decodes `inputs`, reading `encoder_outputs` (shallowest first) when skip
    /// connections are enabled. Returns the output of every level and the logits.
    pub fn forward(&self, inputs: &Tensor, encoder_outputs: &[Tensor]) -> (Vec<Tensor>, Tensor) {
        let mut decoder_outputs = Vec::with_capacity(self.features.len());
        let mut skips = encoder_outputs.iter().rev();
        let mut x = inputs.clone();
        for (up, block) in self.upconvs.iter().zip(&self.features) {
            let upsampled = match (self.skip_connections, skips.next()) {
                (true, Some(skip)) => up.forward_with_skip(skip, &x),
                _ => up.forward(&x),
            };
            x = block.forward(&upsampled);
            decoder_outputs.push(x.clone());
        }
        let logits = self.output.forward(&x);
        (decoder_outputs, logits)
    }

    pub fn parameters(&self) -> Vec<Tensor> {
        let mut params = Vec::new();
        for (up, block) in self.upconvs.iter().zip(&self.features) {
            params.extend(up.parameters());
            params.extend(block.parameters());
        }
        params.extend(self.output.parameters());
        params
    }
}
