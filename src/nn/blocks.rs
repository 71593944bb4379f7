//! U-Net building blocks.

use crate::nn::activations::ReLU;
use crate::nn::conv::{Conv2d, ConvTranspose2d};
use crate::nn::norm::{Norm2d, NormKind};
use crate::nn::Module;
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Two rounds of 3x3 same-padded convolution, normalization and ReLU.
pub struct UNetConvBlock2D {
    pub conv1: Conv2d,
    pub norm1: Norm2d,
    pub conv2: Conv2d,
    pub norm2: Norm2d,
    relu: ReLU,
}

impl UNetConvBlock2D {
    pub fn new(
        ctx: &Rc<RefCell<GraphContext>>,
        name: &str,
        in_channels: usize,
        out_channels: usize,
        norm: NormKind,
    ) -> Self {
        Self {
            conv1: Conv2d::new(ctx, &format!("{name}.conv1"), in_channels, out_channels, (3, 3)).with_padding((1, 1)),
            norm1: norm.build(ctx, &format!("{name}.norm1"), out_channels),
            conv2: Conv2d::new(ctx, &format!("{name}.conv2"), out_channels, out_channels, (3, 3))
                .with_padding((1, 1)),
            norm2: norm.build(ctx, &format!("{name}.norm2"), out_channels),
            relu: ReLU::new(),
        }
    }
}

impl Module for UNetConvBlock2D {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        let x = self.relu.forward(&self.norm1.forward(&self.conv1.forward(inputs)));
        self.relu.forward(&self.norm2.forward(&self.conv2.forward(&x)))
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.conv1.parameters();
        params.extend(self.norm1.parameters());
        params.extend(self.conv2.parameters());
        params.extend(self.norm2.parameters());
        params
    }
}

/// 2x2 stride-2 transposed convolution that doubles the spatial size.
pub struct UNetUpSamplingBlock2D {
    pub up: ConvTranspose2d,
}

impl UNetUpSamplingBlock2D {
    pub fn new(ctx: &Rc<RefCell<GraphContext>>, name: &str, in_channels: usize, out_channels: usize) -> Self {
        Self { up: ConvTranspose2d::new(ctx, &format!("{name}.up"), in_channels, out_channels, (2, 2)).with_stride((2, 2)) }
    }

    /// Up-samples `inputs` and prepends `skip` along the channel axis.
    pub fn forward_with_skip(&self, skip: &Tensor, inputs: &Tensor) -> Tensor {
        let up = self.up.forward(inputs);
        Tensor::concat(&[skip, &up], 1)
    }
}

impl Module for UNetUpSamplingBlock2D {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        self.up.forward(inputs)
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.up.parameters()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conv_block_names_nest_under_block() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let block = UNetConvBlock2D::new(&ctx, "enc.convblock1", 1, 4, NormKind::Batch);
        assert_eq!(block.parameters().len(), 8);
        let names: Vec<String> = ctx.borrow().parameter_specs().iter().map(|s| s.name.clone()).collect();
        assert!(names.contains(&"enc.convblock1.conv1.weight".to_string()));
        assert!(names.contains(&"enc.convblock1.norm2.bias".to_string()));
    }
}
