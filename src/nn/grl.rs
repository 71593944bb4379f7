//! Gradient reversal layer.
//!
//! Identity on the forward pass. On the backward pass the incoming gradient is
//! multiplied by `-scale`, so whatever sits before the layer is trained to
//! *increase* the loss of whatever sits after it. Placed between a feature
//! extractor and a domain classifier this pushes the features towards domain
//! invariance.

use crate::nn::module::Module;
use crate::tensor::Tensor;

#[derive(Debug, Clone, Copy)]
pub struct GradientReversal {
    pub scale: f32,
}

impl GradientReversal {
    pub fn new(scale: f32) -> Self {
        Self { scale }
    }
}

impl Default for GradientReversal {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl Module for GradientReversal {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        inputs.gradient_reversal(self.scale)
    }

    fn parameters(&self) -> Vec<Tensor> {
        Vec::new()
    }
}
