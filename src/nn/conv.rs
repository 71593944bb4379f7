//! Convolutional layers for image feature maps.

use crate::nn::init::Init;
use crate::nn::module::Module;
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Configuration shared by `Conv2d` and `ConvTranspose2d`.
#[derive(Debug, Clone)]
pub struct Conv2dConfig {
    /// Number of input channels.
    pub in_channels: usize,
    /// Number of output channels (filters).
    pub out_channels: usize,
    /// Convolution kernel size.
    pub kernel_size: (usize, usize),
    /// Convolution stride.
    pub stride: (usize, usize),
    /// Zero padding on each side.
    pub padding: (usize, usize),
    /// Use bias.
    pub bias: bool,
}

impl Default for Conv2dConfig {
    fn default() -> Self {
        Self { in_channels: 1, out_channels: 1, kernel_size: (3, 3), stride: (1, 1), padding: (0, 0), bias: true }
    }
}

impl Conv2dConfig {
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: (usize, usize)) -> Self {
        Self { in_channels, out_channels, kernel_size, ..Default::default() }
    }

    pub fn with_stride(mut self, stride: (usize, usize)) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_padding(mut self, padding: (usize, usize)) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }
}

/// 2D convolution.
///
/// Maps `[N, C_in, H, W]` to `[N, C_out, H_out, W_out]`.
///
/// ```rust,ignore
/// let conv = Conv2d::new(&context, "conv1", 1, 64, (3, 3)).with_padding((1, 1));
/// let output = conv.forward(&input);
/// ```
pub struct Conv2d {
    /// Weight `[C_out, C_in, kH, kW]`.
    pub weight: Tensor,
    /// Bias `[C_out]`.
    pub bias: Option<Tensor>,
    pub config: Conv2dConfig,
}

impl Conv2d {
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        in_channels: usize,
        out_channels: usize,
        kernel_size: (usize, usize),
    ) -> Self {
        Self::from_config(context, name, Conv2dConfig::new(in_channels, out_channels, kernel_size))
    }

    pub fn from_config(context: &Rc<RefCell<GraphContext>>, name: &str, config: Conv2dConfig) -> Self {
        let (kh, kw) = config.kernel_size;
        let init = Init::KaimingUniform { fan_in: config.in_channels * kh * kw };
        let weight = Tensor::new_parameter(
            context,
            &format!("{}.weight", name),
            vec![config.out_channels, config.in_channels, kh, kw],
            init,
        );
        let bias = config
            .bias
            .then(|| Tensor::new_parameter(context, &format!("{}.bias", name), vec![config.out_channels], init));
        Self { weight, bias, config }
    }

    pub fn with_stride(mut self, stride: (usize, usize)) -> Self {
        self.config.stride = stride;
        self
    }

    pub fn with_padding(mut self, padding: (usize, usize)) -> Self {
        self.config.padding = padding;
        self
    }
}

impl Module for Conv2d {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        inputs.conv2d(&self.weight, self.bias.as_ref(), self.config.stride, self.config.padding)
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = vec![self.weight.clone()];
        params.extend(self.bias.clone());
        params
    }
}

/// Transposed 2D convolution, used for learned up-sampling.
///
/// With kernel 2 and stride 2 it exactly doubles the spatial size.
pub struct ConvTranspose2d {
    /// Weight `[C_in, C_out, kH, kW]`.
    pub weight: Tensor,
    /// Bias `[C_out]`.
    pub bias: Option<Tensor>,
    pub config: Conv2dConfig,
}

impl ConvTranspose2d {
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        in_channels: usize,
        out_channels: usize,
        kernel_size: (usize, usize),
    ) -> Self {
        Self::from_config(context, name, Conv2dConfig::new(in_channels, out_channels, kernel_size))
    }

    pub fn from_config(context: &Rc<RefCell<GraphContext>>, name: &str, config: Conv2dConfig) -> Self {
        let (kh, kw) = config.kernel_size;
        // fan_in is taken from the second weight dimension, as for a regular conv weight.
        let init = Init::KaimingUniform { fan_in: config.out_channels * kh * kw };
        let weight = Tensor::new_parameter(
            context,
            &format!("{}.weight", name),
            vec![config.in_channels, config.out_channels, kh, kw],
            init,
        );
        let bias = config
            .bias
            .then(|| Tensor::new_parameter(context, &format!("{}.bias", name), vec![config.out_channels], init));
        Self { weight, bias, config }
    }

    pub fn with_stride(mut self, stride: (usize, usize)) -> Self {
        self.config.stride = stride;
        self
    }
}

impl Module for ConvTranspose2d {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        inputs.conv_transpose2d(&self.weight, self.bias.as_ref(), self.config.stride, self.config.padding)
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = vec![self.weight.clone()];
        params.extend(self.bias.clone());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conv_registers_weight_and_bias_shapes() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let conv = Conv2d::new(&ctx, "conv1", 3, 8, (3, 3)).with_padding((1, 1));
        assert_eq!(conv.parameters().len(), 2);
        let ctx = ctx.borrow();
        let specs = ctx.parameter_specs();
        assert_eq!(specs[0].name, "conv1.weight");
        assert_eq!(specs[0].shape, vec![8, 3, 3, 3]);
        assert_eq!(specs[1].shape, vec![8]);
        assert_eq!(specs[0].init, Init::KaimingUniform { fan_in: 27 });
    }

    #[test]
    fn transposed_weight_is_in_out() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let up = ConvTranspose2d::new(&ctx, "up", 16, 8, (2, 2)).with_stride((2, 2));
        assert_eq!(up.config.stride, (2, 2));
        assert_eq!(ctx.borrow().parameter_specs()[0].shape, vec![16, 8, 2, 2]);
    }
}
