//! Pooling layers.

use crate::nn::module::Module;
use crate::tensor::Tensor;

/// Max pooling over `[N, C, H, W]`.
///
/// ```rust,ignore
/// let pool = MaxPool2d::square(2);
/// let output = pool.forward(&input); // halves H and W
/// ```
pub struct MaxPool2d {
    /// Window size (kH, kW).
    pub kernel_size: (usize, usize),
    /// Stride (stride_h, stride_w).
    pub stride: (usize, usize),
}

impl MaxPool2d {
    pub fn new(kernel_size: (usize, usize), stride: (usize, usize)) -> Self {
        Self { kernel_size, stride }
    }

    /// Equal kernel size and stride.
    pub fn square(size: usize) -> Self {
        Self { kernel_size: (size, size), stride: (size, size) }
    }
}

impl Module for MaxPool2d {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        inputs.max_pool2d(self.kernel_size, self.stride)
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }
}
