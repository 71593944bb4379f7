//! Group normalization and the normalization selector used by the U-Net blocks.

use crate::nn::batchnorm::{BatchNorm2d, EPS};
use crate::nn::init::Init;
use crate::nn::Module;
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Normalizes each sample over groups of channels.
///
/// Statistics are per sample, so train and eval modes behave identically and
/// there are no running statistics.
pub struct GroupNorm {
    pub gamma: Tensor,
    pub beta: Tensor,
    pub groups: usize,
}

impl GroupNorm {
    pub fn new(ctx: &Rc<RefCell<GraphContext>>, name: &str, groups: usize, channels: usize) -> Self {
        let shape = vec![1, channels, 1, 1];
        Self {
            gamma: Tensor::new_parameter(ctx, &format!("{}.weight", name), shape.clone(), Init::Ones),
            beta: Tensor::new_parameter(ctx, &format!("{}.bias", name), shape, Init::Zeros),
            groups,
        }
    }
}

impl Module for GroupNorm {
    fn forward(&self, x: &Tensor) -> Tensor {
        // [N, C, H, W] -> [N, G, C/G * H * W]
        let grouped = x.reshape(vec![0, self.groups as i64, -1]);
        let mean = grouped.mean_axes(&[2], true);
        let centered = &grouped - &mean;
        let var = (&centered * &centered).mean_axes(&[2], true);
        let eps = Tensor::scalar(&x.context, EPS);
        let normalized = (&centered / &(&var + &eps).sqrt()).reshape_like(x);

        let scaled = &normalized * &self.gamma;
        &scaled + &self.beta
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.gamma.clone(), self.beta.clone()]
    }
}

/// Which normalization the convolutional blocks use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormKind {
    Batch,
    /// Group normalization with this many groups.
    Group(usize),
}

impl NormKind {
    /// `None` selects batch normalization.
    pub fn from_groups(groups: Option<usize>) -> Self {
        groups.map_or(NormKind::Batch, NormKind::Group)
    }

    pub fn build(self, ctx: &Rc<RefCell<GraphContext>>, name: &str, channels: usize) -> Norm2d {
        match self {
            NormKind::Batch => Norm2d::Batch(BatchNorm2d::new(ctx, name, channels)),
            NormKind::Group(groups) => Norm2d::Group(GroupNorm::new(ctx, name, groups, channels)),
        }
    }
}

pub enum Norm2d {
    Batch(BatchNorm2d),
    Group(GroupNorm),
}

impl Module for Norm2d {
    fn forward(&self, x: &Tensor) -> Tensor {
        match self {
            Norm2d::Batch(bn) => bn.forward(x),
            Norm2d::Group(gn) => gn.forward(x),
        }
    }

    fn parameters(&self) -> Vec<Tensor> {
        match self {
            Norm2d::Batch(bn) => bn.parameters(),
            Norm2d::Group(gn) => gn.parameters(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Mode;

    #[test]
    fn group_norm_has_no_buffers_or_statistics() {
        let ctx = Rc::new(RefCell::new(GraphContext::with_mode(Mode::Train)));
        let norm = NormKind::from_groups(Some(2)).build(&ctx, "gn", 4);
        let x = Tensor::new_input(&ctx, "x");
        norm.forward(&x);
        let ctx = ctx.borrow();
        assert!(ctx.buffer_specs().is_empty());
        assert!(ctx.batch_statistics().is_empty());
        assert_eq!(ctx.parameter_specs().len(), 2);
    }

    #[test]
    fn none_selects_batch_norm() {
        assert_eq!(NormKind::from_groups(None), NormKind::Batch);
    }
}
