//! Fully connected layer.

use crate::nn::init::Init;
use crate::nn::module::Module;
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Fully connected layer `y = xW + b`.
///
/// The layer holds no data, only symbolic handles to its `Parameter` nodes:
/// weights `[in, out]` and bias `[1, out]`.
pub struct Linear {
    pub weights: Tensor,
    pub bias: Tensor,
}

impl Linear {
    /// Registers `{name}.weight` and `{name}.bias` in the graph.
    pub fn new(context: &Rc<RefCell<GraphContext>>, in_features: usize, out_features: usize, name: &str) -> Self {
        let init = Init::KaimingUniform { fan_in: in_features };
        let weights = Tensor::new_parameter(context, &format!("{}.weight", name), vec![in_features, out_features], init);
        let bias = Tensor::new_parameter(context, &format!("{}.bias", name), vec![1, out_features], init);
        Self { weights, bias }
    }
}

impl Module for Linear {
    /// Expects `[N, in]` and yields `[N, out]`.
    fn forward(&self, inputs: &Tensor) -> Tensor {
        let dot_product = inputs.dot(&self.weights);
        &dot_product + &self.bias
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.weights.clone(), self.bias.clone()]
    }
}
