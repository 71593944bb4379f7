//! The `Module` trait shared by all layers.

use crate::tensor::Tensor;

/// Common interface of layers and models.
///
/// A module is any component that adds a pattern of operations and
/// parameters to the graph.
pub trait Module {
    /// Symbolic forward pass: builds the corresponding part of the graph.
    fn forward(&self, inputs: &Tensor) -> Tensor;

    /// Trainable parameters owned by the module, as symbolic tensors.
    fn parameters(&self) -> Vec<Tensor>;
}
