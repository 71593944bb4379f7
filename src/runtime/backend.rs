//! Abstract interface of execution backends.

use crate::asg::{Asg, AsgId, NodeId, NodeType, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised while executing a graph. Shared by all backends.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Node {0} not found in graph {1}.")]
    NodeNotFound(NodeId, AsgId),

    #[error("Type mismatch: operation expected {expected}, got {actual}.")]
    TypeError { expected: String, actual: String },

    #[error("Tensor shape error: {0}")]
    ShapeError(String),

    #[error("Missing value for input '{0}' (node {1}). Bind it before calling backend.run().")]
    MissingInput(String, NodeId),

    #[error("Missing value for parameter '{0}' (node {1}). Initialize the parameter store first.")]
    MissingParameter(String, NodeId),

    #[error("Operation '{0}' is not implemented by this backend.")]
    UnimplementedOperation(String),

    #[error("Computation error: {0}")]
    ComputationError(String),
}

/// Cache of computed node values, keyed by `(AsgId, NodeId)`.
pub type Memo<T> = HashMap<(AsgId, NodeId), T>;

/// Common interface of an execution environment.
///
/// A backend takes an ASG plus preloaded leaf values and computes the outputs.
pub trait Backend {
    /// Device-side representation of a value.
    type DeviceData: std::fmt::Debug;

    /// Moves named host values to the device.
    fn load_data(&self, data: &HashMap<String, Value>) -> Result<HashMap<String, Self::DeviceData>, RuntimeError>;

    /// Executes `main_asg`, reading and extending `initial_memo`.
    ///
    /// The memo must hold every input, parameter and buffer of the graph. For a
    /// gradient graph, passing the memo of the forward run resolves its
    /// `External` nodes. Returns the outputs in order and the final memo.
    fn run(
        &self,
        main_asg: &Asg,
        initial_memo: Memo<Self::DeviceData>,
    ) -> Result<(Vec<Self::DeviceData>, Memo<Self::DeviceData>), RuntimeError>;

    /// Copies device values back to the host.
    fn retrieve_data(&self, device_data: &[Self::DeviceData]) -> Result<Vec<Value>, RuntimeError>;
}

/// Builds a memo entry for every leaf of `asg` whose name appears in `data`.
pub fn bind_leaves<T: Clone>(asg: &Asg, data: &HashMap<String, T>) -> Memo<T> {
    asg.nodes
        .values()
        .filter_map(|node| match &node.node_type {
            NodeType::Input { name } | NodeType::Parameter { name } | NodeType::Buffer { name } => {
                data.get(name).map(|v| ((asg.id, node.id), v.clone()))
            }
            _ => None,
        })
        .collect()
}
