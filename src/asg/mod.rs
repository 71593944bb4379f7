//! ASG: the abstract semantic graph every model is lowered to.
//!
//! A graph is an arena of [`Node`]s addressed by dense [`NodeId`]s. Building a
//! model only appends nodes; nothing is computed until a backend runs the graph.

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Node identifier inside one graph.
pub type NodeId = usize;
/// Graph identifier. The forward graph is `0`, gradient graphs are `1`.
pub type AsgId = usize;
/// Tensor shape.
pub type Shape = Vec<usize>;

pub type AsgResult<T> = std::result::Result<T, AsgError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AsgError {
    #[error("node {0} not found")]
    NodeNotFound(NodeId),
    #[error("node {0} has no valid shape")]
    InvalidShape(NodeId),
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    F32,
    Bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: Option<String>,
    pub node_type: NodeType,
    pub shape: Option<Shape>,
    pub dtype: Option<DType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeType {
    // Leaves
    Input { name: String },
    Parameter { name: String },
    /// Non-trainable state such as normalization running statistics.
    Buffer { name: String },
    Literal(Value),
    /// Value computed by another graph; resolved from the shared memo at run time.
    External { name: String, source_asg_id: AsgId, source_node_id: NodeId },

    // Element-wise binary, numpy broadcasting
    Add(NodeId, NodeId),
    Subtract(NodeId, NodeId),
    Multiply(NodeId, NodeId),
    Divide(NodeId, NodeId),
    GreaterThan(NodeId, NodeId),

    // Unary
    Negate(NodeId),
    Exp(NodeId),
    Log(NodeId),
    Sqrt(NodeId),
    ReLU(NodeId),
    Sigmoid(NodeId),
    Softplus(NodeId),
    /// Over the last axis.
    Softmax(NodeId),
    /// Over the last axis.
    LogSoftmax(NodeId),

    // Reductions
    Sum(NodeId),
    Mean(NodeId),
    SumAxes { input: NodeId, axes: Vec<usize>, keepdim: bool },
    MeanAxes { input: NodeId, axes: Vec<usize>, keepdim: bool },

    // Shape manipulation
    /// `0` copies the input dimension, `-1` is inferred.
    Reshape(NodeId, Vec<i64>),
    ReshapeLike(NodeId, NodeId),
    /// `[N, ...] -> [N, prod(...)]`.
    Flatten(NodeId),
    Transpose(NodeId, usize, usize),
    Broadcast(NodeId, NodeId),
    ReduceSumTo(NodeId, NodeId),
    Concat { inputs: Vec<NodeId>, axis: usize },
    Slice { input: NodeId, axis: usize, start: usize, len: usize },

    MatrixMultiply(NodeId, NodeId),

    // Convolutions. Weights: conv `[C_out, C_in, kH, kW]`, transposed `[C_in, C_out, kH, kW]`.
    Conv2d {
        input: NodeId,
        weight: NodeId,
        bias: Option<NodeId>,
        stride: (usize, usize),
        padding: (usize, usize),
    },
    ConvTranspose2d {
        input: NodeId,
        weight: NodeId,
        bias: Option<NodeId>,
        stride: (usize, usize),
        padding: (usize, usize),
    },
    Conv2dBackwardInput {
        grad_output: NodeId,
        weight: NodeId,
        input_shape: (usize, usize, usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
    },
    Conv2dBackwardWeight {
        grad_output: NodeId,
        input: NodeId,
        weight_shape: (usize, usize, usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
    },

    // Pooling
    MaxPool2d { input: NodeId, kernel_size: (usize, usize), stride: (usize, usize) },
    MaxUnpool2d {
        input: NodeId,
        original_input: NodeId,
        kernel_size: (usize, usize),
        stride: (usize, usize),
    },

    /// Identity forward; the gradient is multiplied by `-scale`.
    GradientReversal { input: NodeId, scale: f32 },
}

impl NodeType {
    /// Operand ids, in evaluation order.
    pub fn dependencies(&self) -> Vec<NodeId> {
        match self {
            NodeType::Input { .. }
            | NodeType::Parameter { .. }
            | NodeType::Buffer { .. }
            | NodeType::Literal(_)
            | NodeType::External { .. } => vec![],

            NodeType::Add(a, b)
            | NodeType::Subtract(a, b)
            | NodeType::Multiply(a, b)
            | NodeType::Divide(a, b)
            | NodeType::GreaterThan(a, b)
            | NodeType::ReshapeLike(a, b)
            | NodeType::Broadcast(a, b)
            | NodeType::ReduceSumTo(a, b)
            | NodeType::MatrixMultiply(a, b) => vec![*a, *b],

            NodeType::Negate(a)
            | NodeType::Exp(a)
            | NodeType::Log(a)
            | NodeType::Sqrt(a)
            | NodeType::ReLU(a)
            | NodeType::Sigmoid(a)
            | NodeType::Softplus(a)
            | NodeType::Softmax(a)
            | NodeType::LogSoftmax(a)
            | NodeType::Sum(a)
            | NodeType::Mean(a)
            | NodeType::Reshape(a, _)
            | NodeType::Flatten(a)
            | NodeType::Transpose(a, _, _) => vec![*a],

            NodeType::SumAxes { input, .. }
            | NodeType::MeanAxes { input, .. }
            | NodeType::Slice { input, .. }
            | NodeType::MaxPool2d { input, .. }
            | NodeType::GradientReversal { input, .. } => vec![*input],

            NodeType::Concat { inputs, .. } => inputs.clone(),

            NodeType::Conv2d { input, weight, bias, .. }
            | NodeType::ConvTranspose2d { input, weight, bias, .. } => {
                let mut deps = vec![*input, *weight];
                if let Some(b) = bias {
                    deps.push(*b);
                }
                deps
            }
            NodeType::Conv2dBackwardInput { grad_output, weight, .. } => vec![*grad_output, *weight],
            NodeType::Conv2dBackwardWeight { grad_output, input, .. } => vec![*grad_output, *input],
            NodeType::MaxUnpool2d { input, original_input, .. } => vec![*input, *original_input],
        }
    }

    /// Short operation name for logs and error messages.
    pub fn op_name(&self) -> &'static str {
        match self {
            NodeType::Input { .. } => "Input",
            NodeType::Parameter { .. } => "Parameter",
            NodeType::Buffer { .. } => "Buffer",
            NodeType::Literal(_) => "Literal",
            NodeType::External { .. } => "External",
            NodeType::Add(..) => "Add",
            NodeType::Subtract(..) => "Subtract",
            NodeType::Multiply(..) => "Multiply",
            NodeType::Divide(..) => "Divide",
            NodeType::GreaterThan(..) => "GreaterThan",
            NodeType::Negate(_) => "Negate",
            NodeType::Exp(_) => "Exp",
            NodeType::Log(_) => "Log",
            NodeType::Sqrt(_) => "Sqrt",
            NodeType::ReLU(_) => "ReLU",
            NodeType::Sigmoid(_) => "Sigmoid",
            NodeType::Softplus(_) => "Softplus",
            NodeType::Softmax(_) => "Softmax",
            NodeType::LogSoftmax(_) => "LogSoftmax",
            NodeType::Sum(_) => "Sum",
            NodeType::Mean(_) => "Mean",
            NodeType::SumAxes { .. } => "SumAxes",
            NodeType::MeanAxes { .. } => "MeanAxes",
            NodeType::Reshape(..) => "Reshape",
            NodeType::ReshapeLike(..) => "ReshapeLike",
            NodeType::Flatten(_) => "Flatten",
            NodeType::Transpose(..) => "Transpose",
            NodeType::Broadcast(..) => "Broadcast",
            NodeType::ReduceSumTo(..) => "ReduceSumTo",
            NodeType::Concat { .. } => "Concat",
            NodeType::Slice { .. } => "Slice",
            NodeType::MatrixMultiply(..) => "MatrixMultiply",
            NodeType::Conv2d { .. } => "Conv2d",
            NodeType::ConvTranspose2d { .. } => "ConvTranspose2d",
            NodeType::Conv2dBackwardInput { .. } => "Conv2dBackwardInput",
            NodeType::Conv2dBackwardWeight { .. } => "Conv2dBackwardWeight",
            NodeType::MaxPool2d { .. } => "MaxPool2d",
            NodeType::MaxUnpool2d { .. } => "MaxUnpool2d",
            NodeType::GradientReversal { .. } => "GradientReversal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Tensor(ArrayD<f32>),
    ScalarF32(f32),
}

impl Value {
    /// Scalars become 0-d arrays so every kernel can work on `ArrayD`.
    pub fn into_array(self) -> ArrayD<f32> {
        match self {
            Value::Tensor(arr) => arr,
            Value::ScalarF32(v) => ndarray::arr0(v).into_dyn(),
        }
    }

    pub fn as_array(&self) -> Option<&ArrayD<f32>> {
        match self {
            Value::Tensor(arr) => Some(arr),
            Value::ScalarF32(_) => None,
        }
    }

    /// First element; the value of a scalar loss.
    pub fn scalar(&self) -> Option<f32> {
        match self {
            Value::Tensor(arr) => arr.iter().next().copied(),
            Value::ScalarF32(v) => Some(*v),
        }
    }

    pub fn shape(&self) -> Shape {
        match self {
            Value::Tensor(arr) => arr.shape().to_vec(),
            Value::ScalarF32(_) => vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asg {
    pub id: AsgId,
    pub name: Option<String>,
    pub nodes: HashMap<NodeId, Node>,
    pub inputs: Vec<NodeId>,
    pub outputs: Vec<NodeId>,
}

impl Asg {
    pub fn new(id: AsgId, name: Option<String>) -> Self {
        Self { id, name, nodes: HashMap::new(), inputs: vec![], outputs: vec![] }
    }

    pub fn add_node(&mut self, name: Option<String>, node_type: NodeType) -> NodeId {
        let new_id = self.nodes.len();
        let mut node = Node { id: new_id, name, node_type, shape: None, dtype: None };

        // Literals know their shape up front.
        match &node.node_type {
            NodeType::Literal(Value::Tensor(arr)) => {
                node.shape = Some(arr.shape().to_vec());
                node.dtype = Some(DType::F32);
            }
            NodeType::Literal(Value::ScalarF32(_)) => {
                node.shape = Some(vec![]);
                node.dtype = Some(DType::F32);
            }
            _ => {}
        }

        self.nodes.insert(new_id, node);
        new_id
    }

    pub fn set_inputs(&mut self, inputs: Vec<NodeId>) {
        self.inputs = inputs;
    }

    pub fn set_outputs(&mut self, outputs: Vec<NodeId>) {
        self.outputs = outputs;
    }

    pub fn set_output(&mut self, output: NodeId) {
        self.set_outputs(vec![output]);
    }

    pub fn get_node(&self, id: NodeId) -> AsgResult<&Node> {
        self.nodes.get(&id).ok_or(AsgError::NodeNotFound(id))
    }

    pub fn get_node_mut(&mut self, id: NodeId) -> AsgResult<&mut Node> {
        self.nodes.get_mut(&id).ok_or(AsgError::NodeNotFound(id))
    }

    /// Shape filled in by shape inference.
    pub fn shape_of(&self, id: NodeId) -> AsgResult<&Shape> {
        self.get_node(id)?.shape.as_ref().ok_or(AsgError::InvalidShape(id))
    }

    /// Finds the leaf (input, parameter or buffer) registered under `name`.
    pub fn find_leaf(&self, name: &str) -> Option<NodeId> {
        self.nodes.values().find_map(|n| match &n.node_type {
            NodeType::Input { name: n_name }
            | NodeType::Parameter { name: n_name }
            | NodeType::Buffer { name: n_name }
                if n_name == name =>
            {
                Some(n.id)
            }
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_nodes_get_shapes_on_insert() {
        let mut asg = Asg::new(0, None);
        let id = asg.add_node(None, NodeType::Literal(Value::Tensor(ArrayD::zeros(vec![2, 3]))));
        assert_eq!(asg.shape_of(id).unwrap(), &vec![2, 3]);
        let s = asg.add_node(None, NodeType::Literal(Value::ScalarF32(1.0)));
        assert_eq!(asg.shape_of(s).unwrap(), &Vec::<usize>::new());
    }

    #[test]
    fn find_leaf_by_name() {
        let mut asg = Asg::new(0, None);
        asg.add_node(None, NodeType::Input { name: "x".into() });
        let w = asg.add_node(None, NodeType::Parameter { name: "conv.weight".into() });
        assert_eq!(asg.find_leaf("conv.weight"), Some(w));
        assert_eq!(asg.find_leaf("missing"), None);
    }

    #[test]
    fn conv_dependencies_include_bias() {
        let op = NodeType::Conv2d { input: 0, weight: 1, bias: Some(2), stride: (1, 1), padding: (1, 1) };
        assert_eq!(op.dependencies(), vec![0, 1, 2]);
    }
}
