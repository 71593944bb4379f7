//! `Tensor` handles and the `GraphContext` that owns the graph under construction.
//!
//! A `Tensor` holds no data. It names a node of the ASG, and every operation on
//! it appends a new node to the shared graph. `GraphContext` additionally keeps
//! what a trainer needs to know about the graph besides its nodes: which leaves
//! are trainable, how to initialise them, and which batch statistics must be
//! folded into running statistics after each step.

use crate::asg::{Asg, NodeId, NodeType, Shape, Value};
use crate::nn::init::Init;
use ndarray::ArrayD;
use std::cell::RefCell;
use std::ops::{Add, Div, Mul, Sub};
use std::rc::Rc;

/// Whether normalization layers use batch statistics or running statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Train,
    Eval,
}

/// Declared shape and initializer of a parameter or buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpec {
    pub name: String,
    pub shape: Shape,
    pub init: Init,
}

/// Batch statistics produced by a normalization layer in train mode.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchStatistics {
    pub running_mean: String,
    pub running_var: String,
    /// Biased batch mean, shaped like the running mean.
    pub mean: NodeId,
    /// Biased batch variance, shaped like the running variance.
    pub var: NodeId,
    /// Normalized input, used to recover the per-channel sample count.
    pub input: NodeId,
    pub momentum: f32,
}

#[derive(Debug, Clone)]
pub struct GraphContext {
    main_graph: Asg,
    mode: Mode,
    parameters: Vec<ParameterSpec>,
    buffers: Vec<ParameterSpec>,
    batch_statistics: Vec<BatchStatistics>,
}

impl GraphContext {
    pub fn new() -> Self {
        Self::with_mode(Mode::Train)
    }

    pub fn with_mode(mode: Mode) -> Self {
        Self {
            main_graph: Asg::new(0, Some("main".to_string())),
            mode,
            parameters: Vec::new(),
            buffers: Vec::new(),
            batch_statistics: Vec::new(),
        }
    }

    pub fn main_graph_mut(&mut self) -> &mut Asg {
        &mut self.main_graph
    }

    pub fn main_graph(&self) -> &Asg {
        &self.main_graph
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn parameter_specs(&self) -> &[ParameterSpec] {
        &self.parameters
    }

    pub fn buffer_specs(&self) -> &[ParameterSpec] {
        &self.buffers
    }

    pub fn batch_statistics(&self) -> &[BatchStatistics] {
        &self.batch_statistics
    }

    pub fn record_batch_statistics(&mut self, stats: BatchStatistics) {
        self.batch_statistics.push(stats);
    }
}

impl Default for GraphContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Symbolic handle to a node of the graph being built.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub node_id: NodeId,
    pub context: Rc<RefCell<GraphContext>>,
}

impl Tensor {
    fn from_node(context: &Rc<RefCell<GraphContext>>, node_type: NodeType) -> Self {
        let node_id = context.borrow_mut().main_graph_mut().add_node(None, node_type);
        Self { node_id, context: Rc::clone(context) }
    }

    fn unary(&self, node_type: NodeType) -> Self {
        Self::from_node(&self.context, node_type)
    }

    /// Graph input fed with data at run time.
    pub fn new_input(context: &Rc<RefCell<GraphContext>>, name: &str) -> Self {
        let mut ctx = context.borrow_mut();
        let graph = ctx.main_graph_mut();
        let node_id = graph.add_node(Some(name.to_string()), NodeType::Input { name: name.to_string() });
        graph.inputs.push(node_id);
        Self { node_id, context: Rc::clone(context) }
    }

    /// Trainable weight. Its `ParameterSpec` is recorded so a store can be initialised from the graph.
    pub fn new_parameter(context: &Rc<RefCell<GraphContext>>, name: &str, shape: Shape, init: Init) -> Self {
        let mut ctx = context.borrow_mut();
        let node_id = ctx
            .main_graph_mut()
            .add_node(Some(name.to_string()), NodeType::Parameter { name: name.to_string() });
        ctx.parameters.push(ParameterSpec { name: name.to_string(), shape, init });
        Self { node_id, context: Rc::clone(context) }
    }

    /// Non-trainable state read by the graph (running statistics).
    pub fn new_buffer(context: &Rc<RefCell<GraphContext>>, name: &str, shape: Shape, init: Init) -> Self {
        let mut ctx = context.borrow_mut();
        let node_id = ctx
            .main_graph_mut()
            .add_node(Some(name.to_string()), NodeType::Buffer { name: name.to_string() });
        ctx.buffers.push(ParameterSpec { name: name.to_string(), shape, init });
        Self { node_id, context: Rc::clone(context) }
    }

    /// Constant embedded in the graph.
    pub fn new_literal(context: &Rc<RefCell<GraphContext>>, data: ArrayD<f32>, name: &str) -> Self {
        let node_id = context
            .borrow_mut()
            .main_graph_mut()
            .add_node(Some(name.to_string()), NodeType::Literal(Value::Tensor(data)));
        Self { node_id, context: Rc::clone(context) }
    }

    pub fn scalar(context: &Rc<RefCell<GraphContext>>, value: f32) -> Self {
        Self::from_node(context, NodeType::Literal(Value::ScalarF32(value)))
    }

    /// Name of the underlying node, if it has one.
    pub fn name(&self) -> Option<String> {
        let ctx = self.context.borrow();
        ctx.main_graph().get_node(self.node_id).ok().and_then(|n| n.name.clone())
    }

    // --- Math ---

    pub fn neg(&self) -> Self {
        self.unary(NodeType::Negate(self.node_id))
    }

    pub fn exp(&self) -> Self {
        self.unary(NodeType::Exp(self.node_id))
    }

    pub fn log(&self) -> Self {
        self.unary(NodeType::Log(self.node_id))
    }

    pub fn sqrt(&self) -> Self {
        self.unary(NodeType::Sqrt(self.node_id))
    }

    pub fn dot(&self, other: &Tensor) -> Self {
        self.unary(NodeType::MatrixMultiply(self.node_id, other.node_id))
    }

    pub fn greater_than(&self, other: &Tensor) -> Self {
        self.unary(NodeType::GreaterThan(self.node_id, other.node_id))
    }

    /// Multiplies by a constant.
    pub fn scale(&self, factor: f32) -> Self {
        let factor = Tensor::scalar(&self.context, factor);
        self * &factor
    }

    // --- Activations ---

    pub fn relu(&self) -> Self {
        self.unary(NodeType::ReLU(self.node_id))
    }

    pub fn sigmoid(&self) -> Self {
        self.unary(NodeType::Sigmoid(self.node_id))
    }

    pub fn softplus(&self) -> Self {
        self.unary(NodeType::Softplus(self.node_id))
    }

    pub fn softmax(&self) -> Self {
        self.unary(NodeType::Softmax(self.node_id))
    }

    pub fn log_softmax(&self) -> Self {
        self.unary(NodeType::LogSoftmax(self.node_id))
    }

    // --- Reductions ---

    pub fn sum(&self) -> Self {
        self.unary(NodeType::Sum(self.node_id))
    }

    pub fn mean(&self) -> Self {
        self.unary(NodeType::Mean(self.node_id))
    }

    pub fn sum_axes(&self, axes: &[usize], keepdim: bool) -> Self {
        self.unary(NodeType::SumAxes { input: self.node_id, axes: axes.to_vec(), keepdim })
    }

    pub fn mean_axes(&self, axes: &[usize], keepdim: bool) -> Self {
        self.unary(NodeType::MeanAxes { input: self.node_id, axes: axes.to_vec(), keepdim })
    }

    // --- Shape manipulation ---

    pub fn reshape(&self, shape: Vec<i64>) -> Self {
        self.unary(NodeType::Reshape(self.node_id, shape))
    }

    pub fn reshape_like(&self, like: &Tensor) -> Self {
        self.unary(NodeType::ReshapeLike(self.node_id, like.node_id))
    }

    pub fn flatten(&self) -> Self {
        self.unary(NodeType::Flatten(self.node_id))
    }

    pub fn transpose(&self, axis1: usize, axis2: usize) -> Self {
        self.unary(NodeType::Transpose(self.node_id, axis1, axis2))
    }

    /// Concatenates along `axis`; all tensors must share one context.
    pub fn concat(tensors: &[&Tensor], axis: usize) -> Self {
        let inputs = tensors.iter().map(|t| t.node_id).collect();
        Self::from_node(&tensors[0].context, NodeType::Concat { inputs, axis })
    }

    // --- Convolution and pooling ---

    pub fn conv2d(
        &self,
        weight: &Tensor,
        bias: Option<&Tensor>,
        stride: (usize, usize),
        padding: (usize, usize),
    ) -> Self {
        self.unary(NodeType::Conv2d {
            input: self.node_id,
            weight: weight.node_id,
            bias: bias.map(|b| b.node_id),
            stride,
            padding,
        })
    }

    pub fn conv_transpose2d(
        &self,
        weight: &Tensor,
        bias: Option<&Tensor>,
        stride: (usize, usize),
        padding: (usize, usize),
    ) -> Self {
        self.unary(NodeType::ConvTranspose2d {
            input: self.node_id,
            weight: weight.node_id,
            bias: bias.map(|b| b.node_id),
            stride,
            padding,
        })
    }

    pub fn max_pool2d(&self, kernel_size: (usize, usize), stride: (usize, usize)) -> Self {
        self.unary(NodeType::MaxPool2d { input: self.node_id, kernel_size, stride })
    }

    // --- Domain adaptation ---

    pub fn gradient_reversal(&self, scale: f32) -> Self {
        self.unary(NodeType::GradientReversal { input: self.node_id, scale })
    }
}

macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $variant:ident) => {
        impl $trait<&Tensor> for &Tensor {
            type Output = Tensor;
            fn $method(self, rhs: &Tensor) -> Self::Output {
                Tensor::from_node(&self.context, NodeType::$variant(self.node_id, rhs.node_id))
            }
        }

        impl $trait<Tensor> for Tensor {
            type Output = Tensor;
            fn $method(self, rhs: Tensor) -> Self::Output {
                (&self).$method(&rhs)
            }
        }

        impl $trait<&Tensor> for Tensor {
            type Output = Tensor;
            fn $method(self, rhs: &Tensor) -> Self::Output {
                (&self).$method(rhs)
            }
        }
    };
}

impl_binary_op!(Add, add, Add);
impl_binary_op!(Sub, sub, Subtract);
impl_binary_op!(Mul, mul, Multiply);
impl_binary_op!(Div, div, Divide);
