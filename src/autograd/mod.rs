//! Reverse-mode differentiation: builds the graph of d(loss)/d(node).
//!
//! Algorithm:
//!  - walk the forward graph in reverse topological order starting from the loss;
//!  - for every node with an incoming gradient, emit the contributions to its
//!    operands and accumulate them with `Add`;
//!  - the result is a separate graph (id 1) whose outputs are the requested
//!    gradients, in order.
//!
//! Forward values needed by a rule (operands, outputs) are referenced through
//! `External` nodes, which the backend resolves from the memo of the forward
//! run. The forward graph must have gone through shape inference.

use crate::analysis::shape_inference::{ShapeInference, ShapeInferenceError};
use crate::asg::{Asg, AsgError, DType, NodeId, NodeType, Shape, Value};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AutogradError {
    #[error("ASG: {0}")]
    Asg(#[from] AsgError),
    #[error("Shape: {0}")]
    Shape(#[from] ShapeInferenceError),
    #[error("no gradient rule for {0}")]
    Unsupported(String),
}

pub type AutogradResult<T> = Result<T, AutogradError>;

/// Entry point of the gradient builder.
pub struct Gradients<'a> {
    inner: Autograd<'a>,
}

impl<'a> Gradients<'a> {
    pub fn new(src: &'a Asg) -> Self {
        Self { inner: Autograd::new(src) }
    }

    /// Builds and shape-infers the gradient graph of `loss_id` with respect to `wrt`.
    ///
    /// Output `i` of the returned graph is the gradient of `wrt[i]`; a node with
    /// no path to the loss gets zeros of its own shape.
    pub fn build(mut self, loss_id: NodeId, wrt: &[NodeId]) -> AutogradResult<Asg> {
        self.inner.build(loss_id, wrt)?;
        ShapeInference::run(&mut self.inner.grad, &HashMap::new())?;
        Ok(self.inner.grad)
    }
}

struct Autograd<'a> {
    src: &'a Asg,
    grad: Asg,
    /// Forward node -> accumulated gradient node in `grad`.
    gmap: HashMap<NodeId, NodeId>,
    /// Forward node -> its `External` image in `grad`.
    externals: HashMap<NodeId, NodeId>,
}

impl<'a> Autograd<'a> {
    fn new(src: &'a Asg) -> Self {
        Self {
            src,
            grad: Asg::new(1, Some("grad".to_string())),
            gmap: HashMap::new(),
            externals: HashMap::new(),
        }
    }

    fn build(&mut self, loss_id: NodeId, wrt: &[NodeId]) -> AutogradResult<()> {
        let order = ShapeInference::topological_sort_from(self.src, &[loss_id])?;

        let seed = if self.shape(loss_id)?.is_empty() {
            self.lit_scalar(1.0)
        } else {
            let one = self.lit_scalar(1.0);
            let like = self.reuse(loss_id)?;
            self.add_node(NodeType::Broadcast(one, like))
        };
        self.gmap.insert(loss_id, seed);

        for &id in order.iter().rev() {
            let Some(g) = self.gmap.get(&id).copied() else {
                continue;
            };
            let node_type = self.src.get_node(id)?.node_type.clone();
            self.backward(id, &node_type, g)?;
        }

        let mut outputs = Vec::with_capacity(wrt.len());
        for &target in wrt {
            let g = match self.gmap.get(&target).copied() {
                Some(g) => g,
                None => {
                    let zero = self.lit_scalar(0.0);
                    let like = self.reuse(target)?;
                    self.add_node(NodeType::Broadcast(zero, like))
                }
            };
            if let Some(name) = self.src.get_node(target)?.name.clone() {
                self.grad.get_node_mut(g)?.name.get_or_insert(format!("grad.{name}"));
            }
            outputs.push(g);
        }
        self.grad.set_outputs(outputs);
        Ok(())
    }

    /// Emits the contributions of node `id` (gradient `g`) to its operands.
    fn backward(&mut self, id: NodeId, node_type: &NodeType, g: NodeId) -> AutogradResult<()> {
        match node_type {
            NodeType::Input { .. }
            | NodeType::Parameter { .. }
            | NodeType::Buffer { .. }
            | NodeType::Literal(_)
            | NodeType::External { .. } => {}

            // Masks carry no gradient.
            NodeType::GreaterThan(..) => {}

            NodeType::Add(a, b) => {
                let ga = self.reduce_to(g, id, *a)?;
                self.acc(*a, ga);
                let gb = self.reduce_to(g, id, *b)?;
                self.acc(*b, gb);
            }
            NodeType::Subtract(a, b) => {
                let ga = self.reduce_to(g, id, *a)?;
                self.acc(*a, ga);
                let neg = self.add_node(NodeType::Negate(g));
                let gb = self.reduce_to(neg, id, *b)?;
                self.acc(*b, gb);
            }
            NodeType::Multiply(a, b) => {
                let a_im = self.reuse(*a)?;
                let b_im = self.reuse(*b)?;
                let ga = self.add_node(NodeType::Multiply(g, b_im));
                let ga = self.reduce_to(ga, id, *a)?;
                self.acc(*a, ga);
                let gb = self.add_node(NodeType::Multiply(g, a_im));
                let gb = self.reduce_to(gb, id, *b)?;
                self.acc(*b, gb);
            }
            NodeType::Divide(a, b) => {
                // y = a / b: da = g / b, db = -g * y / b
                let b_im = self.reuse(*b)?;
                let y_im = self.reuse(id)?;
                let ga = self.add_node(NodeType::Divide(g, b_im));
                let ga = self.reduce_to(ga, id, *a)?;
                self.acc(*a, ga);
                let ratio = self.add_node(NodeType::Divide(y_im, b_im));
                let prod = self.add_node(NodeType::Multiply(g, ratio));
                let gb = self.add_node(NodeType::Negate(prod));
                let gb = self.reduce_to(gb, id, *b)?;
                self.acc(*b, gb);
            }
            NodeType::MatrixMultiply(a, b) => {
                let b_im = self.reuse(*b)?;
                let bt = self.add_node(NodeType::Transpose(b_im, 0, 1));
                let ga = self.add_node(NodeType::MatrixMultiply(g, bt));
                self.acc(*a, ga);
                let a_im = self.reuse(*a)?;
                let at = self.add_node(NodeType::Transpose(a_im, 0, 1));
                let gb = self.add_node(NodeType::MatrixMultiply(at, g));
                self.acc(*b, gb);
            }

            NodeType::Negate(x) => {
                let gx = self.add_node(NodeType::Negate(g));
                self.acc(*x, gx);
            }
            NodeType::Exp(x) => {
                let y_im = self.reuse(id)?;
                let gx = self.add_node(NodeType::Multiply(g, y_im));
                self.acc(*x, gx);
            }
            NodeType::Log(x) => {
                let x_im = self.reuse(*x)?;
                let gx = self.add_node(NodeType::Divide(g, x_im));
                self.acc(*x, gx);
            }
            NodeType::Sqrt(x) => {
                let y_im = self.reuse(id)?;
                let two = self.lit_scalar(2.0);
                let denom = self.add_node(NodeType::Multiply(two, y_im));
                let gx = self.add_node(NodeType::Divide(g, denom));
                self.acc(*x, gx);
            }
            NodeType::ReLU(x) => {
                let x_im = self.reuse(*x)?;
                let zero = self.lit_scalar(0.0);
                let mask = self.add_node(NodeType::GreaterThan(x_im, zero));
                let gx = self.add_node(NodeType::Multiply(g, mask));
                self.acc(*x, gx);
            }
            NodeType::Sigmoid(x) => {
                let s = self.reuse(id)?;
                let one = self.lit_scalar(1.0);
                let one_minus_s = self.add_node(NodeType::Subtract(one, s));
                let ds = self.add_node(NodeType::Multiply(s, one_minus_s));
                let gx = self.add_node(NodeType::Multiply(g, ds));
                self.acc(*x, gx);
            }
            NodeType::Softplus(x) => {
                let x_im = self.reuse(*x)?;
                let s = self.add_node(NodeType::Sigmoid(x_im));
                let gx = self.add_node(NodeType::Multiply(g, s));
                self.acc(*x, gx);
            }
            NodeType::Softmax(x) => {
                // dx = y * (g - sum(g * y, last))
                let last = self.last_axis(*x)?;
                let y = self.reuse(id)?;
                let gy = self.add_node(NodeType::Multiply(g, y));
                let dot = self.add_node(NodeType::SumAxes { input: gy, axes: vec![last], keepdim: true });
                let centered = self.add_node(NodeType::Subtract(g, dot));
                let gx = self.add_node(NodeType::Multiply(y, centered));
                self.acc(*x, gx);
            }
            NodeType::LogSoftmax(x) => {
                // dx = g - softmax(x) * sum(g, last)
                let last = self.last_axis(*x)?;
                let y = self.reuse(id)?;
                let probs = self.add_node(NodeType::Exp(y));
                let total = self.add_node(NodeType::SumAxes { input: g, axes: vec![last], keepdim: true });
                let scaled = self.add_node(NodeType::Multiply(probs, total));
                let gx = self.add_node(NodeType::Subtract(g, scaled));
                self.acc(*x, gx);
            }

            NodeType::Sum(x) => {
                let x_im = self.reuse(*x)?;
                let gx = self.add_node(NodeType::Broadcast(g, x_im));
                self.acc(*x, gx);
            }
            NodeType::Mean(x) => {
                let n = self.shape(*x)?.iter().product::<usize>().max(1);
                let inv_n = self.lit_scalar(1.0 / n as f32);
                let scaled = self.add_node(NodeType::Multiply(g, inv_n));
                let x_im = self.reuse(*x)?;
                let gx = self.add_node(NodeType::Broadcast(scaled, x_im));
                self.acc(*x, gx);
            }
            NodeType::SumAxes { input, axes, keepdim } => {
                let gx = self.expand_reduced(g, *input, axes, *keepdim, 1.0)?;
                self.acc(*input, gx);
            }
            NodeType::MeanAxes { input, axes, keepdim } => {
                let shape = self.shape(*input)?;
                let n: usize = axes.iter().map(|&a| shape[a]).product::<usize>().max(1);
                let gx = self.expand_reduced(g, *input, axes, *keepdim, 1.0 / n as f32)?;
                self.acc(*input, gx);
            }

            NodeType::Reshape(x, _) | NodeType::ReshapeLike(x, _) | NodeType::Flatten(x) => {
                let x_im = self.reuse(*x)?;
                let gx = self.add_node(NodeType::ReshapeLike(g, x_im));
                self.acc(*x, gx);
            }
            NodeType::Transpose(x, a1, a2) => {
                let gx = self.add_node(NodeType::Transpose(g, *a2, *a1));
                self.acc(*x, gx);
            }
            NodeType::Broadcast(x, _) => {
                let x_im = self.reuse(*x)?;
                let gx = self.add_node(NodeType::ReduceSumTo(g, x_im));
                self.acc(*x, gx);
            }
            NodeType::ReduceSumTo(x, _) => {
                let x_im = self.reuse(*x)?;
                let gx = self.add_node(NodeType::Broadcast(g, x_im));
                self.acc(*x, gx);
            }
            NodeType::Concat { inputs, axis } => {
                let mut start = 0;
                for &input in inputs {
                    let len = self.shape(input)?[*axis];
                    let gx = self.add_node(NodeType::Slice { input: g, axis: *axis, start, len });
                    self.acc(input, gx);
                    start += len;
                }
            }

            NodeType::Conv2d { input, weight, bias, stride, padding } => {
                let input_shape = self.shape4(*input)?;
                let weight_shape = self.shape4(*weight)?;
                let w_im = self.reuse(*weight)?;
                let gx = self.add_node(NodeType::Conv2dBackwardInput {
                    grad_output: g,
                    weight: w_im,
                    input_shape,
                    stride: *stride,
                    padding: *padding,
                });
                self.acc(*input, gx);
                let x_im = self.reuse(*input)?;
                let gw = self.add_node(NodeType::Conv2dBackwardWeight {
                    grad_output: g,
                    input: x_im,
                    weight_shape,
                    stride: *stride,
                    padding: *padding,
                });
                self.acc(*weight, gw);
                if let Some(b) = bias {
                    let gb = self.add_node(NodeType::SumAxes { input: g, axes: vec![0, 2, 3], keepdim: false });
                    self.acc(*b, gb);
                }
            }
            NodeType::ConvTranspose2d { input, weight, bias, stride, padding } => {
                // The transposed convolution is the input-gradient of a convolution
                // with the same weight, so its gradients swap roles accordingly.
                let weight_shape = self.shape4(*weight)?;
                let w_im = self.reuse(*weight)?;
                let gx = self.add_node(NodeType::Conv2d {
                    input: g,
                    weight: w_im,
                    bias: None,
                    stride: *stride,
                    padding: *padding,
                });
                self.acc(*input, gx);
                let x_im = self.reuse(*input)?;
                let gw = self.add_node(NodeType::Conv2dBackwardWeight {
                    grad_output: x_im,
                    input: g,
                    weight_shape,
                    stride: *stride,
                    padding: *padding,
                });
                self.acc(*weight, gw);
                if let Some(b) = bias {
                    let gb = self.add_node(NodeType::SumAxes { input: g, axes: vec![0, 2, 3], keepdim: false });
                    self.acc(*b, gb);
                }
            }

            NodeType::MaxPool2d { input, kernel_size, stride } => {
                let x_im = self.reuse(*input)?;
                let gx = self.add_node(NodeType::MaxUnpool2d {
                    input: g,
                    original_input: x_im,
                    kernel_size: *kernel_size,
                    stride: *stride,
                });
                self.acc(*input, gx);
            }

            NodeType::GradientReversal { input, scale } => {
                let factor = self.lit_scalar(-scale);
                let gx = self.add_node(NodeType::Multiply(g, factor));
                self.acc(*input, gx);
            }

            NodeType::Slice { .. }
            | NodeType::Conv2dBackwardInput { .. }
            | NodeType::Conv2dBackwardWeight { .. }
            | NodeType::MaxUnpool2d { .. } => {
                return Err(AutogradError::Unsupported(node_type.op_name().to_string()));
            }
        }
        Ok(())
    }

    fn add_node(&mut self, node_type: NodeType) -> NodeId {
        self.grad.add_node(None, node_type)
    }

    fn lit_scalar(&mut self, v: f32) -> NodeId {
        self.grad.add_node(None, NodeType::Literal(Value::ScalarF32(v)))
    }

    /// `External` image of a forward node, created once per source node.
    fn reuse(&mut self, src_id: NodeId) -> AutogradResult<NodeId> {
        if let Some(&existing) = self.externals.get(&src_id) {
            return Ok(existing);
        }
        let src = self.src.get_node(src_id)?;
        let shape = src.shape.clone().ok_or(AsgError::InvalidShape(src_id))?;
        let dtype = src.dtype.unwrap_or(DType::F32);
        let name = src.name.clone().unwrap_or_else(|| format!("fwd_{src_id}"));
        let id = self.grad.add_node(
            Some(name.clone()),
            NodeType::External { name, source_asg_id: self.src.id, source_node_id: src_id },
        );
        let node = self.grad.get_node_mut(id)?;
        node.shape = Some(shape);
        node.dtype = Some(dtype);
        self.externals.insert(src_id, id);
        Ok(id)
    }

    /// dL/d(target) += contrib
    fn acc(&mut self, target: NodeId, contrib: NodeId) {
        let total = match self.gmap.get(&target).copied() {
            Some(prev) => self.add_node(NodeType::Add(prev, contrib)),
            None => contrib,
        };
        self.gmap.insert(target, total);
    }

    /// Sums a gradient shaped like `out_id` down to the shape of operand `src_id`.
    fn reduce_to(&mut self, g: NodeId, out_id: NodeId, src_id: NodeId) -> AutogradResult<NodeId> {
        if self.shape(out_id)? == self.shape(src_id)? {
            return Ok(g);
        }
        let src_im = self.reuse(src_id)?;
        Ok(self.add_node(NodeType::ReduceSumTo(g, src_im)))
    }

    /// Gradient of an axis reduction: restore reduced axes, scale, broadcast back.
    fn expand_reduced(
        &mut self,
        g: NodeId,
        input: NodeId,
        axes: &[usize],
        keepdim: bool,
        factor: f32,
    ) -> AutogradResult<NodeId> {
        let shape = self.shape(input)?;
        let mut g = g;
        if !keepdim {
            let kept: Vec<i64> =
                shape.iter().enumerate().map(|(i, &d)| if axes.contains(&i) { 1 } else { d as i64 }).collect();
            g = self.add_node(NodeType::Reshape(g, kept));
        }
        if factor != 1.0 {
            let f = self.lit_scalar(factor);
            g = self.add_node(NodeType::Multiply(g, f));
        }
        let x_im = self.reuse(input)?;
        Ok(self.add_node(NodeType::Broadcast(g, x_im)))
    }

    fn shape(&self, src_id: NodeId) -> AutogradResult<Shape> {
        Ok(self.src.shape_of(src_id)?.clone())
    }

    fn shape4(&self, src_id: NodeId) -> AutogradResult<(usize, usize, usize, usize)> {
        match self.shape(src_id)?.as_slice() {
            &[a, b, c, d] => Ok((a, b, c, d)),
            _ => Err(AsgError::InvalidShape(src_id).into()),
        }
    }

    fn last_axis(&self, src_id: NodeId) -> AutogradResult<usize> {
        Ok(self.shape(src_id)?.len().saturating_sub(1))
    }
}
