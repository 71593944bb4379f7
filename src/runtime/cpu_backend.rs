//! Backend that executes an ASG on the CPU.
//!
//! The graph is evaluated in topological order; every node is computed with
//! `ndarray`. Convolutions are lowered to matrix products over im2col buffers.

use super::backend::{Backend, Memo, RuntimeError};
use crate::analysis::shape_inference::{
    broadcast_shapes, conv_output_size, conv_transpose_output_size, resolve_reshape, ShapeInference,
};
use crate::asg::{Asg, NodeId, NodeType, Value};
use ndarray::{
    concatenate, s, Array2, Array3, Array4, ArrayD, ArrayView2, ArrayView3, ArrayView4, ArrayViewD, Axis, Ix2, Ix4,
    IxDyn, Slice, Zip,
};
use std::collections::HashMap;

type OpResult = Result<ArrayD<f32>, RuntimeError>;

/// Execution state of one graph run.
struct ExecutionContext<'a> {
    asg: &'a Asg,
    /// Values of this run plus anything preloaded (leaves, forward values).
    memo: Memo<Value>,
}

impl<'a> ExecutionContext<'a> {
    /// Value of a node; `External` nodes are resolved to their source.
    fn value(&self, node_id: NodeId) -> Result<&Value, RuntimeError> {
        let node = self.asg.nodes.get(&node_id).ok_or(RuntimeError::NodeNotFound(node_id, self.asg.id))?;
        let key = match &node.node_type {
            NodeType::External { source_asg_id, source_node_id, .. } => (*source_asg_id, *source_node_id),
            _ => (self.asg.id, node_id),
        };
        self.memo.get(&key).ok_or(RuntimeError::NodeNotFound(key.1, key.0))
    }

    fn array(&self, node_id: NodeId) -> Result<ArrayViewD<'_, f32>, RuntimeError> {
        match self.value(node_id)? {
            Value::Tensor(arr) => Ok(arr.view()),
            Value::ScalarF32(_) => Err(RuntimeError::TypeError {
                expected: "Tensor".to_string(),
                actual: "ScalarF32".to_string(),
            }),
        }
    }

    fn evaluate_node(&mut self, node_id: NodeId) -> Result<(), RuntimeError> {
        let asg = self.asg;
        if self.memo.contains_key(&(asg.id, node_id)) {
            return Ok(());
        }
        let node = asg.nodes.get(&node_id).ok_or(RuntimeError::NodeNotFound(node_id, asg.id))?;

        let result = match &node.node_type {
            NodeType::Input { name } => return Err(RuntimeError::MissingInput(name.clone(), node.id)),
            NodeType::Parameter { name } | NodeType::Buffer { name } => {
                return Err(RuntimeError::MissingParameter(name.clone(), node.id))
            }
            NodeType::External { .. } => {
                self.value(node_id)?;
                return Ok(());
            }
            NodeType::Literal(value) => value.clone().into_array(),

            NodeType::Add(l, r) => broadcast_binary(self.array(*l)?, self.array(*r)?, |a, b| a + b)?,
            NodeType::Subtract(l, r) => broadcast_binary(self.array(*l)?, self.array(*r)?, |a, b| a - b)?,
            NodeType::Multiply(l, r) => broadcast_binary(self.array(*l)?, self.array(*r)?, |a, b| a * b)?,
            NodeType::Divide(l, r) => broadcast_binary(self.array(*l)?, self.array(*r)?, |a, b| a / b)?,
            NodeType::GreaterThan(l, r) => {
                broadcast_binary(self.array(*l)?, self.array(*r)?, |a, b| if a > b { 1.0 } else { 0.0 })?
            }

            NodeType::Negate(x) => self.array(*x)?.mapv(|v| -v),
            NodeType::Exp(x) => self.array(*x)?.mapv(f32::exp),
            NodeType::Log(x) => self.array(*x)?.mapv(f32::ln),
            NodeType::Sqrt(x) => self.array(*x)?.mapv(f32::sqrt),
            NodeType::ReLU(x) => self.array(*x)?.mapv(|v| v.max(0.0)),
            NodeType::Sigmoid(x) => self.array(*x)?.mapv(sigmoid),
            NodeType::Softplus(x) => self.array(*x)?.mapv(softplus),
            NodeType::Softmax(x) => op_log_softmax(self.array(*x)?).mapv_into(f32::exp),
            NodeType::LogSoftmax(x) => op_log_softmax(self.array(*x)?),
            NodeType::GradientReversal { input, .. } => self.array(*input)?.to_owned(),

            NodeType::Sum(x) => ndarray::arr0(self.array(*x)?.sum()).into_dyn(),
            NodeType::Mean(x) => ndarray::arr0(self.array(*x)?.mean().unwrap_or(0.0)).into_dyn(),
            NodeType::SumAxes { input, axes, keepdim } => op_sum_axes(self.array(*input)?, axes, *keepdim)?,
            NodeType::MeanAxes { input, axes, keepdim } => {
                let x = self.array(*input)?;
                let count: usize = axes.iter().filter_map(|&a| x.shape().get(a)).product();
                let sum = op_sum_axes(x, axes, *keepdim)?;
                sum / count.max(1) as f32
            }

            NodeType::Reshape(x, target) => {
                let x = self.array(*x)?;
                let shape = resolve_reshape(x.shape(), target).ok_or_else(|| {
                    RuntimeError::ShapeError(format!("cannot reshape {:?} into {:?}", x.shape(), target))
                })?;
                reshape_to(x, &shape)?
            }
            NodeType::ReshapeLike(x, like) => {
                let shape = self.array(*like)?.shape().to_vec();
                reshape_to(self.array(*x)?, &shape)?
            }
            NodeType::Flatten(x) => {
                let x = self.array(*x)?;
                let n = x.shape().first().copied().unwrap_or(1);
                let rest = x.len() / n.max(1);
                reshape_to(x, &[n, rest])?
            }
            NodeType::Transpose(x, a1, a2) => op_transpose(self.array(*x)?, *a1, *a2)?,
            NodeType::Broadcast(x, like) => {
                let shape = self.array(*like)?.shape().to_vec();
                let x = self.array(*x)?;
                x.broadcast(shape.as_slice())
                    .ok_or_else(|| {
                        RuntimeError::ShapeError(format!("cannot broadcast {:?} to {:?}", x.shape(), shape))
                    })?
                    .to_owned()
            }
            NodeType::ReduceSumTo(x, like) => {
                let shape = self.array(*like)?.shape().to_vec();
                op_reduce_sum_to(self.array(*x)?, &shape)?
            }
            NodeType::Concat { inputs, axis } => {
                let views = inputs.iter().map(|id| self.array(*id)).collect::<Result<Vec<_>, _>>()?;
                concatenate(Axis(*axis), &views).map_err(|e| RuntimeError::ShapeError(format!("Concat: {e}")))?
            }
            NodeType::Slice { input, axis, start, len } => {
                let x = self.array(*input)?;
                if *axis >= x.ndim() || start + len > x.shape()[*axis] {
                    return Err(RuntimeError::ShapeError(format!(
                        "slice {start}..{} out of bounds for axis {axis} of {:?}",
                        start + len,
                        x.shape()
                    )));
                }
                x.slice_axis(Axis(*axis), Slice::from(*start..start + len)).to_owned()
            }

            NodeType::MatrixMultiply(l, r) => op_matmul(self.array(*l)?, self.array(*r)?)?,

            NodeType::Conv2d { input, weight, bias, stride, padding } => {
                let bias = bias.map(|b| self.array(b)).transpose()?;
                op_conv2d(self.array(*input)?, self.array(*weight)?, bias, *stride, *padding)?
            }
            NodeType::ConvTranspose2d { input, weight, bias, stride, padding } => {
                let bias = bias.map(|b| self.array(b)).transpose()?;
                op_conv_transpose2d(self.array(*input)?, self.array(*weight)?, bias, *stride, *padding)?
            }
            NodeType::Conv2dBackwardInput { grad_output, weight, input_shape, stride, padding } => {
                op_conv2d_input_grad(self.array(*grad_output)?, self.array(*weight)?, *input_shape, *stride, *padding)?
            }
            NodeType::Conv2dBackwardWeight { grad_output, input, weight_shape, stride, padding } => {
                op_conv2d_weight_grad(self.array(*grad_output)?, self.array(*input)?, *weight_shape, *stride, *padding)?
            }

            NodeType::MaxPool2d { input, kernel_size, stride } => {
                op_max_pool2d(self.array(*input)?, *kernel_size, *stride)?
            }
            NodeType::MaxUnpool2d { input, original_input, kernel_size, stride } => {
                op_max_unpool2d(self.array(*input)?, self.array(*original_input)?, *kernel_size, *stride)?
            }
        };

        self.memo.insert((asg.id, node_id), Value::Tensor(result));
        Ok(())
    }
}

pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CpuBackend {
    type DeviceData = Value;

    fn load_data(&self, data: &HashMap<String, Value>) -> Result<HashMap<String, Self::DeviceData>, RuntimeError> {
        Ok(data.clone())
    }

    fn run(
        &self,
        main_asg: &Asg,
        initial_memo: Memo<Self::DeviceData>,
    ) -> Result<(Vec<Self::DeviceData>, Memo<Self::DeviceData>), RuntimeError> {
        let sorted_nodes = ShapeInference::topological_sort(main_asg)
            .map_err(|e| RuntimeError::ShapeError(format!("topological sort failed: {e}")))?;

        let memo = initial_memo.into_iter().map(|(k, v)| (k, Value::Tensor(v.into_array()))).collect();
        let mut context = ExecutionContext { asg: main_asg, memo };

        for node_id in sorted_nodes {
            context.evaluate_node(node_id)?;
        }

        let results = main_asg
            .outputs
            .iter()
            .map(|&id| context.value(id).cloned())
            .collect::<Result<Vec<_>, _>>()?;
        Ok((results, context.memo))
    }

    fn retrieve_data(&self, device_data: &[Self::DeviceData]) -> Result<Vec<Value>, RuntimeError> {
        Ok(device_data.to_vec())
    }
}

fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// `log(1 + exp(x))` without overflow.
fn softplus(x: f32) -> f32 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

fn broadcast_binary(a: ArrayViewD<f32>, b: ArrayViewD<f32>, f: impl Fn(f32, f32) -> f32) -> OpResult {
    if a.shape() == b.shape() {
        return Ok(Zip::from(&a).and(&b).map_collect(|&x, &y| f(x, y)));
    }
    let shape = broadcast_shapes(a.shape(), b.shape())
        .ok_or_else(|| RuntimeError::ShapeError(format!("cannot broadcast {:?} with {:?}", a.shape(), b.shape())))?;
    let err = || RuntimeError::ShapeError(format!("cannot broadcast to {shape:?}"));
    let av = a.broadcast(shape.as_slice()).ok_or_else(err)?;
    let bv = b.broadcast(shape.as_slice()).ok_or_else(err)?;
    Ok(Zip::from(&av).and(&bv).map_collect(|&x, &y| f(x, y)))
}

fn reshape_to(a: ArrayViewD<f32>, shape: &[usize]) -> OpResult {
    a.as_standard_layout()
        .into_owned()
        .into_shape(IxDyn(shape))
        .map_err(|e| RuntimeError::ShapeError(format!("reshape to {shape:?}: {e}")))
}

fn op_transpose(a: ArrayViewD<f32>, axis1: usize, axis2: usize) -> OpResult {
    if axis1 >= a.ndim() || axis2 >= a.ndim() {
        return Err(RuntimeError::ShapeError(format!("transpose axes ({axis1}, {axis2}) for rank {}", a.ndim())));
    }
    let mut axes: Vec<usize> = (0..a.ndim()).collect();
    axes.swap(axis1, axis2);
    Ok(a.permuted_axes(axes).as_standard_layout().into_owned())
}

fn op_sum_axes(a: ArrayViewD<f32>, axes: &[usize], keepdim: bool) -> OpResult {
    let mut sorted = axes.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    if let Some(&bad) = sorted.iter().find(|&&ax| ax >= a.ndim()) {
        return Err(RuntimeError::ShapeError(format!("axis {bad} out of range for rank {}", a.ndim())));
    }

    let mut iter = sorted.iter().rev();
    let mut out = match iter.next() {
        Some(&ax) => a.sum_axis(Axis(ax)),
        None => return Ok(a.to_owned()),
    };
    for &ax in iter {
        out = out.sum_axis(Axis(ax));
    }
    if keepdim {
        for &ax in &sorted {
            out = out.insert_axis(Axis(ax));
        }
    }
    Ok(out)
}

/// Sums a broadcast gradient back down to `target`.
fn op_reduce_sum_to(a: ArrayViewD<f32>, target: &[usize]) -> OpResult {
    if a.shape() == target {
        return Ok(a.to_owned());
    }
    if target.iter().product::<usize>() == 1 {
        return reshape_to(ndarray::arr0(a.sum()).into_dyn().view(), target);
    }
    let mut out = a.to_owned();
    while out.ndim() > target.len() {
        out = out.sum_axis(Axis(0));
    }
    for (i, &d) in target.iter().enumerate() {
        if d == 1 && out.ndim() == target.len() && out.shape()[i] != 1 {
            out = out.sum_axis(Axis(i)).insert_axis(Axis(i));
        }
    }
    reshape_to(out.view(), target)
}

/// Log-softmax over the last axis.
fn op_log_softmax(a: ArrayViewD<f32>) -> ArrayD<f32> {
    let mut out = a.to_owned();
    if out.ndim() == 0 {
        out.fill(0.0);
        return out;
    }
    let last = Axis(out.ndim() - 1);
    for mut lane in out.lanes_mut(last) {
        let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        let lse = lane.fold(0.0, |acc, &v| acc + (v - max).exp()).ln() + max;
        lane.mapv_inplace(|v| v - lse);
    }
    out
}

fn op_matmul(lhs: ArrayViewD<f32>, rhs: ArrayViewD<f32>) -> OpResult {
    let a = lhs
        .into_dimensionality::<Ix2>()
        .map_err(|e| RuntimeError::ShapeError(format!("MatrixMultiply lhs: {e}")))?;
    let b = rhs
        .into_dimensionality::<Ix2>()
        .map_err(|e| RuntimeError::ShapeError(format!("MatrixMultiply rhs: {e}")))?;
    if a.ncols() != b.nrows() {
        return Err(RuntimeError::ShapeError(format!("incompatible matmul shapes {:?} and {:?}", a.dim(), b.dim())));
    }
    Ok(a.dot(&b).into_dyn())
}

fn as4<'v>(a: ArrayViewD<'v, f32>, what: &str) -> Result<ArrayView4<'v, f32>, RuntimeError> {
    a.into_dimensionality::<Ix4>().map_err(|e| RuntimeError::ShapeError(format!("{what}: {e}")))
}

fn window_error(op: &str, shape: &[usize]) -> RuntimeError {
    RuntimeError::ShapeError(format!("{op}: window does not fit input {shape:?}"))
}

/// Unfolds sliding windows of `img` `[C, H, W]` into columns `[C*kH*kW, oH*oW]`.
fn im2col(
    img: ArrayView3<f32>,
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
    out_size: (usize, usize),
) -> Array2<f32> {
    let (c, h, w) = img.dim();
    let (kh, kw) = kernel;
    let (oh, ow) = out_size;
    let mut cols = Array2::<f32>::zeros((c * kh * kw, oh * ow));
    for ci in 0..c {
        for ki in 0..kh {
            for kj in 0..kw {
                let mut row = cols.row_mut((ci * kh + ki) * kw + kj);
                for y in 0..oh {
                    let iy = (y * stride.0 + ki) as isize - padding.0 as isize;
                    if iy < 0 || iy >= h as isize {
                        continue;
                    }
                    for x in 0..ow {
                        let ix = (x * stride.1 + kj) as isize - padding.1 as isize;
                        if ix >= 0 && ix < w as isize {
                            row[y * ow + x] = img[[ci, iy as usize, ix as usize]];
                        }
                    }
                }
            }
        }
    }
    cols
}

/// Folds columns back into an image, accumulating overlapping windows.
fn col2im(
    cols: ArrayView2<f32>,
    image_shape: (usize, usize, usize),
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
    out_size: (usize, usize),
) -> Array3<f32> {
    let (c, h, w) = image_shape;
    let (kh, kw) = kernel;
    let (oh, ow) = out_size;
    let mut img = Array3::<f32>::zeros((c, h, w));
    for ci in 0..c {
        for ki in 0..kh {
            for kj in 0..kw {
                let row = cols.row((ci * kh + ki) * kw + kj);
                for y in 0..oh {
                    let iy = (y * stride.0 + ki) as isize - padding.0 as isize;
                    if iy < 0 || iy >= h as isize {
                        continue;
                    }
                    for x in 0..ow {
                        let ix = (x * stride.1 + kj) as isize - padding.1 as isize;
                        if ix >= 0 && ix < w as isize {
                            img[[ci, iy as usize, ix as usize]] += row[y * ow + x];
                        }
                    }
                }
            }
        }
    }
    img
}

fn weight_matrix(weight: ArrayView4<f32>) -> Result<Array2<f32>, RuntimeError> {
    let (rows, c, kh, kw) = weight.dim();
    weight
        .as_standard_layout()
        .into_owned()
        .into_shape((rows, c * kh * kw))
        .map_err(|e| RuntimeError::ShapeError(format!("weight matrix: {e}")))
}

fn add_channel_bias(out: &mut Array4<f32>, bias: ArrayViewD<f32>) -> Result<(), RuntimeError> {
    let channels = out.dim().1;
    if bias.len() != channels {
        return Err(RuntimeError::ShapeError(format!("bias of {} values for {channels} channels", bias.len())));
    }
    for (c, &b) in bias.iter().enumerate() {
        out.index_axis_mut(Axis(1), c).mapv_inplace(|v| v + b);
    }
    Ok(())
}

/// Input `[N, C_in, H, W]`, weight `[C_out, C_in, kH, kW]`, bias `[C_out]`.
fn op_conv2d(
    input: ArrayViewD<f32>,
    weight: ArrayViewD<f32>,
    bias: Option<ArrayViewD<f32>>,
    stride: (usize, usize),
    padding: (usize, usize),
) -> OpResult {
    let x = as4(input, "Conv2d input")?;
    let w = as4(weight, "Conv2d weight")?;
    let (n, c_in, h, wd) = x.dim();
    let (c_out, w_in, kh, kw) = w.dim();
    if c_in != w_in {
        return Err(RuntimeError::ShapeError(format!("Conv2d: input has {c_in} channels, weight expects {w_in}")));
    }
    let oh = conv_output_size(h, kh, stride.0, padding.0).ok_or_else(|| window_error("Conv2d", x.shape()))?;
    let ow = conv_output_size(wd, kw, stride.1, padding.1).ok_or_else(|| window_error("Conv2d", x.shape()))?;

    let w2 = weight_matrix(w)?;
    let mut out = Array4::<f32>::zeros((n, c_out, oh, ow));
    for b in 0..n {
        let cols = im2col(x.index_axis(Axis(0), b), (kh, kw), stride, padding, (oh, ow));
        let y = w2
            .dot(&cols)
            .into_shape((c_out, oh, ow))
            .map_err(|e| RuntimeError::ShapeError(format!("Conv2d output: {e}")))?;
        out.index_axis_mut(Axis(0), b).assign(&y);
    }
    if let Some(bias) = bias {
        add_channel_bias(&mut out, bias)?;
    }
    Ok(out.into_dyn())
}

/// Gradient of a convolution with respect to its input.
///
/// `grad_output` is `[N, C_out, oH, oW]`, `weight` is `[C_out, C_in, kH, kW]`,
/// the result has `input_shape`.
fn op_conv2d_input_grad(
    grad_output: ArrayViewD<f32>,
    weight: ArrayViewD<f32>,
    input_shape: (usize, usize, usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
) -> OpResult {
    let g = as4(grad_output, "Conv2dBackwardInput grad")?;
    let w = as4(weight, "Conv2dBackwardInput weight")?;
    let (n, c_in, h, wd) = input_shape;
    let (c_out, w_in, kh, kw) = w.dim();
    let (gn, gc, oh, ow) = g.dim();
    let expected = (conv_output_size(h, kh, stride.0, padding.0), conv_output_size(wd, kw, stride.1, padding.1));
    if gn != n || gc != c_out || w_in != c_in || expected != (Some(oh), Some(ow)) {
        return Err(RuntimeError::ShapeError(format!(
            "Conv2dBackwardInput: grad {:?} and weight {:?} do not match input {input_shape:?}",
            g.dim(),
            w.dim()
        )));
    }

    let w2 = weight_matrix(w)?;
    let mut out = Array4::<f32>::zeros((n, c_in, h, wd));
    for b in 0..n {
        let g2 = g
            .index_axis(Axis(0), b)
            .as_standard_layout()
            .into_owned()
            .into_shape((c_out, oh * ow))
            .map_err(|e| RuntimeError::ShapeError(format!("Conv2dBackwardInput grad: {e}")))?;
        let cols = w2.t().dot(&g2);
        let img = col2im(cols.view(), (c_in, h, wd), (kh, kw), stride, padding, (oh, ow));
        out.index_axis_mut(Axis(0), b).assign(&img);
    }
    Ok(out.into_dyn())
}

/// Gradient of a convolution with respect to its weight.
fn op_conv2d_weight_grad(
    grad_output: ArrayViewD<f32>,
    input: ArrayViewD<f32>,
    weight_shape: (usize, usize, usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
) -> OpResult {
    let g = as4(grad_output, "Conv2dBackwardWeight grad")?;
    let x = as4(input, "Conv2dBackwardWeight input")?;
    let (c_out, c_in, kh, kw) = weight_shape;
    let (n, xc, h, wd) = x.dim();
    let (gn, gc, oh, ow) = g.dim();
    let expected = (conv_output_size(h, kh, stride.0, padding.0), conv_output_size(wd, kw, stride.1, padding.1));
    if gn != n || gc != c_out || xc != c_in || expected != (Some(oh), Some(ow)) {
        return Err(RuntimeError::ShapeError(format!(
            "Conv2dBackwardWeight: grad {:?} and input {:?} do not match weight {weight_shape:?}",
            g.dim(),
            x.dim()
        )));
    }

    let mut acc = Array2::<f32>::zeros((c_out, c_in * kh * kw));
    for b in 0..n {
        let cols = im2col(x.index_axis(Axis(0), b), (kh, kw), stride, padding, (oh, ow));
        let g2 = g
            .index_axis(Axis(0), b)
            .as_standard_layout()
            .into_owned()
            .into_shape((c_out, oh * ow))
            .map_err(|e| RuntimeError::ShapeError(format!("Conv2dBackwardWeight grad: {e}")))?;
        acc += &g2.dot(&cols.t());
    }
    acc.into_shape((c_out, c_in, kh, kw))
        .map(|a| a.into_dyn())
        .map_err(|e| RuntimeError::ShapeError(format!("Conv2dBackwardWeight output: {e}")))
}

/// Input `[N, C_in, H, W]`, weight `[C_in, C_out, kH, kW]`, bias `[C_out]`.
fn op_conv_transpose2d(
    input: ArrayViewD<f32>,
    weight: ArrayViewD<f32>,
    bias: Option<ArrayViewD<f32>>,
    stride: (usize, usize),
    padding: (usize, usize),
) -> OpResult {
    let x = as4(input.view(), "ConvTranspose2d input")?;
    let w = as4(weight.view(), "ConvTranspose2d weight")?;
    let (n, _, h, wd) = x.dim();
    let (_, c_out, kh, kw) = w.dim();
    let oh = conv_transpose_output_size(h, kh, stride.0, padding.0)
        .ok_or_else(|| window_error("ConvTranspose2d", x.shape()))?;
    let ow = conv_transpose_output_size(wd, kw, stride.1, padding.1)
        .ok_or_else(|| window_error("ConvTranspose2d", x.shape()))?;

    let out = op_conv2d_input_grad(input, weight, (n, c_out, oh, ow), stride, padding)?;
    let mut out = out
        .into_dimensionality::<Ix4>()
        .map_err(|e| RuntimeError::ShapeError(format!("ConvTranspose2d output: {e}")))?;
    if let Some(bias) = bias {
        add_channel_bias(&mut out, bias)?;
    }
    Ok(out.into_dyn())
}

fn op_max_pool2d(input: ArrayViewD<f32>, kernel_size: (usize, usize), stride: (usize, usize)) -> OpResult {
    let x = as4(input, "MaxPool2d input")?;
    let (n, c, h, w) = x.dim();
    let (kh, kw) = kernel_size;
    let oh = conv_output_size(h, kh, stride.0, 0).ok_or_else(|| window_error("MaxPool2d", x.shape()))?;
    let ow = conv_output_size(w, kw, stride.1, 0).ok_or_else(|| window_error("MaxPool2d", x.shape()))?;
    let mut out = Array4::<f32>::zeros((n, c, oh, ow));
    for ni in 0..n {
        for ci in 0..c {
            for y in 0..oh {
                for xi in 0..ow {
                    let (hs, ws) = (y * stride.0, xi * stride.1);
                    let window = x.slice(s![ni, ci, hs..hs + kh, ws..ws + kw]);
                    out[[ni, ci, y, xi]] = window.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
                }
            }
        }
    }
    Ok(out.into_dyn())
}

/// Routes each pooled gradient to the first maximum of its window.
fn op_max_unpool2d(
    grad: ArrayViewD<f32>,
    original_input: ArrayViewD<f32>,
    kernel_size: (usize, usize),
    stride: (usize, usize),
) -> OpResult {
    let g = as4(grad, "MaxUnpool2d grad")?;
    let x = as4(original_input, "MaxUnpool2d input")?;
    let (kh, kw) = kernel_size;
    let mut out = Array4::<f32>::zeros(x.dim());
    let (n, c, oh, ow) = g.dim();
    if n != x.dim().0 || c != x.dim().1 {
        return Err(RuntimeError::ShapeError(format!("MaxUnpool2d: grad {:?} vs input {:?}", g.dim(), x.dim())));
    }
    for ni in 0..n {
        for ci in 0..c {
            for y in 0..oh {
                for xi in 0..ow {
                    let (hs, ws) = (y * stride.0, xi * stride.1);
                    let mut best = f32::NEG_INFINITY;
                    let mut pos = (hs, ws);
                    for r in hs..hs + kh {
                        for col in ws..ws + kw {
                            if x[[ni, ci, r, col]] > best {
                                best = x[[ni, ci, r, col]];
                                pos = (r, col);
                            }
                        }
                    }
                    out[[ni, ci, pos.0, pos.1]] += g[[ni, ci, y, xi]];
                }
            }
        }
    }
    Ok(out.into_dyn())
}
