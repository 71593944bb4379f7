//! Shape and data type inference.
//!
//! Traverses the computation graph and determines the shape and data type of
//! every node from its operands and operation type.

use crate::asg::{Asg, AsgError, DType, Node, NodeId, NodeType, Shape, Value};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeInferenceError {
    #[error("Graph error: {0}")]
    AsgError(#[from] AsgError),

    #[error("Incompatible shapes for operation '{op}': left operand {shape1:?}, right operand {shape2:?}.")]
    IncompatibleShapes { op: String, shape1: Shape, shape2: Shape },

    #[error("Shape information missing for node {0}. \
             The node has not been processed yet or the graph contains a cycle.")]
    MissingShapeInfo(NodeId),

    #[error("Initial shape not specified for '{0}'. \
             Add the shape to the initial_shapes map when calling ShapeInference::run().")]
    MissingInitialShape(String),

    #[error("Invalid tensor rank for node {node_id}: expected {expected}D, got {actual}D.")]
    InvalidRank { node_id: NodeId, expected: usize, actual: usize },

    #[error("Broadcast error: cannot broadcast shapes {0:?} and {1:?} to a common shape.")]
    BroadcastError(Shape, Shape),

    #[error("Matrix multiplication error: incompatible inner dimensions {0} and {1}.")]
    MatmulDimensionError(usize, usize),

    #[error("Cannot reshape {from:?} into {to:?}.")]
    InvalidReshape { from: Shape, to: Vec<i64> },

    #[error("Window of node {node_id} does not fit its input {shape:?}.")]
    InvalidWindow { node_id: NodeId, shape: Shape },
}

type Result<T> = std::result::Result<T, ShapeInferenceError>;

/// Numpy-style broadcast of two shapes.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Shape> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }
    Some(out)
}

/// Resolves a reshape target where `0` copies the input dimension and `-1` is inferred.
pub fn resolve_reshape(input: &[usize], target: &[i64]) -> Option<Shape> {
    let total: usize = input.iter().product();
    let mut out = Vec::with_capacity(target.len());
    let mut inferred = None;
    for (i, &d) in target.iter().enumerate() {
        match d {
            0 => out.push(*input.get(i)?),
            -1 => {
                if inferred.replace(i).is_some() {
                    return None;
                }
                out.push(1);
            }
            d if d > 0 => out.push(d as usize),
            _ => return None,
        }
    }
    let known: usize = out.iter().product();
    if let Some(i) = inferred {
        if known == 0 || total % known != 0 {
            return None;
        }
        out[i] = total / known;
    } else if known != total {
        return None;
    }
    Some(out)
}

/// Output size of a sliding window along one axis.
pub fn conv_output_size(size: usize, kernel: usize, stride: usize, padding: usize) -> Option<usize> {
    let padded = size + 2 * padding;
    if padded < kernel || stride == 0 {
        return None;
    }
    Some((padded - kernel) / stride + 1)
}

/// Output size of a transposed convolution along one axis.
pub fn conv_transpose_output_size(size: usize, kernel: usize, stride: usize, padding: usize) -> Option<usize> {
    ((size.max(1) - 1) * stride + kernel).checked_sub(2 * padding)
}

/// Performs shape inference for an ASG.
pub struct ShapeInference;

impl ShapeInference {
    /// Fills in the `shape` and `dtype` of every node reachable from the outputs.
    ///
    /// `initial_shapes` provides shapes for all `Input`, `Parameter` and `Buffer`
    /// nodes, keyed by name. `External` nodes keep the shape they were created with.
    pub fn run(asg: &mut Asg, initial_shapes: &HashMap<String, (Shape, DType)>) -> Result<()> {
        let sorted_nodes = Self::topological_sort(asg)?;

        for node_id in sorted_nodes {
            let node = asg.get_node(node_id)?;
            let (shape, dtype) = Self::infer_node_shape(asg, node, initial_shapes)?;

            let node = asg.get_node_mut(node_id)?;
            node.shape = Some(shape);
            node.dtype = Some(dtype);
        }

        Ok(())
    }

    fn infer_node_shape(
        asg: &Asg,
        node: &Node,
        initial_shapes: &HashMap<String, (Shape, DType)>,
    ) -> Result<(Shape, DType)> {
        match &node.node_type {
            NodeType::Input { name } | NodeType::Parameter { name } | NodeType::Buffer { name } => initial_shapes
                .get(name)
                .cloned()
                .ok_or_else(|| ShapeInferenceError::MissingInitialShape(name.clone())),

            NodeType::External { name, .. } => match &node.shape {
                Some(shape) => Ok((shape.clone(), node.dtype.unwrap_or(DType::F32))),
                None => initial_shapes
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ShapeInferenceError::MissingInitialShape(name.clone())),
            },

            NodeType::Literal(value) => match value {
                Value::Tensor(arr) => Ok((arr.shape().to_vec(), DType::F32)),
                Value::ScalarF32(_) => Ok((vec![], DType::F32)),
            },

            NodeType::Add(l, r)
            | NodeType::Subtract(l, r)
            | NodeType::Multiply(l, r)
            | NodeType::Divide(l, r)
            | NodeType::GreaterThan(l, r) => {
                let (ls, ld) = Self::get_shape_dtype(asg, *l)?;
                let (rs, _) = Self::get_shape_dtype(asg, *r)?;
                let out = broadcast_shapes(&ls, &rs).ok_or(ShapeInferenceError::BroadcastError(ls, rs))?;
                Ok((out, ld))
            }

            NodeType::MatrixMultiply(l, r) => {
                let (ls, ld) = Self::get_shape_dtype(asg, *l)?;
                let (rs, _) = Self::get_shape_dtype(asg, *r)?;
                if ls.len() != 2 || rs.len() != 2 {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id: node.id,
                        expected: 2,
                        actual: if ls.len() != 2 { ls.len() } else { rs.len() },
                    });
                }
                if ls[1] != rs[0] {
                    return Err(ShapeInferenceError::MatmulDimensionError(ls[1], rs[0]));
                }
                Ok((vec![ls[0], rs[1]], ld))
            }

            NodeType::Negate(id)
            | NodeType::Exp(id)
            | NodeType::Log(id)
            | NodeType::Sqrt(id)
            | NodeType::ReLU(id)
            | NodeType::Sigmoid(id)
            | NodeType::Softplus(id)
            | NodeType::Softmax(id)
            | NodeType::LogSoftmax(id)
            | NodeType::GradientReversal { input: id, .. } => Self::get_shape_dtype(asg, *id),

            NodeType::Sum(_) | NodeType::Mean(_) => Ok((vec![], DType::F32)),

            NodeType::SumAxes { input, axes, keepdim } | NodeType::MeanAxes { input, axes, keepdim } => {
                let (shape, dtype) = Self::get_shape_dtype(asg, *input)?;
                if let Some(&bad) = axes.iter().find(|&&a| a >= shape.len()) {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id: node.id,
                        expected: bad + 1,
                        actual: shape.len(),
                    });
                }
                let out = shape
                    .iter()
                    .enumerate()
                    .filter_map(|(i, &d)| match (axes.contains(&i), keepdim) {
                        (false, _) => Some(d),
                        (true, true) => Some(1),
                        (true, false) => None,
                    })
                    .collect();
                Ok((out, dtype))
            }

            NodeType::Reshape(id, target) => {
                let (shape, dtype) = Self::get_shape_dtype(asg, *id)?;
                let out = resolve_reshape(&shape, target).ok_or_else(|| ShapeInferenceError::InvalidReshape {
                    from: shape.clone(),
                    to: target.clone(),
                })?;
                Ok((out, dtype))
            }

            NodeType::ReshapeLike(id, like) => {
                let (shape, dtype) = Self::get_shape_dtype(asg, *id)?;
                let (like_shape, _) = Self::get_shape_dtype(asg, *like)?;
                if shape.iter().product::<usize>() != like_shape.iter().product::<usize>() {
                    return Err(ShapeInferenceError::IncompatibleShapes {
                        op: "ReshapeLike".to_string(),
                        shape1: shape,
                        shape2: like_shape,
                    });
                }
                Ok((like_shape, dtype))
            }

            NodeType::Flatten(id) => {
                let (shape, dtype) = Self::get_shape_dtype(asg, *id)?;
                if shape.is_empty() {
                    return Err(ShapeInferenceError::InvalidRank { node_id: node.id, expected: 1, actual: 0 });
                }
                Ok((vec![shape[0], shape[1..].iter().product()], dtype))
            }

            NodeType::Transpose(id, axis1, axis2) => {
                let (mut shape, dtype) = Self::get_shape_dtype(asg, *id)?;
                if *axis1 >= shape.len() || *axis2 >= shape.len() {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id: node.id,
                        expected: axis1.max(axis2) + 1,
                        actual: shape.len(),
                    });
                }
                shape.swap(*axis1, *axis2);
                Ok((shape, dtype))
            }

            NodeType::Broadcast(source_id, target_id) => {
                let (source_shape, dtype) = Self::get_shape_dtype(asg, *source_id)?;
                let (target_shape, _) = Self::get_shape_dtype(asg, *target_id)?;
                match broadcast_shapes(&source_shape, &target_shape) {
                    Some(out) if out == target_shape => Ok((target_shape, dtype)),
                    _ => Err(ShapeInferenceError::BroadcastError(source_shape, target_shape)),
                }
            }

            NodeType::ReduceSumTo(source_id, target_id) => {
                let (_, dtype) = Self::get_shape_dtype(asg, *source_id)?;
                let (target_shape, _) = Self::get_shape_dtype(asg, *target_id)?;
                Ok((target_shape, dtype))
            }

            NodeType::Concat { inputs, axis } => {
                let first = inputs.first().ok_or(ShapeInferenceError::MissingShapeInfo(node.id))?;
                let (mut out, dtype) = Self::get_shape_dtype(asg, *first)?;
                if *axis >= out.len() {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id: node.id,
                        expected: axis + 1,
                        actual: out.len(),
                    });
                }
                for id in &inputs[1..] {
                    let (shape, _) = Self::get_shape_dtype(asg, *id)?;
                    let compatible = shape.len() == out.len()
                        && shape.iter().zip(&out).enumerate().all(|(i, (a, b))| i == *axis || a == b);
                    if !compatible {
                        return Err(ShapeInferenceError::IncompatibleShapes {
                            op: "Concat".to_string(),
                            shape1: out,
                            shape2: shape,
                        });
                    }
                    out[*axis] += shape[*axis];
                }
                Ok((out, dtype))
            }

            NodeType::Slice { input, axis, start, len } => {
                let (mut shape, dtype) = Self::get_shape_dtype(asg, *input)?;
                if *axis >= shape.len() || start + len > shape[*axis] {
                    return Err(ShapeInferenceError::InvalidWindow { node_id: node.id, shape });
                }
                shape[*axis] = *len;
                Ok((shape, dtype))
            }

            NodeType::Conv2d { input, weight, stride, padding, .. } => {
                let (input_shape, dtype) = Self::get_rank4(asg, node.id, *input)?;
                let (weight_shape, _) = Self::get_rank4(asg, node.id, *weight)?;
                if input_shape[1] != weight_shape[1] {
                    return Err(ShapeInferenceError::IncompatibleShapes {
                        op: "Conv2d".to_string(),
                        shape1: input_shape,
                        shape2: weight_shape,
                    });
                }
                let out_h = conv_output_size(input_shape[2], weight_shape[2], stride.0, padding.0);
                let out_w = conv_output_size(input_shape[3], weight_shape[3], stride.1, padding.1);
                match (out_h, out_w) {
                    (Some(h), Some(w)) => Ok((vec![input_shape[0], weight_shape[0], h, w], dtype)),
                    _ => Err(ShapeInferenceError::InvalidWindow { node_id: node.id, shape: input_shape }),
                }
            }

            NodeType::ConvTranspose2d { input, weight, stride, padding, .. } => {
                let (input_shape, dtype) = Self::get_rank4(asg, node.id, *input)?;
                let (weight_shape, _) = Self::get_rank4(asg, node.id, *weight)?;
                if input_shape[1] != weight_shape[0] {
                    return Err(ShapeInferenceError::IncompatibleShapes {
                        op: "ConvTranspose2d".to_string(),
                        shape1: input_shape,
                        shape2: weight_shape,
                    });
                }
                let out_h = conv_transpose_output_size(input_shape[2], weight_shape[2], stride.0, padding.0);
                let out_w = conv_transpose_output_size(input_shape[3], weight_shape[3], stride.1, padding.1);
                match (out_h, out_w) {
                    (Some(h), Some(w)) => Ok((vec![input_shape[0], weight_shape[1], h, w], dtype)),
                    _ => Err(ShapeInferenceError::InvalidWindow { node_id: node.id, shape: input_shape }),
                }
            }

            NodeType::Conv2dBackwardInput { grad_output, input_shape, .. } => {
                let (_, dtype) = Self::get_shape_dtype(asg, *grad_output)?;
                let (n, c, h, w) = *input_shape;
                Ok((vec![n, c, h, w], dtype))
            }

            NodeType::Conv2dBackwardWeight { grad_output, weight_shape, .. } => {
                let (_, dtype) = Self::get_shape_dtype(asg, *grad_output)?;
                let (c_out, c_in, kh, kw) = *weight_shape;
                Ok((vec![c_out, c_in, kh, kw], dtype))
            }

            NodeType::MaxPool2d { input, kernel_size, stride } => {
                let (input_shape, dtype) = Self::get_rank4(asg, node.id, *input)?;
                let out_h = conv_output_size(input_shape[2], kernel_size.0, stride.0, 0);
                let out_w = conv_output_size(input_shape[3], kernel_size.1, stride.1, 0);
                match (out_h, out_w) {
                    (Some(h), Some(w)) => Ok((vec![input_shape[0], input_shape[1], h, w], dtype)),
                    _ => Err(ShapeInferenceError::InvalidWindow { node_id: node.id, shape: input_shape }),
                }
            }

            // Unpooling restores the shape of the pooled input.
            NodeType::MaxUnpool2d { original_input, .. } => Self::get_shape_dtype(asg, *original_input),
        }
    }

    fn get_shape_dtype(asg: &Asg, node_id: NodeId) -> Result<(Shape, DType)> {
        let node = asg.get_node(node_id)?;
        match (&node.shape, &node.dtype) {
            (Some(s), Some(d)) => Ok((s.clone(), *d)),
            _ => Err(ShapeInferenceError::MissingShapeInfo(node_id)),
        }
    }

    fn get_rank4(asg: &Asg, node_id: NodeId, operand: NodeId) -> Result<(Shape, DType)> {
        let (shape, dtype) = Self::get_shape_dtype(asg, operand)?;
        if shape.len() != 4 {
            return Err(ShapeInferenceError::InvalidRank { node_id, expected: 4, actual: shape.len() });
        }
        Ok((shape, dtype))
    }

    /// Orders every node reachable from the graph outputs so that operands come first.
    ///
    /// Uses an explicit stack; U-Net graphs with their gradients are far deeper
    /// than the default thread stack allows for recursion.
    pub fn topological_sort(asg: &Asg) -> Result<Vec<NodeId>> {
        Self::topological_sort_from(asg, &asg.outputs)
    }

    /// Like [`ShapeInference::topological_sort`], restricted to the ancestors of `roots`.
    pub fn topological_sort_from(asg: &Asg, roots: &[NodeId]) -> Result<Vec<NodeId>> {
        let mut sorted = Vec::new();
        let mut visited = HashSet::new();
        let mut stack: Vec<(NodeId, bool)> = Vec::new();

        for &output_id in roots {
            stack.push((output_id, false));
            while let Some((node_id, expanded)) = stack.pop() {
                if expanded {
                    if visited.insert(node_id) {
                        sorted.push(node_id);
                    }
                    continue;
                }
                if visited.contains(&node_id) {
                    continue;
                }
                let deps = asg.get_node(node_id)?.node_type.dependencies();
                stack.push((node_id, true));
                for dep in deps.into_iter().rev() {
                    if !visited.contains(&dep) {
                        stack.push((dep, false));
                    }
                }
            }
        }
        Ok(sorted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shapes(entries: &[(&str, Shape)]) -> HashMap<String, (Shape, DType)> {
        entries.iter().map(|(n, s)| (n.to_string(), (s.clone(), DType::F32))).collect()
    }

    #[test]
    fn broadcast_follows_numpy_rules() {
        assert_eq!(broadcast_shapes(&[2, 3, 4, 4], &[1, 3, 1, 1]), Some(vec![2, 3, 4, 4]));
        assert_eq!(broadcast_shapes(&[5], &[]), Some(vec![5]));
        assert_eq!(broadcast_shapes(&[2, 3], &[3, 2]), None);
    }

    #[test]
    fn reshape_copies_and_infers() {
        assert_eq!(resolve_reshape(&[2, 8, 4, 4], &[0, 4, -1]), Some(vec![2, 4, 32]));
        assert_eq!(resolve_reshape(&[2, 8], &[3, -1]), None);
        assert_eq!(resolve_reshape(&[2, 8], &[-1, -1]), None);
    }

    #[test]
    fn unet_shapes_propagate() {
        let mut asg = Asg::new(0, None);
        let x = asg.add_node(None, NodeType::Input { name: "x".into() });
        let w = asg.add_node(None, NodeType::Parameter { name: "w".into() });
        let conv = asg.add_node(
            None,
            NodeType::Conv2d { input: x, weight: w, bias: None, stride: (1, 1), padding: (1, 1) },
        );
        let pool = asg.add_node(None, NodeType::MaxPool2d { input: conv, kernel_size: (2, 2), stride: (2, 2) });
        let up_w = asg.add_node(None, NodeType::Parameter { name: "up".into() });
        let up = asg.add_node(
            None,
            NodeType::ConvTranspose2d { input: pool, weight: up_w, bias: None, stride: (2, 2), padding: (0, 0) },
        );
        let cat = asg.add_node(None, NodeType::Concat { inputs: vec![conv, up], axis: 1 });
        let flat = asg.add_node(None, NodeType::Flatten(cat));
        asg.set_output(flat);

        let init = shapes(&[("x", vec![2, 1, 8, 8]), ("w", vec![4, 1, 3, 3]), ("up", vec![4, 2, 2, 2])]);
        ShapeInference::run(&mut asg, &init).unwrap();

        assert_eq!(asg.shape_of(pool).unwrap(), &vec![2, 4, 4, 4]);
        assert_eq!(asg.shape_of(up).unwrap(), &vec![2, 2, 8, 8]);
        assert_eq!(asg.shape_of(cat).unwrap(), &vec![2, 6, 8, 8]);
        assert_eq!(asg.shape_of(flat).unwrap(), &vec![2, 384]);
    }

    #[test]
    fn missing_initial_shape_is_reported() {
        let mut asg = Asg::new(0, None);
        let x = asg.add_node(None, NodeType::Input { name: "x".into() });
        let y = asg.add_node(None, NodeType::ReLU(x));
        asg.set_output(y);
        let err = ShapeInference::run(&mut asg, &HashMap::new()).unwrap_err();
        assert_eq!(err, ShapeInferenceError::MissingInitialShape("x".into()));
    }

    #[test]
    fn topological_sort_handles_deep_chains() {
        let mut asg = Asg::new(0, None);
        let mut last = asg.add_node(None, NodeType::Input { name: "x".into() });
        for _ in 0..100_000 {
            last = asg.add_node(None, NodeType::ReLU(last));
        }
        asg.set_output(last);
        let order = ShapeInference::topological_sort(&asg).unwrap();
        assert_eq!(order.len(), 100_001);
        assert_eq!(order[0], 0);
        assert_eq!(*order.last().unwrap(), last);
    }
}
