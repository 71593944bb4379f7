//! # Graph Analysis Module
//!
//! This module contains analysis passes that process the ASG before execution.
//!
//! ## Available Passes
//!
//! - [`ShapeInference`](shape_inference::ShapeInference): Propagates tensor shapes
//!   through the graph, detecting shape mismatches before runtime.
//!
//! ## How It Works
//!
//! Analysis passes traverse the graph and compute/validate metadata:
//!
//! ```text
//! ASG (untyped) -> Shape Inference -> ASG (with shapes/dtypes)
//! ```
//!
//! Shape mismatches between encoder and decoder levels, or a classifier
//! whose flattened input does not match its first linear layer, surface here
//! instead of in the middle of an epoch. The trainer also reads inferred
//! shapes to size the per-channel counts of batch statistics.
//!
//! ## Example
//!
//! ```ignore
//! use unet_dann::analysis::shape_inference::ShapeInference;
//!
//! let mut graph = context.borrow().main_graph().clone();
//! graph.set_output(reconstruction.node_id);
//!
//! // Inputs plus every parameter and buffer
//! let mut shapes = store.shapes();
//! shapes.insert("x".to_string(), (vec![8, 1, 128, 128], DType::F32));
//!
//! // Run shape inference
//! ShapeInference::run(&mut graph, &shapes)?;
//!
//! // Every node reachable from the outputs now has a shape
//! ```

pub mod shape_inference;