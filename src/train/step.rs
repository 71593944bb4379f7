//! Compiled forward and gradient graphs for one input shape.

use super::{TrainError, TrainResult};
use crate::analysis::shape_inference::ShapeInference;
use crate::asg::{Asg, AsgError, DType, NodeId, Shape, Value};
use crate::autograd::Gradients;
use crate::config::ModelConfig;
use crate::losses::{cross_entropy_loss, ReconstructionLoss};
use crate::model::UNetAE;
use crate::runtime::backend::{bind_leaves, Backend};
use crate::runtime::cpu_backend::CpuBackend;
use crate::state::ParamStore;
use crate::tensor::{BatchStatistics, GraphContext, Mode, Tensor};
use ndarray::ArrayD;
use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::debug;

/// Name of the image batch input.
pub const INPUT: &str = "x";
/// Name of the one-hot `[N, 2]` domain label input.
pub const DOMAIN_LABELS: &str = "domain_labels";

/// Batch statistics of one normalization layer, ready to fold into the running statistics.
#[derive(Debug, Clone)]
pub struct BatchUpdate {
    pub stats: BatchStatistics,
    pub mean: ArrayD<f32>,
    pub var: ArrayD<f32>,
    /// Values per channel the statistics were computed from.
    pub count: usize,
}

/// Result of running a compiled step on one batch.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub loss: f32,
    pub loss_rec: f32,
    pub loss_dom: f32,
    /// Reconstruction logits, shaped like the input.
    pub reconstruction: ArrayD<f32>,
    /// `[N, 2]` domain logits.
    pub domain_logits: ArrayD<f32>,
    /// Gradient of the total loss per parameter name. Empty in eval mode.
    pub gradients: HashMap<String, Value>,
    /// Empty in eval mode.
    pub batch_updates: Vec<BatchUpdate>,
}

/// Forward graph `[loss, loss_rec, loss_dom, reconstruction, domain_logits,
/// (mean, var) per batch-normalized layer]`, plus the gradient graph of
/// `loss` in train mode.
pub struct CompiledStep {
    mode: Mode,
    input_shape: Shape,
    forward: Asg,
    /// Forward graph restricted to `[reconstruction, domain_logits]`.
    inference: Asg,
    gradient: Option<Asg>,
    gradient_names: Vec<String>,
    batch_statistics: Vec<(BatchStatistics, usize)>,
}

impl CompiledStep {
    pub fn compile(
        model: &ModelConfig,
        reconstruction_loss: ReconstructionLoss,
        mode: Mode,
        input_shape: &[usize],
    ) -> TrainResult<Self> {
        let &[batch, ..] = input_shape else {
            return Err(TrainError::InvalidBatch(format!("input shape {input_shape:?} has no batch axis")));
        };

        let ctx = Rc::new(RefCell::new(GraphContext::with_mode(mode)));
        let net = UNetAE::new(&ctx, model);
        let x = Tensor::new_input(&ctx, INPUT);
        let labels = Tensor::new_input(&ctx, DOMAIN_LABELS);
        let (reconstruction, domain_logits) = net.forward(&x);
        let loss_rec = reconstruction_loss.build(&reconstruction, &x);
        let loss_dom = cross_entropy_loss(&domain_logits, &labels);
        let loss = &loss_rec + &loss_dom.scale(model.lambda_rec);

        let mut ctx = ctx.borrow_mut();
        let stats = ctx.batch_statistics().to_vec();
        let mut shapes: HashMap<String, (Shape, DType)> = ctx
            .parameter_specs()
            .iter()
            .chain(ctx.buffer_specs())
            .map(|s| (s.name.clone(), (s.shape.clone(), DType::F32)))
            .collect();
        shapes.insert(INPUT.to_string(), (input_shape.to_vec(), DType::F32));
        shapes.insert(DOMAIN_LABELS.to_string(), (vec![batch, 2], DType::F32));
        let gradient_names: Vec<String> = ctx.parameter_specs().iter().map(|s| s.name.clone()).collect();

        let mut outputs = vec![loss.node_id, loss_rec.node_id, loss_dom.node_id, reconstruction.node_id, domain_logits.node_id];
        outputs.extend(stats.iter().flat_map(|s| [s.mean, s.var]));
        let graph = ctx.main_graph_mut();
        graph.set_outputs(outputs);
        ShapeInference::run(graph, &shapes)?;
        let forward = graph.clone();

        let batch_statistics = stats
            .into_iter()
            .map(|s| {
                let shape = forward.shape_of(s.input)?;
                let count = shape.first().copied().unwrap_or(1) * shape.iter().skip(2).product::<usize>();
                Ok((s, count))
            })
            .collect::<Result<Vec<_>, AsgError>>()?;

        let mut inference = forward.clone();
        inference.set_outputs(vec![reconstruction.node_id, domain_logits.node_id]);

        let gradient = match mode {
            Mode::Train => {
                let wrt = gradient_names
                    .iter()
                    .map(|name| forward.find_leaf(name).ok_or_else(|| TrainError::MissingParameterNode(name.clone())))
                    .collect::<TrainResult<Vec<NodeId>>>()?;
                Some(Gradients::new(&forward).build(loss.node_id, &wrt)?)
            }
            Mode::Eval => None,
        };

        debug!(
            ?mode,
            shape = ?input_shape,
            forward_nodes = forward.nodes.len(),
            gradient_nodes = gradient.as_ref().map_or(0, |g| g.nodes.len()),
            "compiled training step"
        );

        Ok(Self { mode, input_shape: input_shape.to_vec(), forward, inference, gradient, gradient_names, batch_statistics })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    fn check_input(&self, x: &ArrayD<f32>) -> TrainResult<()> {
        if x.shape() != self.input_shape.as_slice() {
            return Err(TrainError::InvalidBatch(format!(
                "step compiled for {:?}, got {:?}",
                self.input_shape,
                x.shape()
            )));
        }
        Ok(())
    }

    /// Forward pass, and in train mode the backward pass, on one batch.
    pub fn run(
        &self,
        backend: &CpuBackend,
        store: &ParamStore,
        x: &ArrayD<f32>,
        labels: &ArrayD<f32>,
    ) -> TrainResult<StepOutput> {
        self.check_input(x)?;
        let mut data = store.named_tensors();
        data.insert(INPUT.to_string(), Value::Tensor(x.clone()));
        data.insert(DOMAIN_LABELS.to_string(), Value::Tensor(labels.clone()));

        let memo = bind_leaves(&self.forward, &data);
        let (outputs, memo) = backend.run(&self.forward, memo)?;
        let mut outputs = backend.retrieve_data(&outputs)?.into_iter().map(Value::into_array);
        let mut next = || outputs.next().ok_or_else(|| TrainError::InvalidBatch("forward graph output missing".into()));
        let scalar = |a: ArrayD<f32>| a.iter().next().copied().unwrap_or(f32::NAN);

        let loss = scalar(next()?);
        let loss_rec = scalar(next()?);
        let loss_dom = scalar(next()?);
        let reconstruction = next()?;
        let domain_logits = next()?;
        let mut batch_updates = Vec::with_capacity(self.batch_statistics.len());
        for (stats, count) in &self.batch_statistics {
            let mean = next()?;
            let var = next()?;
            batch_updates.push(BatchUpdate { stats: stats.clone(), mean, var, count: *count });
        }

        let gradients = match &self.gradient {
            Some(graph) => {
                let (grads, _) = backend.run(graph, memo)?;
                self.gradient_names.iter().cloned().zip(backend.retrieve_data(&grads)?).collect()
            }
            None => HashMap::new(),
        };

        Ok(StepOutput { loss, loss_rec, loss_dom, reconstruction, domain_logits, gradients, batch_updates })
    }

    /// Reconstruction and domain logits without labels or losses.
    pub fn infer(&self, backend: &CpuBackend, store: &ParamStore, x: &ArrayD<f32>) -> TrainResult<(ArrayD<f32>, ArrayD<f32>)> {
        self.check_input(x)?;
        let mut data = store.named_tensors();
        data.insert(INPUT.to_string(), Value::Tensor(x.clone()));
        let memo = bind_leaves(&self.inference, &data);
        let (outputs, _) = backend.run(&self.inference, memo)?;
        let mut outputs = backend.retrieve_data(&outputs)?.into_iter().map(Value::into_array);
        match (outputs.next(), outputs.next()) {
            (Some(reconstruction), Some(domain_logits)) => Ok((reconstruction, domain_logits)),
            _ => Err(TrainError::InvalidBatch("inference graph output missing".into())),
        }
    }
}

/// Compiled steps keyed by mode and input shape.
pub struct StepCache {
    model: ModelConfig,
    reconstruction_loss: ReconstructionLoss,
    steps: HashMap<(Mode, Shape), CompiledStep>,
}

impl StepCache {
    pub fn new(model: ModelConfig, reconstruction_loss: ReconstructionLoss) -> Self {
        Self { model, reconstruction_loss, steps: HashMap::new() }
    }

    /// Returns the step for `(mode, input_shape)`, compiling it on first use.
    pub fn get(&mut self, mode: Mode, input_shape: &[usize]) -> TrainResult<&CompiledStep> {
        match self.steps.entry((mode, input_shape.to_vec())) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let step = CompiledStep::compile(&self.model, self.reconstruction_loss, mode, input_shape)?;
                Ok(entry.insert(step))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
