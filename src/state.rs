//! Concrete values of the parameters and buffers a graph refers to by name.

use crate::asg::{DType, Shape, Value};
use crate::tensor::{BatchStatistics, GraphContext, ParameterSpec};
use ndarray::ArrayD;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum StateError {
    #[error("Tensor '{0}' is missing from the loaded state")]
    Missing(String),

    #[error("Tensor '{name}' has shape {actual:?}, the model expects {expected:?}")]
    ShapeMismatch { name: String, expected: Shape, actual: Shape },

    #[error("Loaded state contains unknown tensor '{0}'")]
    Unexpected(String),
}

/// Weights and running statistics of a model, keyed by dotted names.
///
/// Built once from the specs recorded while constructing the model graph; every
/// graph built from the same model configuration binds to the same store.
#[derive(Debug, Clone, Default)]
pub struct ParamStore {
    parameters: HashMap<String, Value>,
    buffers: HashMap<String, Value>,
    parameter_specs: Vec<ParameterSpec>,
    buffer_specs: Vec<ParameterSpec>,
}

impl ParamStore {
    /// Initializes every parameter and buffer of `ctx`. Samples are drawn in
    /// registration order, so a seed reproduces the same weights.
    pub fn from_context(ctx: &GraphContext, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut init = |specs: &[ParameterSpec]| -> HashMap<String, Value> {
            specs.iter().map(|s| (s.name.clone(), Value::Tensor(s.init.sample(&s.shape, &mut rng)))).collect()
        };
        Self {
            parameters: init(ctx.parameter_specs()),
            buffers: init(ctx.buffer_specs()),
            parameter_specs: ctx.parameter_specs().to_vec(),
            buffer_specs: ctx.buffer_specs().to_vec(),
        }
    }

    pub fn parameters(&self) -> &HashMap<String, Value> {
        &self.parameters
    }

    pub fn parameters_mut(&mut self) -> &mut HashMap<String, Value> {
        &mut self.parameters
    }

    pub fn buffers(&self) -> &HashMap<String, Value> {
        &self.buffers
    }

    /// Trainable parameter names in registration order.
    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.parameter_specs.iter().map(|s| s.name.as_str())
    }

    /// Total number of trainable scalars.
    pub fn num_parameters(&self) -> usize {
        self.parameter_specs.iter().map(|s| s.shape.iter().product::<usize>()).sum()
    }

    /// Shapes for shape inference, keyed by name.
    pub fn shapes(&self) -> HashMap<String, (Shape, DType)> {
        self.parameter_specs
            .iter()
            .chain(&self.buffer_specs)
            .map(|s| (s.name.clone(), (s.shape.clone(), DType::F32)))
            .collect()
    }

    /// Parameters and buffers in one map, as stored in checkpoints and bound to graphs.
    pub fn named_tensors(&self) -> HashMap<String, Value> {
        self.parameters.iter().chain(&self.buffers).map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Replaces every parameter and buffer with the value of the same name.
    ///
    /// All names must be present with the declared shapes; nothing is changed
    /// when validation fails.
    pub fn load(&mut self, mut tensors: HashMap<String, Value>) -> Result<(), StateError> {
        let mut parameters = HashMap::with_capacity(self.parameter_specs.len());
        let mut buffers = HashMap::with_capacity(self.buffer_specs.len());
        for (specs, target) in [(&self.parameter_specs, &mut parameters), (&self.buffer_specs, &mut buffers)] {
            for spec in specs {
                let value = tensors.remove(&spec.name).ok_or_else(|| StateError::Missing(spec.name.clone()))?;
                let value = Value::Tensor(value.into_array());
                if value.shape() != spec.shape {
                    return Err(StateError::ShapeMismatch {
                        name: spec.name.clone(),
                        expected: spec.shape.clone(),
                        actual: value.shape(),
                    });
                }
                target.insert(spec.name.clone(), value);
            }
        }
        if let Some(name) = tensors.into_keys().next() {
            return Err(StateError::Unexpected(name));
        }
        self.parameters = parameters;
        self.buffers = buffers;
        Ok(())
    }

    /// Folds batch statistics into the running statistics:
    /// `running = (1 - momentum) * running + momentum * batch`, using the
    /// unbiased variance `var * n / (n - 1)` for `n` values per channel.
    pub fn update_running_statistics(
        &mut self,
        stats: &BatchStatistics,
        mean: &ArrayD<f32>,
        var: &ArrayD<f32>,
        count: usize,
    ) {
        let m = stats.momentum;
        let correction = if count > 1 { count as f32 / (count - 1) as f32 } else { 1.0 };
        if let Some(Value::Tensor(running)) = self.buffers.get_mut(&stats.running_mean) {
            ndarray::azip!((r in running, &b in mean) *r = (1.0 - m) * *r + m * b);
        }
        if let Some(Value::Tensor(running)) = self.buffers.get_mut(&stats.running_var) {
            ndarray::azip!((r in running, &b in var) *r = (1.0 - m) * *r + m * b * correction);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{BatchNorm2d, Conv2d};
    use ndarray::IxDyn;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn context() -> GraphContext {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        Conv2d::new(&ctx, "conv", 1, 2, (3, 3));
        BatchNorm2d::new(&ctx, "bn", 2);
        let ctx = ctx.borrow().clone();
        ctx
    }

    #[test]
    fn initializes_from_specs_reproducibly() {
        let ctx = context();
        let a = ParamStore::from_context(&ctx, 11);
        let b = ParamStore::from_context(&ctx, 11);
        assert_eq!(a.parameters(), b.parameters());
        assert_eq!(a.num_parameters(), 2 * 9 + 2 + 2 + 2);
        assert_eq!(a.buffers()["bn.running_var"], Value::Tensor(ArrayD::ones(IxDyn(&[1, 2, 1, 1]))));
        assert_eq!(a.parameter_names().next(), Some("conv.weight"));
        assert_eq!(a.named_tensors().len(), 6);
    }

    #[test]
    fn load_validates_names_and_shapes() {
        let ctx = context();
        let source = ParamStore::from_context(&ctx, 1);
        let mut target = ParamStore::from_context(&ctx, 2);
        target.load(source.named_tensors()).unwrap();
        assert_eq!(target.parameters(), source.parameters());

        let mut wrong = source.named_tensors();
        wrong.insert("conv.bias".to_string(), Value::Tensor(ArrayD::zeros(IxDyn(&[3]))));
        assert!(matches!(target.load(wrong), Err(StateError::ShapeMismatch { .. })));

        let mut missing = source.named_tensors();
        missing.remove("bn.running_mean");
        assert_eq!(target.load(missing), Err(StateError::Missing("bn.running_mean".to_string())));

        let mut extra = source.named_tensors();
        extra.insert("other".to_string(), Value::ScalarF32(0.0));
        assert_eq!(target.load(extra), Err(StateError::Unexpected("other".to_string())));
    }

    #[test]
    fn running_statistics_use_momentum_and_unbiased_variance() {
        let ctx = context();
        let mut store = ParamStore::from_context(&ctx, 0);
        let stats = BatchStatistics {
            running_mean: "bn.running_mean".to_string(),
            running_var: "bn.running_var".to_string(),
            mean: 0,
            var: 0,
            input: 0,
            momentum: 0.1,
        };
        let mean = ArrayD::from_elem(IxDyn(&[1, 2, 1, 1]), 2.0);
        let var = ArrayD::from_elem(IxDyn(&[1, 2, 1, 1]), 3.0);
        store.update_running_statistics(&stats, &mean, &var, 4);

        let rm = store.buffers()["bn.running_mean"].as_array().unwrap();
        let rv = store.buffers()["bn.running_var"].as_array().unwrap();
        assert!((rm[[0, 0, 0, 0]] - 0.2).abs() < 1e-6);
        // 0.9 * 1 + 0.1 * 3 * 4 / 3
        assert!((rv[[0, 1, 0, 0]] - 1.3).abs() < 1e-6);
    }
}
