//! Adam with bias-corrected moment estimates.

use super::{Optimizer, OptimizerError, OptimizerState};
use crate::asg::Value;
use ndarray::ArrayD;
use std::collections::HashMap;

pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    /// Number of steps taken so far.
    t: u64,
    m: HashMap<String, ArrayD<f32>>,
    v: HashMap<String, ArrayD<f32>>,
}

impl Adam {
    /// Betas `(0.9, 0.999)`, `eps = 1e-8`.
    pub fn new(lr: f32) -> Self {
        Self::with_params(lr, (0.9, 0.999), 1e-8)
    }

    pub fn with_params(lr: f32, betas: (f32, f32), eps: f32) -> Self {
        Self { lr, beta1: betas.0, beta2: betas.1, eps, t: 0, m: HashMap::new(), v: HashMap::new() }
    }

    pub fn steps(&self) -> u64 {
        self.t
    }
}

impl Optimizer for Adam {
    fn step(&mut self, parameters: &mut HashMap<String, Value>, gradients: &HashMap<String, Value>) {
        self.t += 1;
        let bias1 = 1.0 - self.beta1.powi(self.t.min(i32::MAX as u64) as i32);
        let bias2 = 1.0 - self.beta2.powi(self.t.min(i32::MAX as u64) as i32);
        let (beta1, beta2, lr, eps) = (self.beta1, self.beta2, self.lr, self.eps);

        for (name, grad_value) in gradients {
            let (Some(Value::Tensor(param)), Value::Tensor(grad)) = (parameters.get_mut(name), grad_value) else {
                continue;
            };
            let m = self.m.entry(name.clone()).or_insert_with(|| ArrayD::zeros(param.raw_dim()));
            let v = self.v.entry(name.clone()).or_insert_with(|| ArrayD::zeros(param.raw_dim()));
            ndarray::azip!((p in param, m in m, v in v, &g in grad) {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                let m_hat = *m / bias1;
                let v_hat = *v / bias2;
                *p -= lr * m_hat / (v_hat.sqrt() + eps);
            });
        }
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn state(&self) -> OptimizerState {
        let mut state = OptimizerState::new("adam");
        for (key, value) in [("lr", self.lr), ("beta1", self.beta1), ("beta2", self.beta2), ("eps", self.eps)] {
            state.hyperparameters.insert(key.to_string(), value as f64);
        }
        state.step = self.t;
        for (name, m) in &self.m {
            state.tensors.insert(format!("m.{name}"), Value::Tensor(m.clone()));
        }
        for (name, v) in &self.v {
            state.tensors.insert(format!("v.{name}"), Value::Tensor(v.clone()));
        }
        state
    }

    fn load_state(&mut self, state: OptimizerState) -> Result<(), OptimizerError> {
        state.expect_type("adam")?;
        self.lr = state.hyperparameter("lr")? as f32;
        self.beta1 = state.hyperparameter("beta1")? as f32;
        self.beta2 = state.hyperparameter("beta2")? as f32;
        self.eps = state.hyperparameter("eps")? as f32;
        self.t = state.step;
        self.m.clear();
        self.v.clear();
        for (key, value) in state.tensors {
            let array = value.into_array();
            if let Some(name) = key.strip_prefix("m.") {
                self.m.insert(name.to_string(), array);
            } else if let Some(name) = key.strip_prefix("v.") {
                self.v.insert(name.to_string(), array);
            }
        }
        for (name, m) in &self.m {
            if let Some(v) = self.v.get(name) {
                if v.shape() != m.shape() {
                    return Err(OptimizerError::ShapeMismatch {
                        name: name.clone(),
                        expected: m.shape().to_vec(),
                        actual: v.shape().to_vec(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn single(w: f32) -> HashMap<String, Value> {
        HashMap::from([("w".to_string(), Value::Tensor(array![w].into_dyn()))])
    }

    #[test]
    fn first_step_moves_by_learning_rate() {
        // With bias correction the first update is lr * g / (|g| + eps).
        let mut params = single(1.0);
        let mut adam = Adam::new(0.01);
        adam.step(&mut params, &single(4.0));
        let w = params["w"].as_array().unwrap()[0];
        assert!((w - 0.99).abs() < 1e-5, "{w}");
        assert_eq!(adam.steps(), 1);
    }

    #[test]
    fn minimizes_quadratic() {
        let mut params = single(3.0);
        let mut adam = Adam::new(0.1);
        for _ in 0..300 {
            let w = params["w"].as_array().unwrap()[0];
            adam.step(&mut params, &single(2.0 * w));
        }
        assert!(params["w"].as_array().unwrap()[0].abs() < 0.05);
    }

    #[test]
    fn state_round_trips_moments() {
        let mut params = single(1.0);
        let mut adam = Adam::new(0.01);
        adam.step(&mut params, &single(1.0));
        let state = adam.state();
        assert_eq!(state.step, 1);
        assert!(state.tensors.contains_key("m.w") && state.tensors.contains_key("v.w"));

        let mut restored = Adam::new(1.0);
        restored.load_state(state).unwrap();
        assert_eq!(restored.steps(), 1);
        assert!((restored.learning_rate() - 0.01).abs() < 1e-7);

        let mut a = params.clone();
        let mut b = params;
        adam.step(&mut a, &single(0.5));
        restored.step(&mut b, &single(0.5));
        assert_eq!(a["w"], b["w"]);
    }
}
