//! Оптимизаторы для обновления весов модели.
//!
//! Оптимизаторы работают с конкретными значениями (`Value`): получают текущие
//! веса и вычисленные градиенты и применяют правило обновления на месте.
//! Внутреннее состояние экспортируется как [`OptimizerState`] для чекпоинтов.

pub mod adam;
pub mod scheduler;

pub use adam::Adam;
pub use scheduler::StepLr;

use crate::asg::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum OptimizerError {
    #[error("State of a '{actual}' optimizer cannot be loaded into '{expected}'")]
    KindMismatch { expected: String, actual: String },

    #[error("Missing hyperparameter '{0}' in optimizer state")]
    MissingHyperparameter(String),

    #[error("State tensor '{name}' has shape {actual:?}, parameter has {expected:?}")]
    ShapeMismatch { name: String, expected: Vec<usize>, actual: Vec<usize> },
}

/// Сериализуемый снимок оптимизатора.
///
/// Скаляры пишутся в `optimizer.json`; тензоры по параметрам (моменты)
/// хранятся отдельно в `tensors` и сохраняются как SafeTensors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptimizerState {
    pub optimizer_type: String,
    pub hyperparameters: BTreeMap<String, f64>,
    pub step: u64,
    #[serde(skip)]
    pub tensors: HashMap<String, Value>,
}

impl OptimizerState {
    pub fn new(optimizer_type: &str) -> Self {
        Self { optimizer_type: optimizer_type.to_string(), ..Default::default() }
    }

    fn expect_type(&self, expected: &str) -> Result<(), OptimizerError> {
        if self.optimizer_type == expected {
            Ok(())
        } else {
            Err(OptimizerError::KindMismatch { expected: expected.to_string(), actual: self.optimizer_type.clone() })
        }
    }

    fn hyperparameter(&self, name: &str) -> Result<f64, OptimizerError> {
        self.hyperparameters.get(name).copied().ok_or_else(|| OptimizerError::MissingHyperparameter(name.to_string()))
    }
}

/// Общий интерфейс для всех оптимизаторов.
pub trait Optimizer {
    /// Выполняет один шаг оптимизации.
    ///
    /// * `parameters` - текущие веса по имени (например, `"encoder.center.conv1.weight"`).
    /// * `gradients` - градиенты loss по этим весам. Параметры без
    ///   градиента не изменяются.
    fn step(&mut self, parameters: &mut HashMap<String, Value>, gradients: &HashMap<String, Value>);

    fn learning_rate(&self) -> f32;

    fn set_learning_rate(&mut self, lr: f32);

    fn state(&self) -> OptimizerState;

    fn load_state(&mut self, state: OptimizerState) -> Result<(), OptimizerError>;
}

/// Стохастический градиентный спуск (SGD).
pub struct Sgd {
    lr: f32,
}

impl Sgd {
    pub fn new(lr: f32) -> Self {
        Self { lr }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, parameters: &mut HashMap<String, Value>, gradients: &HashMap<String, Value>) {
        for (param_name, grad_value) in gradients {
            if let (Some(Value::Tensor(param_value)), Value::Tensor(grad_tensor)) =
                (parameters.get_mut(param_name), grad_value)
            {
                // param = param - lr * grad
                ndarray::azip!((p in param_value, &g in grad_tensor) *p -= self.lr * g);
            }
        }
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn state(&self) -> OptimizerState {
        let mut state = OptimizerState::new("sgd");
        state.hyperparameters.insert("lr".to_string(), self.lr as f64);
        state
    }

    fn load_state(&mut self, state: OptimizerState) -> Result<(), OptimizerError> {
        state.expect_type("sgd")?;
        self.lr = state.hyperparameter("lr")? as f32;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn sgd_descends_along_gradient() {
        let mut params = HashMap::from([("w".to_string(), Value::Tensor(array![1.0_f32, 2.0].into_dyn()))]);
        let grads = HashMap::from([("w".to_string(), Value::Tensor(array![0.5_f32, -1.0].into_dyn()))]);
        let mut sgd = Sgd::new(0.1);
        sgd.step(&mut params, &grads);
        let w = params["w"].as_array().unwrap();
        assert!((w[0] - 0.95).abs() < 1e-6);
        assert!((w[1] - 2.1).abs() < 1e-6);
    }

    #[test]
    fn state_type_is_checked() {
        let mut sgd = Sgd::new(0.1);
        let err = sgd.load_state(OptimizerState::new("adam")).unwrap_err();
        assert!(matches!(err, OptimizerError::KindMismatch { .. }));

        let mut other = Sgd::new(1.0);
        other.load_state(sgd.state()).unwrap();
        assert!((other.learning_rate() - 0.1).abs() < 1e-7);
    }
}
