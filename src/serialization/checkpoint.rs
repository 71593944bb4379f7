//! Директории чекпоинтов.
//!
//! Чекпоинт содержит:
//! - конфигурацию модели и обучения, метаданные прогресса
//! - веса и running статистики (SafeTensors)
//! - состояние оптимизатора (гиперпараметры в JSON, моменты в SafeTensors)

use super::safetensors_io::{load_safetensors, save_safetensors, SafeTensorsError};
use crate::asg::Value;
use crate::config::{ModelConfig, TrainConfig};
use crate::optimizers::OptimizerState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_FILE: &str = "config.json";
pub const MODEL_FILE: &str = "model.safetensors";
pub const OPTIMIZER_FILE: &str = "optimizer.json";
pub const OPTIMIZER_TENSORS_FILE: &str = "optimizer.safetensors";

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SafeTensors error: {0}")]
    SafeTensorsError(#[from] SafeTensorsError),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Checkpoint directory does not exist: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),
}

type Result<T> = std::result::Result<T, CheckpointError>;

/// Содержимое `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub version: String,
    /// Количество завершенных эпох.
    pub epoch: usize,
    /// Количество шагов оптимизатора.
    pub global_step: usize,
    pub learning_rate: f32,
    /// Средний train loss последней эпохи.
    pub last_loss: Option<f32>,
    /// Лучший (минимальный) test loss.
    pub best_loss: Option<f32>,
    pub model: ModelConfig,
    pub train: TrainConfig,
}

impl CheckpointMetadata {
    pub fn new(model: ModelConfig, train: TrainConfig) -> Self {
        Self {
            version: "1.0".to_string(),
            epoch: 0,
            global_step: 0,
            learning_rate: train.lr,
            last_loss: None,
            best_loss: None,
            model,
            train,
        }
    }

    pub fn with_epoch(mut self, epoch: usize) -> Self {
        self.epoch = epoch;
        self
    }

    pub fn with_global_step(mut self, step: usize) -> Self {
        self.global_step = step;
        self
    }

    pub fn with_learning_rate(mut self, lr: f32) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn with_last_loss(mut self, loss: Option<f32>) -> Self {
        self.last_loss = loss;
        self
    }

    pub fn with_best_loss(mut self, loss: Option<f32>) -> Self {
        self.best_loss = loss;
        self
    }
}

#[derive(Debug)]
pub struct Checkpoint {
    pub metadata: CheckpointMetadata,
    /// Параметры и буферы по полным именам.
    pub model_weights: HashMap<String, Value>,
    pub optimizer_state: Option<OptimizerState>,
}

impl Checkpoint {
    pub fn new(weights: HashMap<String, Value>, metadata: CheckpointMetadata) -> Self {
        Self { metadata, model_weights: weights, optimizer_state: None }
    }

    pub fn with_optimizer_state(mut self, state: OptimizerState) -> Self {
        self.optimizer_state = Some(state);
        self
    }
}

/// Сохраняет чекпоинт в директорию, перезаписывая прежние файлы.
///
/// ```text
/// checkpoint_dir/
/// ├── config.json            # конфигурация и прогресс
/// ├── model.safetensors      # параметры и running статистики
/// ├── optimizer.json         # гиперпараметры и число шагов (опционально)
/// └── optimizer.safetensors  # моменты оптимизатора (опционально)
/// ```
pub fn save_checkpoint<P: AsRef<Path>>(path: P, checkpoint: &Checkpoint) -> Result<()> {
    let dir = path.as_ref();
    fs::create_dir_all(dir)?;

    fs::write(dir.join(CONFIG_FILE), serde_json::to_string_pretty(&checkpoint.metadata)?)?;
    save_safetensors(dir.join(MODEL_FILE), &checkpoint.model_weights)?;

    if let Some(opt_state) = &checkpoint.optimizer_state {
        fs::write(dir.join(OPTIMIZER_FILE), serde_json::to_string_pretty(opt_state)?)?;
        let tensors_path = dir.join(OPTIMIZER_TENSORS_FILE);
        if opt_state.tensors.is_empty() {
            if tensors_path.exists() {
                fs::remove_file(tensors_path)?;
            }
        } else {
            save_safetensors(tensors_path, &opt_state.tensors)?;
        }
    }
    Ok(())
}

pub fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<Checkpoint> {
    let dir = path.as_ref();
    if !dir.is_dir() {
        return Err(CheckpointError::DirectoryNotFound(dir.to_path_buf()));
    }

    let config_path = dir.join(CONFIG_FILE);
    if !config_path.exists() {
        return Err(CheckpointError::FileNotFound(config_path));
    }
    let metadata: CheckpointMetadata = serde_json::from_str(&fs::read_to_string(&config_path)?)?;

    let weights_path = dir.join(MODEL_FILE);
    if !weights_path.exists() {
        return Err(CheckpointError::FileNotFound(weights_path));
    }
    let model_weights = load_safetensors(&weights_path)?;

    let opt_path = dir.join(OPTIMIZER_FILE);
    let optimizer_state = if opt_path.exists() {
        let mut state: OptimizerState = serde_json::from_str(&fs::read_to_string(&opt_path)?)?;
        let tensors_path = dir.join(OPTIMIZER_TENSORS_FILE);
        if tensors_path.exists() {
            state.tensors = load_safetensors(tensors_path)?;
        }
        Some(state)
    } else {
        None
    };

    Ok(Checkpoint { metadata, model_weights, optimizer_state })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("unet_dann_ckpt_{}_{}", name, std::process::id()))
    }

    #[test]
    fn test_metadata_builder() {
        let meta = CheckpointMetadata::new(ModelConfig::default(), TrainConfig::default())
            .with_epoch(10)
            .with_global_step(1000)
            .with_learning_rate(0.0005)
            .with_last_loss(Some(0.5));
        assert_eq!(meta.epoch, 10);
        assert_eq!(meta.global_step, 1000);
        assert!((meta.learning_rate - 0.0005).abs() < 1e-9);
        assert_eq!(meta.last_loss, Some(0.5));
        assert_eq!(meta.best_loss, None);
    }

    #[test]
    fn test_save_load_checkpoint() {
        let mut weights = HashMap::new();
        weights.insert(
            "decoder.output.weight".to_string(),
            Value::Tensor(ArrayD::from_shape_vec(ndarray::IxDyn(&[2, 2]), vec![1.0, 2.0, 3.0, 4.0]).unwrap()),
        );
        let mut opt = OptimizerState::new("adam");
        opt.step = 7;
        opt.hyperparameters.insert("lr".to_string(), 0.001);
        opt.tensors.insert("m.decoder.output.weight".to_string(), Value::Tensor(ArrayD::zeros(ndarray::IxDyn(&[2, 2]))));

        let meta = CheckpointMetadata::new(ModelConfig::default(), TrainConfig::default())
            .with_epoch(5)
            .with_best_loss(Some(0.25));
        let checkpoint = Checkpoint::new(weights.clone(), meta.clone()).with_optimizer_state(opt);

        let dir = temp_dir("roundtrip");
        save_checkpoint(&dir, &checkpoint).expect("Failed to save checkpoint");
        let loaded = load_checkpoint(&dir).expect("Failed to load checkpoint");

        assert_eq!(loaded.metadata, meta);
        assert_eq!(loaded.model_weights, weights);
        let opt = loaded.optimizer_state.expect("optimizer state");
        assert_eq!(opt.optimizer_type, "adam");
        assert_eq!(opt.step, 7);
        assert!(opt.tensors.contains_key("m.decoder.output.weight"));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_directory_is_reported() {
        let err = load_checkpoint(temp_dir("absent")).unwrap_err();
        assert!(matches!(err, CheckpointError::DirectoryNotFound(_)));
    }
}
