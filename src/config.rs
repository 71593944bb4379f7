//! Model and training configuration.
//!
//! Both structs deserialize from JSON with every field optional; missing
//! fields take the defaults below. `validate()` must pass before a model is
//! built from a configuration.

use crate::losses::ReconstructionLoss;
use crate::model::classifier::CLASSIFIER_CONV_CHANNELS;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

type Result<T> = std::result::Result<T, ConfigError>;

/// Architecture of the U-Net autoencoder and its domain classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Channels of the input images.
    pub in_channels: usize,
    /// Channels of the reconstruction.
    pub out_channels: usize,
    /// Channels of the first encoder level; level `i` has `2^i` times as many.
    pub feature_maps: usize,
    /// Number of down-sampling levels.
    pub levels: usize,
    /// Group count for group normalization; `None` selects batch normalization.
    pub group_norm: Option<usize>,
    /// Weight of the domain loss in the total loss.
    pub lambda_rec: f32,
    /// Side length of the square input images.
    pub input_size: usize,
    /// Gradient multiplier of the reversal layer.
    pub grl_scale: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            in_channels: 1,
            out_channels: 1,
            feature_maps: 64,
            levels: 4,
            group_norm: None,
            lambda_rec: 0.0,
            input_size: 128,
            grl_scale: 1.0,
        }
    }
}

impl ModelConfig {
    /// Channel width of every normalized layer in the model.
    pub fn channel_widths(&self) -> Vec<usize> {
        let mut widths: Vec<usize> = (0..=self.levels).map(|i| self.feature_maps << i).collect();
        widths.extend(CLASSIFIER_CONV_CHANNELS);
        widths
    }

    /// Spatial size of the latent code.
    pub fn latent_size(&self) -> usize {
        self.input_size >> self.levels
    }

    pub fn validate(&self) -> Result<()> {
        if self.in_channels == 0 || self.out_channels == 0 {
            return Err(ConfigError::Invalid("in_channels and out_channels must be positive".into()));
        }
        if self.feature_maps == 0 {
            return Err(ConfigError::Invalid("feature_maps must be at least 1".into()));
        }
        if self.levels == 0 || self.levels >= usize::BITS as usize - 1 {
            return Err(ConfigError::Invalid(format!("levels must be at least 1, got {}", self.levels)));
        }
        let factor = 1usize << self.levels;
        if self.input_size == 0 || self.input_size % factor != 0 {
            return Err(ConfigError::Invalid(format!(
                "input_size {} is not divisible by 2^levels = {}",
                self.input_size, factor
            )));
        }
        let min_latent = 1usize << CLASSIFIER_CONV_CHANNELS.len();
        if self.latent_size() < min_latent {
            return Err(ConfigError::Invalid(format!(
                "latent size {} is too small for {} classifier poolings (need at least {})",
                self.latent_size(),
                CLASSIFIER_CONV_CHANNELS.len(),
                min_latent
            )));
        }
        if let Some(groups) = self.group_norm {
            if groups == 0 {
                return Err(ConfigError::Invalid("group_norm must be at least 1".into()));
            }
            if let Some(width) = self.channel_widths().into_iter().find(|w| w % groups != 0) {
                return Err(ConfigError::Invalid(format!("{groups} groups do not divide {width} channels")));
            }
        }
        if !self.grl_scale.is_finite() || !self.lambda_rec.is_finite() {
            return Err(ConfigError::Invalid("grl_scale and lambda_rec must be finite".into()));
        }
        Ok(())
    }
}

/// Optimization schedule and bookkeeping of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Initial learning rate of Adam.
    pub lr: f32,
    /// Epochs between learning rate decays.
    pub step_size: usize,
    /// Learning rate decay factor.
    pub gamma: f32,
    pub epochs: usize,
    /// Evaluate on the test loaders every `test_freq` epochs.
    pub test_freq: usize,
    /// Log the loss every `print_stats` iterations.
    pub print_stats: usize,
    /// Write reconstruction images every `write_images_freq` epochs.
    pub write_images_freq: usize,
    pub batch_size: usize,
    pub shuffle: bool,
    pub seed: u64,
    pub reconstruction_loss: ReconstructionLoss,
    /// Directory for summaries and checkpoints. Nothing is written when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            step_size: 1,
            gamma: 1.0,
            epochs: 100,
            test_freq: 1,
            print_stats: 1,
            write_images_freq: 1,
            batch_size: 4,
            shuffle: true,
            seed: 0,
            reconstruction_loss: ReconstructionLoss::default(),
            log_dir: None,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.lr > 0.0 && self.lr.is_finite()) {
            return Err(ConfigError::Invalid(format!("lr must be positive, got {}", self.lr)));
        }
        if !(self.gamma > 0.0 && self.gamma.is_finite()) {
            return Err(ConfigError::Invalid(format!("gamma must be positive, got {}", self.gamma)));
        }
        for (name, value) in [
            ("step_size", self.step_size),
            ("test_freq", self.test_freq),
            ("print_stats", self.print_stats),
            ("write_images_freq", self.write_images_freq),
            ("batch_size", self.batch_size),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be at least 1")));
            }
        }
        Ok(())
    }
}

/// Complete configuration file: `{"model": {...}, "train": {...}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub train: TrainConfig,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        self.train.validate()
    }
}
