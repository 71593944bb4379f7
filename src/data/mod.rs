//! # Data loading
//!
//! In-memory image datasets and a batched loader, plus a synthetic source
//! and target domain generator.
//!
//! ```ignore
//! use unet_dann::data::{DataLoader, DomainPair};
//!
//! let (source, target) = DomainPair::new(64, 0).generate(128)?;
//! let loader = DataLoader::new(source, 8).shuffle(true).seed(0);
//! for batch in loader.iter() {
//!     // batch.images: [8, 1, 64, 64]
//! }
//! ```

pub mod dataloader;
pub mod dataset;
pub mod sampler;
pub mod synthetic;
pub mod transforms;

pub use dataloader::{Batch, DataLoader};
pub use dataset::{Dataset, ImageDataset};
pub use sampler::{BatchSampler, RandomSampler, Sampler, SequentialSampler};
pub use synthetic::DomainPair;
pub use transforms::{Affine, Clamp, Compose, RandomNoise, Transform};

use crate::serialization::SafeTensorsError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("SafeTensors error: {0}")]
    SafeTensorsError(#[from] SafeTensorsError),

    #[error("Tensor '{0}' not found")]
    MissingKey(String),

    #[error("Expected [N, C, H, W] images, got shape {0:?}")]
    InvalidShape(Vec<usize>),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}
