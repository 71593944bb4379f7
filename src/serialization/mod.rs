//! Serialization of weights, datasets and training checkpoints.
//!
//! - **SafeTensors**: named `f32` tensors (weights, optimizer moments, images)
//! - **JSON**: configuration and progress metadata
//! - **Checkpoint**: a directory combining both
//!
//! ```rust,ignore
//! use unet_dann::serialization::{save_safetensors, load_safetensors};
//!
//! save_safetensors("model.safetensors", &weights)?;
//! let loaded = load_safetensors("model.safetensors")?;
//! ```

pub mod checkpoint;
pub mod safetensors_io;

pub use checkpoint::{load_checkpoint, save_checkpoint, Checkpoint, CheckpointError, CheckpointMetadata};
pub use safetensors_io::{list_tensors, load_safetensors, load_tensor, save_safetensors, SafeTensorsError};
