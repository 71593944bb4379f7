//! Observability of training runs.
//!
//! - [`RunningMean`], [`MetricLogger`]: per-iteration and per-epoch loss tracking
//! - [`SummaryWriter`]: scalar curves and image summaries in a log directory
//! - [`make_grid`]: tiles a batch of images for the writer
//!
//! ```rust,ignore
//! use unet_dann::metrics::{make_grid, GridOptions, SummaryWriter};
//!
//! let mut writer = SummaryWriter::new("runs/exp1")?;
//! writer.add_scalar("train/loss", 0.42, epoch)?;
//! if let Some(grid) = make_grid(&batch, GridOptions::normalized()) {
//!     writer.add_image("train/x-rec-input", &grid, epoch)?;
//! }
//! ```

pub mod grid;
pub mod running;
pub mod writer;

pub use grid::{make_grid, GridOptions};
pub use running::{MetricLogger, RunningMean};
pub use writer::{read_scalars, sigmoid_images, ScalarEvent, SummaryWriter, WriterError};
