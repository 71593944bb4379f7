//! # Neural network layers
//!
//! In the graph-based architecture each layer is a constructor that adds a
//! pattern of nodes (operations and parameters) to the ASG. Parameters are
//! registered with their shape and initializer so a parameter store can be
//! created from the graph context alone.
//!
//! ## Available layers
//!
//! - [`Conv2d`], [`ConvTranspose2d`]: convolutions
//! - [`Linear`]: fully connected layer
//! - [`MaxPool2d`]: max pooling
//! - [`BatchNorm2d`], [`GroupNorm`]: normalization, selected through [`NormKind`]
//! - [`ReLU`]: activation
//! - [`GradientReversal`]: identity forward, negated gradient backward
//! - [`UNetConvBlock2D`], [`UNetUpSamplingBlock2D`]: U-Net blocks
//!
//! ```ignore
//! use unet_dann::nn::{Conv2d, Module, ReLU};
//! use unet_dann::tensor::{GraphContext, Tensor};
//!
//! let ctx = Rc::new(RefCell::new(GraphContext::new()));
//! let conv = Conv2d::new(&ctx, "conv1", 1, 16, (3, 3)).with_padding((1, 1));
//! let x = Tensor::new_input(&ctx, "x");
//! let h = ReLU.forward(&conv.forward(&x));
//! ```

pub mod activations;
pub mod batchnorm;
pub mod blocks;
pub mod conv;
pub mod grl;
pub mod init;
pub mod linear;
pub mod module;
pub mod norm;
pub mod pooling;

pub use activations::ReLU;
pub use batchnorm::BatchNorm2d;
pub use blocks::{UNetConvBlock2D, UNetUpSamplingBlock2D};
pub use conv::{Conv2d, Conv2dConfig, ConvTranspose2d};
pub use grl::GradientReversal;
pub use init::Init;
pub use linear::Linear;
pub use module::Module;
pub use norm::{GroupNorm, Norm2d, NormKind};
pub use pooling::MaxPool2d;
