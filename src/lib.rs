//! # unet-dann: U-Net autoencoder with a domain-adversarial classifier
//!
//! A U-Net autoencoder reconstructs images from two domains while a small
//! classifier, placed behind a gradient reversal layer on the latent code,
//! tries to tell the domains apart. Minimizing the joint loss pushes the
//! encoder toward domain-invariant features.
//!
//! Models are built as an **Abstract Semantic Graph (ASG)**: `Tensor`
//! operations only record nodes, shape inference checks the graph, autograd
//! derives a second graph for the gradients and the CPU backend executes both.
//!
//! ## Usage Example
//!
//! ```no_run
//! use unet_dann::config::Config;
//! use unet_dann::data::DomainPair;
//! use unet_dann::train::{loader, Trainer};
//!
//! let mut config = Config::default();
//! config.model.feature_maps = 8;
//! config.model.levels = 2;
//! config.model.input_size = 32;
//! config.train.epochs = 2;
//!
//! let pair = DomainPair::new(32, 0);
//! let (src_train, tar_train) = pair.generate(16).unwrap();
//! let (src_test, tar_test) = DomainPair::new(32, 1).generate(8).unwrap();
//!
//! let mut trainer = Trainer::new(config.clone()).unwrap();
//! let summary = trainer
//!     .train_net(
//!         &loader(src_train, &config.train, true),
//!         &loader(src_test, &config.train, false),
//!         &loader(tar_train, &config.train, true),
//!         &loader(tar_test, &config.train, false),
//!     )
//!     .unwrap();
//! println!("best test loss: {:?}", summary.best_test_loss);
//! ```

pub mod analysis;
pub mod asg;
pub mod autograd;
pub mod config;
pub mod data;
pub mod losses;
pub mod metrics;
pub mod model;
pub mod nn;
pub mod optimizers;
pub mod runtime;
pub mod serialization;
pub mod state;
pub mod tensor;
pub mod train;

pub use config::{Config, ModelConfig, TrainConfig};
pub use model::UNetAE;
pub use train::{Trainer, TrainError};
