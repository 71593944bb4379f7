//! # Models
//!
//! The U-Net encoder and decoder, the domain classifier and [`UNetAE`], which
//! wires them into a domain-adversarial autoencoder.

pub mod classifier;
pub mod decoder;
pub mod encoder;
pub mod unet_ae;

pub use classifier::DomainClassifier;
pub use decoder::UNetDecoder;
pub use encoder::{EncoderOutput, UNetEncoder};
pub use unet_ae::UNetAE;
