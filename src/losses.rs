//! Loss functions in the graph paradigm.
//!
//! Losses are plain functions that take symbolic `Tensor` handles and append
//! the nodes computing a scalar error to the graph.
//!
//! # Available loss functions
//!
//! - **MSE**: [`mse_loss`]
//! - **Binary cross-entropy on logits**: [`bce_with_logits_loss`]
//! - **Cross-entropy on logits**: [`cross_entropy_loss`]

use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

// ============================================================================
// MSE Loss (Mean Squared Error)
// ============================================================================

/// Formula: `MSE = mean((y_pred - y_true)^2)` over all elements.
pub fn mse_loss(y_pred: &Tensor, y_true: &Tensor) -> Tensor {
    let error = y_pred - y_true;
    let squared_error = &error * &error;
    squared_error.mean()
}

// ============================================================================
// Binary Cross-Entropy
// ============================================================================

/// Binary cross-entropy on raw logits, averaged over all elements.
///
/// Formula: `BCE = mean(softplus(x) - x * y)`, which equals
/// `-mean(y * log(sigmoid(x)) + (1 - y) * log(1 - sigmoid(x)))` without
/// ever taking the log of a saturated sigmoid.
pub fn bce_with_logits_loss(logits: &Tensor, y_true: &Tensor) -> Tensor {
    let positive = logits.softplus();
    let cross = logits * y_true;
    (&positive - &cross).mean()
}

// ============================================================================
// Cross-Entropy Loss
// ============================================================================

/// Cross-entropy of `[N, K]` logits against one-hot targets, averaged over the batch.
///
/// Formula: `CE = -mean_n(sum_k(y_true[n, k] * log_softmax(logits)[n, k]))`
pub fn cross_entropy_loss(logits: &Tensor, y_true: &Tensor) -> Tensor {
    let log_probs = logits.log_softmax();
    let per_sample = (y_true * &log_probs).sum_axes(&[1], false);
    per_sample.mean().neg()
}

/// Reconstruction term of the autoencoder loss.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconstructionLoss {
    Mse,
    /// Targets are intensities in `[0, 1]`; outputs are read through a sigmoid.
    #[default]
    BceWithLogits,
}

impl ReconstructionLoss {
    pub fn build(self, logits: &Tensor, target: &Tensor) -> Tensor {
        match self {
            ReconstructionLoss::Mse => mse_loss(logits, target),
            ReconstructionLoss::BceWithLogits => bce_with_logits_loss(logits, target),
        }
    }
}
