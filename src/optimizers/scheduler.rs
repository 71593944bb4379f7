//! Learning rate schedules.

use super::Optimizer;

/// Decays the learning rate by `gamma` every `step_size` epochs:
/// `lr(epoch) = base_lr * gamma^(epoch / step_size)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepLr {
    pub base_lr: f32,
    pub step_size: usize,
    pub gamma: f32,
}

impl StepLr {
    pub fn new(base_lr: f32, step_size: usize, gamma: f32) -> Self {
        Self { base_lr, step_size: step_size.max(1), gamma }
    }

    pub fn lr_at(&self, epoch: usize) -> f32 {
        let decays = (epoch / self.step_size).min(i32::MAX as usize) as i32;
        self.base_lr * self.gamma.powi(decays)
    }

    /// Sets the learning rate scheduled for `epoch` and returns it.
    pub fn apply(&self, optimizer: &mut dyn Optimizer, epoch: usize) -> f32 {
        let lr = self.lr_at(epoch);
        optimizer.set_learning_rate(lr);
        lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizers::Sgd;

    #[test]
    fn decays_every_step_size_epochs() {
        let sched = StepLr::new(1.0, 2, 0.5);
        assert_eq!(sched.lr_at(0), 1.0);
        assert_eq!(sched.lr_at(1), 1.0);
        assert_eq!(sched.lr_at(2), 0.5);
        assert_eq!(sched.lr_at(5), 0.25);
    }

    #[test]
    fn applies_to_optimizer() {
        let mut sgd = Sgd::new(1.0);
        let lr = StepLr::new(0.1, 1, 0.1).apply(&mut sgd, 2);
        assert!((lr - 0.001).abs() < 1e-7);
        assert_eq!(sgd.learning_rate(), lr);
    }
}
