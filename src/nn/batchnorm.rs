//! Batch Normalization для карт признаков `[N, C, H, W]`.
//!
//! В режиме обучения слой нормализует по статистикам текущего батча и
//! записывает их в контекст графа; после шага тренер сворачивает их в
//! running статистики. В режиме eval статистики читаются из узлов `Buffer`.

use crate::nn::init::Init;
use crate::nn::Module;
use crate::tensor::{BatchStatistics, GraphContext, Mode, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Малая константа для численной стабильности.
pub const EPS: f32 = 1e-5;

/// Momentum обновления running статистик.
pub const DEFAULT_MOMENTUM: f32 = 0.1;

/// `y = gamma * (x - mean) / sqrt(var + eps) + beta` по каналам.
pub struct BatchNorm2d {
    /// Обучаемый масштаб `[1, C, 1, 1]`.
    pub gamma: Tensor,
    /// Обучаемый сдвиг `[1, C, 1, 1]`.
    pub beta: Tensor,
    pub running_mean: Tensor,
    pub running_var: Tensor,
    pub momentum: f32,
    pub name: String,
}

impl BatchNorm2d {
    pub fn new(ctx: &Rc<RefCell<GraphContext>>, name: &str, channels: usize) -> Self {
        let shape = vec![1, channels, 1, 1];
        Self {
            gamma: Tensor::new_parameter(ctx, &format!("{}.weight", name), shape.clone(), Init::Ones),
            beta: Tensor::new_parameter(ctx, &format!("{}.bias", name), shape.clone(), Init::Zeros),
            running_mean: Tensor::new_buffer(ctx, &format!("{}.running_mean", name), shape.clone(), Init::Zeros),
            running_var: Tensor::new_buffer(ctx, &format!("{}.running_var", name), shape, Init::Ones),
            momentum: DEFAULT_MOMENTUM,
            name: name.to_string(),
        }
    }

    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }
}

impl Module for BatchNorm2d {
    fn forward(&self, x: &Tensor) -> Tensor {
        let mode = x.context.borrow().mode();
        let eps = Tensor::scalar(&x.context, EPS);

        let normalized = match mode {
            Mode::Train => {
                let mean = x.mean_axes(&[0, 2, 3], true);
                let centered = x - &mean;
                let var = (&centered * &centered).mean_axes(&[0, 2, 3], true);
                let std = (&var + &eps).sqrt();

                let stats = BatchStatistics {
                    running_mean: self.running_mean.name().unwrap_or_default(),
                    running_var: self.running_var.name().unwrap_or_default(),
                    mean: mean.node_id,
                    var: var.node_id,
                    input: x.node_id,
                    momentum: self.momentum,
                };
                x.context.borrow_mut().record_batch_statistics(stats);
                &centered / &std
            }
            Mode::Eval => {
                let centered = x - &self.running_mean;
                let std = (&self.running_var + &eps).sqrt();
                &centered / &std
            }
        };

        let scaled = &normalized * &self.gamma;
        &scaled + &self.beta
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.gamma.clone(), self.beta.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::NodeType;

    #[test]
    fn train_mode_records_batch_statistics() {
        let ctx = Rc::new(RefCell::new(GraphContext::with_mode(Mode::Train)));
        let bn = BatchNorm2d::new(&ctx, "bn1", 4);
        let x = Tensor::new_input(&ctx, "x");
        bn.forward(&x);

        let ctx = ctx.borrow();
        assert_eq!(ctx.batch_statistics().len(), 1);
        let stats = &ctx.batch_statistics()[0];
        assert_eq!(stats.running_mean, "bn1.running_mean");
        assert_eq!(stats.input, x.node_id);
        assert_eq!(ctx.buffer_specs().len(), 2);
        assert_eq!(bn.parameters().len(), 2);
    }

    #[test]
    fn eval_mode_reads_running_statistics() {
        let ctx = Rc::new(RefCell::new(GraphContext::with_mode(Mode::Eval)));
        let bn = BatchNorm2d::new(&ctx, "bn1", 4);
        let x = Tensor::new_input(&ctx, "x");
        bn.forward(&x);

        let ctx = ctx.borrow();
        assert!(ctx.batch_statistics().is_empty());
        let graph = ctx.main_graph();
        let reads_buffer = graph.nodes.values().any(|n| {
            matches!(n.node_type, NodeType::Subtract(_, b) if b == bn.running_mean.node_id)
        });
        assert!(reads_buffer);
    }
}
