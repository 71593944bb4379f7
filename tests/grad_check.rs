//! Finite-difference checks of the analytic gradients built by autograd.

use unet_dann::analysis::shape_inference::ShapeInference;
use unet_dann::asg::{Asg, DType, NodeId, Value};
use unet_dann::autograd::Gradients;
use unet_dann::losses::{bce_with_logits_loss, cross_entropy_loss, mse_loss};
use unet_dann::nn::{BatchNorm2d, GroupNorm, Linear, Module};
use unet_dann::runtime::backend::{bind_leaves, Backend};
use unet_dann::runtime::cpu_backend::CpuBackend;
use unet_dann::state::ParamStore;
use unet_dann::tensor::{GraphContext, Tensor};

use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

const EPSILON: f32 = 1e-3;
const TOLERANCE: f32 = 1e-2;

/// Builds a scalar from the given inputs. Layers may register parameters;
/// they are bound from a fixed seed.
type Builder = fn(&Rc<RefCell<GraphContext>>, &[Tensor]) -> Tensor;

struct Compiled {
    graph: Asg,
    inputs: Vec<NodeId>,
    output: NodeId,
    data: HashMap<String, Value>,
}

fn compile(builder: Builder, inputs: &[ArrayD<f32>]) -> Compiled {
    let ctx = Rc::new(RefCell::new(GraphContext::new()));
    let leaves: Vec<Tensor> = (0..inputs.len()).map(|i| Tensor::new_input(&ctx, &format!("in{i}"))).collect();
    let y = builder(&ctx, &leaves);
    let store = ParamStore::from_context(&ctx.borrow(), 0);

    let mut graph = ctx.borrow().main_graph().clone();
    graph.set_output(y.node_id);
    let mut shapes = store.shapes();
    let mut data = store.named_tensors();
    for (i, x) in inputs.iter().enumerate() {
        shapes.insert(format!("in{i}"), (x.shape().to_vec(), DType::F32));
        data.insert(format!("in{i}"), Value::Tensor(x.clone()));
    }
    ShapeInference::run(&mut graph, &shapes).unwrap();
    Compiled { graph, inputs: leaves.iter().map(|t| t.node_id).collect(), output: y.node_id, data }
}

fn forward(builder: Builder, inputs: &[ArrayD<f32>]) -> f32 {
    let c = compile(builder, inputs);
    let backend = CpuBackend::new();
    let (out, _) = backend.run(&c.graph, bind_leaves(&c.graph, &c.data)).unwrap();
    let value = backend.retrieve_data(&out).unwrap().remove(0);
    assert_eq!(value.shape().iter().product::<usize>(), 1, "grad check output must be a scalar");
    value.scalar().unwrap()
}

fn analytic_grads(builder: Builder, inputs: &[ArrayD<f32>]) -> Vec<ArrayD<f32>> {
    let c = compile(builder, inputs);
    let grad_graph = Gradients::new(&c.graph).build(c.output, &c.inputs).unwrap();
    let backend = CpuBackend::new();
    let (_, memo) = backend.run(&c.graph, bind_leaves(&c.graph, &c.data)).unwrap();
    let (grads, _) = backend.run(&grad_graph, memo).unwrap();
    backend.retrieve_data(&grads).unwrap().into_iter().map(Value::into_array).collect()
}

fn numeric_grads(builder: Builder, inputs: &[ArrayD<f32>]) -> Vec<ArrayD<f32>> {
    (0..inputs.len())
        .map(|k| {
            let mut grad = ArrayD::zeros(inputs[k].raw_dim());
            for i in 0..inputs[k].len() {
                let mut shifted = inputs.to_vec();
                shifted[k].as_slice_mut().unwrap()[i] += EPSILON;
                let plus = forward(builder, &shifted);
                shifted[k].as_slice_mut().unwrap()[i] -= 2.0 * EPSILON;
                let minus = forward(builder, &shifted);
                grad.as_slice_mut().unwrap()[i] = (plus - minus) / (2.0 * EPSILON);
            }
            grad
        })
        .collect()
}

fn assert_grads_are_close(analytic: &ArrayD<f32>, numeric: &ArrayD<f32>) {
    assert_eq!(analytic.shape(), numeric.shape(), "gradient shapes differ");
    for (a, n) in analytic.iter().zip(numeric.iter()) {
        let diff = (a - n).abs();
        let larger = a.abs().max(n.abs()).max(1.0);
        assert!(
            diff / larger <= TOLERANCE,
            "gradients differ: analytic {a:.6}, numeric {n:.6}, relative error {:.6}",
            diff / larger
        );
    }
}

fn check(builder: Builder, inputs: &[ArrayD<f32>]) {
    let analytic = analytic_grads(builder, inputs);
    let numeric = numeric_grads(builder, inputs);
    assert_eq!(analytic.len(), inputs.len());
    for (a, n) in analytic.iter().zip(&numeric) {
        assert_grads_are_close(a, n);
    }
}

fn random(shape: &[usize], seed: u64) -> ArrayD<f32> {
    ArrayD::random_using(IxDyn(shape), Uniform::new(-1.0, 1.0), &mut StdRng::seed_from_u64(seed))
}

/// Distinct values spaced 0.1 apart, so max pooling has no ties within EPSILON.
fn distinct(shape: &[usize]) -> ArrayD<f32> {
    let n: usize = shape.iter().product();
    let values = (0..n).map(|i| ((i * 7919) % n) as f32 * 0.1 - n as f32 * 0.05 + 0.05).collect();
    ArrayD::from_shape_vec(IxDyn(shape), values).unwrap()
}

/// Fixed weights for reducing a tensor to a scalar with a non-trivial gradient.
fn weighted_sum(ctx: &Rc<RefCell<GraphContext>>, y: &Tensor, shape: &[usize]) -> Tensor {
    let w = Tensor::new_literal(ctx, random(shape, 99), "w");
    (y * &w).sum()
}

#[test]
fn grad_elementwise() {
    check(|_, x| (&(&x[0] * &x[1]) - &x[0]).sum(), &[random(&[2, 3], 1), random(&[2, 3], 2)]);
    check(|_, x| (&x[0] / &(x[1].exp())).sum(), &[random(&[4], 3), random(&[4], 4)]);
    check(|_, x| x[0].sigmoid().log().sum(), &[random(&[2, 2], 5)]);
    check(|_, x| x[0].softplus().mean(), &[random(&[3, 2], 6)]);
}

#[test]
fn grad_broadcast_and_reductions() {
    check(|_, x| (&x[0] * &x[1]).sum(), &[random(&[2, 3], 7), random(&[1, 3], 8)]);
    check(|ctx, x| weighted_sum(ctx, &x[0].mean_axes(&[0, 2], true), &[1, 3, 1]), &[random(&[2, 3, 4], 9)]);
    check(|ctx, x| weighted_sum(ctx, &x[0].sum_axes(&[1], false), &[2, 4]), &[random(&[2, 3, 4], 10)]);
}

#[test]
fn grad_matmul_and_shapes() {
    check(|_, x| x[0].dot(&x[1]).sum(), &[random(&[2, 3], 11), random(&[3, 4], 12)]);
    check(|ctx, x| weighted_sum(ctx, &x[0].transpose(0, 1), &[3, 2]), &[random(&[2, 3], 13)]);
    check(|ctx, x| weighted_sum(ctx, &x[0].flatten(), &[2, 12]), &[random(&[2, 3, 2, 2], 14)]);
}

#[test]
fn grad_softmax_family() {
    check(|ctx, x| weighted_sum(ctx, &x[0].softmax(), &[2, 3]), &[random(&[2, 3], 15)]);
    check(|ctx, x| weighted_sum(ctx, &x[0].log_softmax(), &[2, 3]), &[random(&[2, 3], 16)]);
}

#[test]
fn grad_conv2d() {
    // input, weight and bias
    check(
        |ctx, x| weighted_sum(ctx, &x[0].conv2d(&x[1], Some(&x[2]), (1, 1), (1, 1)), &[2, 3, 4, 4]),
        &[random(&[2, 2, 4, 4], 17), random(&[3, 2, 3, 3], 18), random(&[3], 19)],
    );
    check(
        |ctx, x| weighted_sum(ctx, &x[0].conv2d(&x[1], None, (2, 2), (0, 0)), &[1, 2, 2, 2]),
        &[random(&[1, 1, 5, 5], 20), random(&[2, 1, 3, 3], 21)],
    );
}

#[test]
fn grad_conv_transpose2d() {
    check(
        |ctx, x| weighted_sum(ctx, &x[0].conv_transpose2d(&x[1], Some(&x[2]), (2, 2), (0, 0)), &[2, 2, 6, 6]),
        &[random(&[2, 3, 3, 3], 22), random(&[3, 2, 2, 2], 23), random(&[2], 24)],
    );
}

#[test]
fn grad_max_pool2d() {
    check(|ctx, x| weighted_sum(ctx, &x[0].max_pool2d((2, 2), (2, 2)), &[1, 2, 2, 2]), &[distinct(&[1, 2, 4, 4])]);
}

#[test]
fn grad_relu() {
    check(|ctx, x| weighted_sum(ctx, &x[0].relu(), &[2, 5]), &[distinct(&[2, 5])]);
}

#[test]
fn grad_concat() {
    check(
        |ctx, x| weighted_sum(ctx, &Tensor::concat(&[&x[0], &x[1]], 1), &[2, 5, 2, 2]),
        &[random(&[2, 2, 2, 2], 25), random(&[2, 3, 2, 2], 26)],
    );
}

#[test]
fn grad_batch_norm() {
    check(
        |ctx, x| {
            let bn = BatchNorm2d::new(ctx, "bn", 3);
            weighted_sum(ctx, &bn.forward(&x[0]), &[2, 3, 2, 2])
        },
        &[random(&[2, 3, 2, 2], 27)],
    );
}

#[test]
fn grad_group_norm() {
    check(
        |ctx, x| {
            let gn = GroupNorm::new(ctx, "gn", 2, 4);
            weighted_sum(ctx, &gn.forward(&x[0]), &[2, 4, 2, 2])
        },
        &[random(&[2, 4, 2, 2], 28)],
    );
}

#[test]
fn grad_linear() {
    check(
        |ctx, x| {
            let fc = Linear::new(ctx, 4, 3, "fc");
            weighted_sum(ctx, &fc.forward(&x[0]), &[2, 3])
        },
        &[random(&[2, 4], 29)],
    );
}

#[test]
fn grad_losses() {
    let targets = ArrayD::random_using(IxDyn(&[2, 3]), Uniform::new(0.0, 1.0), &mut StdRng::seed_from_u64(30));
    check(|_, x| mse_loss(&x[0], &x[1]), &[random(&[2, 3], 31), targets.clone()]);
    check(|_, x| bce_with_logits_loss(&x[0], &x[1]), &[random(&[2, 3], 32), targets]);
    let one_hot = ndarray::array![[1.0_f32, 0.0], [0.0, 1.0], [0.0, 1.0]].into_dyn();
    check(|_, x| cross_entropy_loss(&x[0], &x[1]), &[random(&[3, 2], 33), one_hot]);
}

#[test]
fn gradient_reversal_negates_and_scales() {
    // Forward is the identity, so the numeric gradient is that of the plain graph.
    let through: Builder = |ctx, x| weighted_sum(ctx, &x[0].gradient_reversal(0.5).sigmoid(), &[2, 3]);
    let plain: Builder = |ctx, x| weighted_sum(ctx, &x[0].sigmoid(), &[2, 3]);
    let x = [random(&[2, 3], 34)];

    assert!((forward(through, &x) - forward(plain, &x)).abs() < 1e-6);
    let reversed = analytic_grads(through, &x).remove(0);
    let numeric = numeric_grads(plain, &x).remove(0);
    assert_grads_are_close(&reversed, &numeric.mapv(|g| -0.5 * g));
}
