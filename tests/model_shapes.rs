//! Shape checks of the full-size model, done by shape inference alone.

use unet_dann::analysis::shape_inference::ShapeInference;
use unet_dann::asg::DType;
use unet_dann::config::ModelConfig;
use unet_dann::model::UNetAE;
use unet_dann::state::ParamStore;
use unet_dann::tensor::{GraphContext, Mode, Tensor};

use std::cell::RefCell;
use std::rc::Rc;

/// Inferred shapes of every model output.
struct ModelShapes {
    encoder_outputs: Vec<Vec<usize>>,
    center: Vec<usize>,
    reversed_center: Vec<usize>,
    reconstruction: Vec<usize>,
    domain_logits: Vec<usize>,
}

fn infer_shapes(config: &ModelConfig, mode: Mode, batch: usize) -> (ModelShapes, ParamStore) {
    let ctx = Rc::new(RefCell::new(GraphContext::with_mode(mode)));
    let model = UNetAE::new(&ctx, config);
    let x = Tensor::new_input(&ctx, "x");
    let encoded = model.encoder.forward(&x);
    let (reconstruction, domain_logits) = model.forward(&x);

    let store = ParamStore::from_context(&ctx.borrow(), 0);
    let mut shapes = store.shapes();
    shapes.insert("x".to_string(), (vec![batch, config.in_channels, config.input_size, config.input_size], DType::F32));

    let levels: Vec<usize> = encoded.encoder_outputs.iter().map(|t| t.node_id).collect();
    let mut outputs = levels.clone();
    outputs.extend([encoded.center.node_id, encoded.reversed_center.node_id, reconstruction.node_id, domain_logits.node_id]);
    let mut ctx = ctx.borrow_mut();
    let graph = ctx.main_graph_mut();
    graph.set_outputs(outputs);
    ShapeInference::run(graph, &shapes).unwrap();
    let shape = |id: usize| graph.shape_of(id).unwrap().clone();
    let model_shapes = ModelShapes {
        encoder_outputs: levels.iter().map(|&id| shape(id)).collect(),
        center: shape(encoded.center.node_id),
        reversed_center: shape(encoded.reversed_center.node_id),
        reconstruction: shape(reconstruction.node_id),
        domain_logits: shape(domain_logits.node_id),
    };
    (model_shapes, store)
}

#[test]
fn default_model_shapes() {
    let config = ModelConfig::default();
    config.validate().unwrap();
    let (shapes, store) = infer_shapes(&config, Mode::Train, 2);

    assert_eq!(
        shapes.encoder_outputs,
        vec![vec![2, 64, 128, 128], vec![2, 128, 64, 64], vec![2, 256, 32, 32], vec![2, 512, 16, 16]]
    );
    assert_eq!(shapes.center, vec![2, 1024, 8, 8]);
    assert_eq!(shapes.reversed_center, shapes.center);
    assert_eq!(shapes.reconstruction, vec![2, 1, 128, 128]);
    assert_eq!(shapes.domain_logits, vec![2, 2]);

    assert!(store.parameters().contains_key("classifier.fc2.weight"));
    assert!(store.buffers().contains_key("encoder.convblock1.norm1.running_mean"));
    assert!(store.num_parameters() > 1_000_000);
}

#[test]
fn group_norm_model_has_no_buffers() {
    let config = ModelConfig { feature_maps: 16, levels: 3, input_size: 64, group_norm: Some(8), ..Default::default() };
    config.validate().unwrap();
    let (shapes, store) = infer_shapes(&config, Mode::Eval, 3);
    assert_eq!(shapes.encoder_outputs.len(), 3);
    assert_eq!(shapes.center, vec![3, 128, 8, 8]);
    assert_eq!(shapes.reconstruction, vec![3, 1, 64, 64]);
    assert_eq!(shapes.domain_logits, vec![3, 2]);
    assert!(store.buffers().is_empty());
}

#[test]
fn multi_channel_reconstruction() {
    let config = ModelConfig {
        in_channels: 3,
        out_channels: 3,
        feature_maps: 4,
        levels: 2,
        input_size: 32,
        ..Default::default()
    };
    let (shapes, _) = infer_shapes(&config, Mode::Train, 1);
    assert_eq!(shapes.reconstruction, vec![1, 3, 32, 32]);
    assert_eq!(shapes.domain_logits, vec![1, 2]);
}
