//! U-Net autoencoder with a domain-adversarial head.

use crate::config::ModelConfig;
use crate::model::classifier::DomainClassifier;
use crate::model::decoder::UNetDecoder;
use crate::model::encoder::UNetEncoder;
use crate::nn::{Module, NormKind};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Encoder, skip-free decoder and a domain classifier fed through the
/// gradient reversal layer.
///
/// ```rust,ignore
/// let ctx = Rc::new(RefCell::new(GraphContext::with_mode(Mode::Train)));
/// let model = UNetAE::new(&ctx, &ModelConfig::default());
/// let x = Tensor::new_input(&ctx, "x");
/// let (reconstruction, domain_logits) = model.forward(&x);
/// ```
pub struct UNetAE {
    pub encoder: UNetEncoder,
    pub decoder: UNetDecoder,
    pub classifier: DomainClassifier,
}

impl UNetAE {
    /// Registers every parameter of the model in `ctx`. `config` is expected
    /// to have passed [`ModelConfig::validate`].
    pub fn new(ctx: &Rc<RefCell<GraphContext>>, config: &ModelConfig) -> Self {
        let norm = NormKind::from_groups(config.group_norm);
        let encoder = UNetEncoder::new(
            ctx,
            "encoder",
            config.in_channels,
            config.feature_maps,
            config.levels,
            norm,
            config.grl_scale,
        );
        let decoder =
            UNetDecoder::new(ctx, "decoder", config.out_channels, config.feature_maps, config.levels, false, norm);
        let latent = config.latent_size();
        let classifier = DomainClassifier::standard(
            ctx,
            "classifier",
            (config.feature_maps << config.levels, latent, latent),
            norm,
        );
        Self { encoder, decoder, classifier }
    }

    /// Returns `(reconstruction_logits, domain_logits)`.
    pub fn forward(&self, inputs: &Tensor) -> (Tensor, Tensor) {
        let encoded = self.encoder.forward(inputs);
        let (_, reconstruction) = self.decoder.forward(&encoded.center, &encoded.encoder_outputs);
        let domain_logits = self.classifier.forward(&encoded.reversed_center);
        (reconstruction, domain_logits)
    }

    pub fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.encoder.parameters();
        params.extend(self.decoder.parameters());
        params.extend(self.classifier.parameters());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::shape_inference::ShapeInference;
    use crate::asg::DType;
    use crate::tensor::Mode;
    use std::collections::HashMap;

    fn small_config(group_norm: Option<usize>) -> ModelConfig {
        ModelConfig { feature_maps: 4, levels: 2, input_size: 32, group_norm, ..Default::default() }
    }

    fn infer(ctx: &Rc<RefCell<GraphContext>>, outputs: Vec<usize>, batch: usize) -> Vec<Vec<usize>> {
        let mut ctx = ctx.borrow_mut();
        let mut shapes: HashMap<String, (Vec<usize>, DType)> = ctx
            .parameter_specs()
            .iter()
            .chain(ctx.buffer_specs())
            .map(|s| (s.name.clone(), (s.shape.clone(), DType::F32)))
            .collect();
        shapes.insert("x".to_string(), (vec![batch, 1, 32, 32], DType::F32));
        let graph = ctx.main_graph_mut();
        graph.set_outputs(outputs.clone());
        ShapeInference::run(graph, &shapes).unwrap();
        outputs.iter().map(|&id| graph.shape_of(id).unwrap().clone()).collect()
    }

    #[test]
    fn forward_shapes_match_input() {
        for mode in [Mode::Train, Mode::Eval] {
            let ctx = Rc::new(RefCell::new(GraphContext::with_mode(mode)));
            let model = UNetAE::new(&ctx, &small_config(None));
            let x = Tensor::new_input(&ctx, "x");
            let (rec, dom) = model.forward(&x);
            let shapes = infer(&ctx, vec![rec.node_id, dom.node_id], 3);
            assert_eq!(shapes[0], vec![3, 1, 32, 32]);
            assert_eq!(shapes[1], vec![3, 2]);
        }
    }

    #[test]
    fn parameters_are_unique_and_registered() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let model = UNetAE::new(&ctx, &small_config(Some(2)));
        let params = model.parameters();
        let specs = ctx.borrow().parameter_specs().len();
        assert_eq!(params.len(), specs);
        let mut ids: Vec<usize> = params.iter().map(|p| p.node_id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), specs);
        assert!(ctx.borrow().buffer_specs().is_empty());
    }

    #[test]
    fn decoder_without_skips_takes_narrow_input() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        UNetAE::new(&ctx, &small_config(None));
        let ctx = ctx.borrow();
        let spec = |name: &str| ctx.parameter_specs().iter().find(|s| s.name == name).unwrap().shape.clone();
        assert_eq!(spec("encoder.center.conv1.weight"), vec![16, 8, 3, 3]);
        assert_eq!(spec("decoder.upconv1.up.weight"), vec![16, 8, 2, 2]);
        assert_eq!(spec("decoder.convblock1.conv1.weight"), vec![8, 8, 3, 3]);
        assert_eq!(spec("decoder.output.weight"), vec![1, 4, 1, 1]);
        // 48 channels over a 1x1 map after three poolings of the 8x8 latent.
        assert_eq!(spec("classifier.fc0.weight"), vec![48, 48]);
        assert_eq!(spec("classifier.fc2.bias"), vec![1, 2]);
    }
}
