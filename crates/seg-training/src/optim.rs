//! One optimizer step over all parameters or over the decoder side only.

use burn::{
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{
        activation::sigmoid, backend::AutodiffBackend, backend::Backend, ElementConversion, Tensor, TensorData,
    },
};
use seg_core::{Batch, ExperimentConfig};

use crate::architecture::is_trainable_when_frozen;
use crate::loss::total_loss;
use crate::model::{LayerRef, SegNet};

/// Which parameters an optimizer step may update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamScope {
    All,
    /// Only layers matched by [`is_trainable_when_frozen`]
    Frozen,
}

impl ParamScope {
    pub fn from_config(config: &ExperimentConfig) -> Self {
        if config.training.freeze {
            ParamScope::Frozen
        } else {
            ParamScope::All
        }
    }

    pub fn includes(&self, layer: &str) -> bool {
        match self {
            ParamScope::All => true,
            ParamScope::Frozen => is_trainable_when_frozen(layer),
        }
    }
}

/// Adam with beta1 0.9, beta2 0.999 and epsilon 1e-8.
pub fn adam_config() -> AdamConfig {
    AdamConfig::new().with_beta_1(0.9).with_beta_2(0.999).with_epsilon(1e-8)
}

/// Image and label tensors of shape `[n, 1, S, S]`.
pub fn batch_tensors<B: Backend>(batch: &Batch, device: &B::Device) -> (Tensor<B, 4>, Tensor<B, 4>) {
    let shape = batch.shape();
    let images = Tensor::from_data(TensorData::new(batch.images.clone(), shape), device);
    let labels = Tensor::from_data(TensorData::new(batch.labels_f32(), shape), device);
    (images, labels)
}

/// Result of one optimizer step
pub struct StepOutput<B: AutodiffBackend> {
    pub model: SegNet<B>,
    pub loss: f64,
    pub cross_entropy: f64,
    /// Sigmoid output of the forward pass, detached from the graph
    pub probabilities: Tensor<B::InnerBackend, 4>,
}

/// Forward, backward and one optimizer update at `learning_rate`.
///
/// Gradients of layers outside `scope` are dropped before the update, so
/// the optimizer leaves their parameters untouched.
pub fn train_step<B, O>(
    model: SegNet<B>,
    optimizer: &mut O,
    batch: &Batch,
    positive_weight: f64,
    learning_rate: f64,
    scope: ParamScope,
    device: &B::Device,
) -> StepOutput<B>
where
    B: AutodiffBackend,
    O: Optimizer<SegNet<B>, B>,
{
    let (images, labels) = batch_tensors::<B>(batch, device);
    let logits = model.forward(images);
    let probabilities = sigmoid(logits.clone().inner());
    let loss = total_loss(&model, logits, labels, positive_weight);

    let loss_value: f64 = loss.total.clone().into_scalar().elem();
    let ce_value: f64 = loss.cross_entropy.into_scalar().elem();

    let mut raw = loss.total.backward();
    if scope != ParamScope::All {
        for (name, layer) in model.layers() {
            if scope.includes(name) {
                continue;
            }
            match layer {
                LayerRef::Conv(block) => {
                    let _ = GradientsParams::from_module(&mut raw, block);
                }
                LayerRef::Transpose(block) => {
                    let _ = GradientsParams::from_module(&mut raw, block);
                }
            }
        }
    }
    let grads = GradientsParams::from_grads(raw, &model);
    let model = optimizer.step(learning_rate, model, grads);

    StepOutput {
        model,
        loss: loss_value,
        cross_entropy: ce_value,
        probabilities,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_support::small_config;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use seg_core::Sample;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn batch(n: usize, size: usize) -> Batch {
        let samples = (0..n)
            .map(|i| {
                let image: Vec<f32> = (0..size * size).map(|p| ((p + i) % 7) as f32 / 7.0).collect();
                let label: Vec<u8> = (0..size * size).map(|p| (p % 5 == 0) as u8).collect();
                Sample::new(image, label, size).unwrap()
            })
            .collect();
        Batch::from_samples(samples).unwrap()
    }

    fn kernels(model: &SegNet<TestBackend>) -> Vec<(String, TensorData)> {
        model
            .layers()
            .into_iter()
            .map(|(name, layer)| (name.to_string(), layer.kernel().into_data()))
            .collect()
    }

    #[test]
    fn test_scope_includes() {
        assert!(ParamScope::All.includes("conv0.1"));
        assert!(!ParamScope::Frozen.includes("conv0.1"));
        assert!(ParamScope::Frozen.includes("up_conv9"));
    }

    #[test]
    fn test_full_step_updates_encoder() {
        let device = Default::default();
        let model = small_config().init::<TestBackend>(&device).unwrap();
        let before = kernels(&model);
        let mut optimizer = adam_config().init::<TestBackend, SegNet<TestBackend>>();
        let out = train_step(model, &mut optimizer, &batch(2, 64), 15.0, 1e-3, ParamScope::All, &device);
        assert!(out.loss.is_finite());
        assert!(out.loss >= out.cross_entropy);
        assert_eq!(out.probabilities.dims(), [2, 1, 64, 64]);
        let after = kernels(&out.model);
        let encoder_changed = before
            .iter()
            .zip(after.iter())
            .any(|((name, b), (_, a))| !is_trainable_when_frozen(name) && b != a);
        assert!(encoder_changed);
    }

    #[test]
    fn test_frozen_step_leaves_encoder_untouched() {
        let device = Default::default();
        let model = small_config().init::<TestBackend>(&device).unwrap();
        let before = kernels(&model);
        let gamma_before = model.stages[0].convs[0].bn.as_ref().unwrap().gamma.val().into_data();
        let mut optimizer = adam_config().init::<TestBackend, SegNet<TestBackend>>();
        let out = train_step(model, &mut optimizer, &batch(2, 64), 15.0, 1e-2, ParamScope::Frozen, &device);
        let after = kernels(&out.model);

        for ((name, b), (_, a)) in before.iter().zip(after.iter()) {
            if name == "logits" {
                assert_ne!(b, a, "logits should have been updated");
            } else if !is_trainable_when_frozen(name) {
                assert_eq!(b, a, "{} should be frozen", name);
            }
        }
        let gamma_after = out.model.stages[0].convs[0].bn.as_ref().unwrap().gamma.val().into_data();
        assert_eq!(gamma_before, gamma_after);
    }
}
