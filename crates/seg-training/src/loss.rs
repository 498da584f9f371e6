//! Class-weighted binary cross-entropy.

use burn::tensor::{backend::Backend, Tensor};

use crate::model::SegNet;

/// Mean per-pixel cross-entropy between `logits` and `{0, 1}` labels,
/// with foreground pixels weighted by `positive_weight`.
///
/// Evaluated on the pre-sigmoid logits as
/// `max(z, 0) - z * y + ln(1 + exp(-|z|))`, which stays finite for large `|z|`.
pub fn weighted_cross_entropy<B: Backend>(
    logits: Tensor<B, 4>,
    labels: Tensor<B, 4>,
    positive_weight: f64,
) -> Tensor<B, 1> {
    let weights = labels
        .clone()
        .greater_elem(0.0)
        .float()
        .mul_scalar(positive_weight - 1.0)
        .add_scalar(1.0);
    let per_pixel = logits.clone().clamp_min(0.0) - logits.clone() * labels + logits.abs().neg().exp().log1p();
    (per_pixel * weights).mean()
}

/// Cross-entropy plus the network's L2 penalty.
pub struct LossOutput<B: Backend> {
    pub total: Tensor<B, 1>,
    pub cross_entropy: Tensor<B, 1>,
}

pub fn total_loss<B: Backend>(
    model: &SegNet<B>,
    logits: Tensor<B, 4>,
    labels: Tensor<B, 4>,
    positive_weight: f64,
) -> LossOutput<B> {
    let cross_entropy = weighted_cross_entropy(logits, labels, positive_weight);
    let total = cross_entropy.clone() + model.l2_penalty();
    LossOutput { total, cross_entropy }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn tensor(values: Vec<f32>) -> Tensor<TestBackend, 4> {
        let n = values.len();
        Tensor::from_data(TensorData::new(values, [1, 1, 1, n]), &Default::default())
    }

    fn reference(logits: &[f64], labels: &[f64], weight: f64) -> f64 {
        let total: f64 = logits
            .iter()
            .zip(labels)
            .map(|(&z, &y)| {
                let p = 1.0 / (1.0 + (-z).exp());
                let w = if y > 0.0 { weight } else { 1.0 };
                w * -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
            })
            .sum();
        total / logits.len() as f64
    }

    #[test]
    fn test_matches_hand_computation() {
        let z = [0.0, 2.0, -1.0, 3.0];
        let y = [1.0, 0.0, 0.0, 1.0];
        let loss = weighted_cross_entropy(
            tensor(z.iter().map(|&v| v as f32).collect()),
            tensor(y.iter().map(|&v| v as f32).collect()),
            15.0,
        );
        let value = loss.into_scalar() as f64;
        assert!((value - reference(&z, &y, 15.0)).abs() < 1e-5);
        assert!((value - 3.391551).abs() < 1e-4);
    }

    #[test]
    fn test_unit_weight_is_plain_bce() {
        let z = [0.5, -0.5];
        let y = [0.0, 1.0];
        let value = weighted_cross_entropy(tensor(vec![0.5, -0.5]), tensor(vec![0.0, 1.0]), 1.0).into_scalar() as f64;
        assert!((value - reference(&z, &y, 1.0)).abs() < 1e-6);
    }

    #[test]
    fn test_stable_for_large_logits() {
        let value = weighted_cross_entropy(tensor(vec![80.0, -80.0]), tensor(vec![1.0, 0.0]), 15.0).into_scalar();
        assert!(value.is_finite());
        assert!(value < 1e-6);
    }
}
