//! Inference-mode evaluation over fixed splits.
//!
//! This module provides:
//! - Thresholding of sigmoid outputs into binary masks
//! - Pixel and image metric accumulation per batch
//! - Whole-split passes for validation and the final test

use burn::tensor::{activation::sigmoid, backend::Backend, ElementConversion};
use seg_core::{mean, Batch, MetricsSnapshot, StreamingMetrics};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;

use crate::loss::weighted_cross_entropy;
use crate::model::SegNet;
use crate::optim::batch_tensors;

/// Binary mask from probabilities: positive iff `p > threshold`.
pub fn threshold_predictions(probabilities: &[f32], threshold: f64) -> Vec<u8> {
    probabilities
        .iter()
        .map(|&p| (p as f64 > threshold) as u8)
        .collect()
}

/// Outcome of a single evaluated batch
#[derive(Debug, Clone)]
pub struct BatchEvaluation {
    pub predictions: Vec<u8>,
    pub cross_entropy: f64,
}

/// Outcome of a pass over a whole split
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitEvaluation {
    /// Metrics accumulated over the whole split
    pub metrics: MetricsSnapshot,
    /// Mean of the per-batch cross-entropies
    pub mean_cross_entropy: f64,
    /// Cumulative accuracy after each batch
    pub batch_accuracies: Vec<f64>,
    /// Cumulative recall after each batch
    pub batch_recalls: Vec<f64>,
    pub num_images: usize,
    pub elapsed_ms: f64,
}

impl SplitEvaluation {
    pub fn mean_batch_accuracy(&self) -> f64 {
        mean(&self.batch_accuracies)
    }

    pub fn mean_batch_recall(&self) -> f64 {
        mean(&self.batch_recalls)
    }
}

/// Model evaluator
#[derive(Debug, Clone, Copy)]
pub struct Evaluator {
    threshold: f64,
    positive_weight: f64,
}

impl Evaluator {
    pub fn new(threshold: f64, positive_weight: f64) -> Self {
        Self {
            threshold,
            positive_weight,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Runs one batch through `model` and accumulates its outcome.
    pub fn evaluate_batch<B: Backend>(
        &self,
        model: &SegNet<B>,
        batch: &Batch,
        metrics: &mut StreamingMetrics,
        device: &B::Device,
    ) -> BatchEvaluation {
        let (images, labels) = batch_tensors::<B>(batch, device);
        let logits = model.forward(images);
        let cross_entropy: f64 = weighted_cross_entropy(logits.clone(), labels, self.positive_weight)
            .into_scalar()
            .elem();
        let probabilities: Vec<f32> = sigmoid(logits).into_data().iter::<f32>().collect();
        let predictions = threshold_predictions(&probabilities, self.threshold);
        metrics.update(&predictions, &batch.labels, batch.size * batch.size);
        BatchEvaluation {
            predictions,
            cross_entropy,
        }
    }

    /// Resets `metrics`, then evaluates every batch in order.
    pub fn evaluate_split<B: Backend>(
        &self,
        model: &SegNet<B>,
        batches: &[Batch],
        metrics: &mut StreamingMetrics,
        device: &B::Device,
    ) -> SplitEvaluation {
        self.evaluate_split_with(model, batches, metrics, device, |_, _| {})
    }

    /// Like [`Evaluator::evaluate_split`], handing every batch and its
    /// outcome to `on_batch`.
    pub fn evaluate_split_with<B, F>(
        &self,
        model: &SegNet<B>,
        batches: &[Batch],
        metrics: &mut StreamingMetrics,
        device: &B::Device,
        mut on_batch: F,
    ) -> SplitEvaluation
    where
        B: Backend,
        F: FnMut(&Batch, BatchEvaluation),
    {
        let start = Instant::now();
        metrics.reset();

        let mut cross_entropies = Vec::with_capacity(batches.len());
        let mut batch_accuracies = Vec::with_capacity(batches.len());
        let mut batch_recalls = Vec::with_capacity(batches.len());
        let mut num_images = 0;
        for batch in batches {
            let outcome = self.evaluate_batch(model, batch, metrics, device);
            cross_entropies.push(outcome.cross_entropy);
            let pixels = metrics.pixel_counts();
            batch_accuracies.push(pixels.accuracy());
            batch_recalls.push(pixels.recall());
            num_images += batch.len;
            on_batch(batch, outcome);
        }

        let evaluation = SplitEvaluation {
            metrics: metrics.snapshot(),
            mean_cross_entropy: mean(&cross_entropies),
            batch_accuracies,
            batch_recalls,
            num_images,
            elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
        };
        debug!(
            "Evaluated {} images in {:.1} ms",
            evaluation.num_images, evaluation.elapsed_ms
        );
        evaluation
    }
}
