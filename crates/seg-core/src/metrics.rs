//! Streaming segmentation metrics.
//!
//! Counts are accumulated as integers so that the aggregate never depends on
//! the order in which batches arrive. Rates are derived from the counts on
//! demand.

use serde::{Deserialize, Serialize};
use std::fs;
use std::ops::AddAssign;
use std::path::Path;
use tracing::info;

use crate::Result;

/// Binary confusion-matrix counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionCounts {
    pub true_positives: u64,
    pub false_positives: u64,
    pub true_negatives: u64,
    pub false_negatives: u64,
}

impl ConfusionCounts {
    pub fn new(tp: u64, fp: u64, tn: u64, fn_: u64) -> Self {
        Self {
            true_positives: tp,
            false_positives: fp,
            true_negatives: tn,
            false_negatives: fn_,
        }
    }

    /// Records a single prediction
    pub fn record(&mut self, predicted: bool, actual: bool) {
        match (predicted, actual) {
            (true, true) => self.true_positives += 1,
            (true, false) => self.false_positives += 1,
            (false, false) => self.true_negatives += 1,
            (false, true) => self.false_negatives += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.true_positives + self.false_positives + self.true_negatives + self.false_negatives
    }

    /// (TP + TN) / total, or 0 when nothing was recorded
    pub fn accuracy(&self) -> f64 {
        ratio(self.true_positives + self.true_negatives, self.total())
    }

    /// TP / (TP + FP), or 0 when nothing was predicted positive
    pub fn precision(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_positives)
    }

    /// TP / (TP + FN), or 0 when there were no positives
    pub fn recall(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_negatives)
    }

    /// Harmonic mean of precision and recall. NaN when both are zero.
    pub fn f1(&self) -> f64 {
        let p = self.precision();
        let r = self.recall();
        2.0 * ((p * r) / (p + r))
    }
}

impl AddAssign for ConfusionCounts {
    fn add_assign(&mut self, other: Self) {
        self.true_positives += other.true_positives;
        self.false_positives += other.false_positives;
        self.true_negatives += other.true_negatives;
        self.false_negatives += other.false_negatives;
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Whether an image counts as positive given its predicted-positive pixels.
pub fn image_is_positive(positive_pixels: usize, threshold: usize) -> bool {
    positive_pixels > threshold
}

/// Point-in-time view of the accumulated metrics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub image_accuracy: f64,
    pub image_precision: f64,
    pub image_recall: f64,
}

impl MetricsSnapshot {
    /// Named scalars in a stable order, as written to summaries.
    pub fn scalars(&self) -> [(&'static str, f64); 7] {
        [
            ("accuracy", self.accuracy),
            ("precision_1", self.precision),
            ("recall_1", self.recall),
            ("f1_score", self.f1),
            ("accuracy_per_image", self.image_accuracy),
            ("precision_per_image", self.image_precision),
            ("recall_per_image", self.image_recall),
        ]
    }
}

/// Pixel and image accumulators with separate state.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingMetrics {
    pixel: ConfusionCounts,
    image: ConfusionCounts,
    image_threshold: usize,
}

impl StreamingMetrics {
    pub fn new(image_threshold: usize) -> Self {
        Self {
            pixel: ConfusionCounts::default(),
            image: ConfusionCounts::default(),
            image_threshold,
        }
    }

    /// Drops everything accumulated so far
    pub fn reset(&mut self) {
        self.pixel = ConfusionCounts::default();
        self.image = ConfusionCounts::default();
    }

    pub fn image_threshold(&self) -> usize {
        self.image_threshold
    }

    pub fn pixel_counts(&self) -> ConfusionCounts {
        self.pixel
    }

    pub fn image_counts(&self) -> ConfusionCounts {
        self.image
    }

    /// Adds pre-counted pixel outcomes
    pub fn add_pixels(&mut self, counts: ConfusionCounts) {
        self.pixel += counts;
    }

    /// Adds one image given its predicted-positive pixel count and whether
    /// its mask contains any foreground.
    pub fn add_image(&mut self, predicted_pixels: usize, has_foreground: bool) {
        let predicted = image_is_positive(predicted_pixels, self.image_threshold);
        self.image.record(predicted, has_foreground);
    }

    /// Accumulates binary predictions against labels for a stack of images of
    /// `pixels_per_image` pixels each.
    pub fn update(&mut self, predictions: &[u8], labels: &[u8], pixels_per_image: usize) {
        if pixels_per_image == 0 {
            return;
        }
        for (pred, truth) in predictions
            .chunks(pixels_per_image)
            .zip(labels.chunks(pixels_per_image))
        {
            let mut counts = ConfusionCounts::default();
            let mut predicted_pixels = 0usize;
            let mut has_foreground = false;
            for (&p, &t) in pred.iter().zip(truth.iter()) {
                counts.record(p > 0, t > 0);
                predicted_pixels += (p > 0) as usize;
                has_foreground |= t > 0;
            }
            self.pixel += counts;
            self.add_image(predicted_pixels, has_foreground);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            accuracy: self.pixel.accuracy(),
            precision: self.pixel.precision(),
            recall: self.pixel.recall(),
            f1: self.pixel.f1(),
            image_accuracy: self.image.accuracy(),
            image_precision: self.image.precision(),
            image_recall: self.image.recall(),
        }
    }
}

/// Per-epoch summary kept for the history export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub global_step: u64,
    /// Mean of the periodic training accuracies, NaN if none were taken
    pub train_accuracy: f64,
    pub train_loss: f64,
    pub valid_accuracy: f64,
    pub valid_loss: f64,
    pub valid_recall: f64,
    pub learning_rate: f64,
}

/// Training history over epochs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub records: Vec<EpochRecord>,
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: EpochRecord) {
        self.records.push(record);
    }

    pub fn last(&self) -> Option<&EpochRecord> {
        self.records.last()
    }

    pub fn to_csv(&self) -> String {
        let mut csv = String::from(
            "epoch,global_step,train_acc,train_loss,valid_acc,valid_loss,valid_recall,learning_rate\n",
        );
        for r in &self.records {
            csv.push_str(&format!(
                "{},{},{:.6},{:.6},{:.6},{:.6},{:.6},{:.8}\n",
                r.epoch,
                r.global_step,
                r.train_accuracy,
                r.train_loss,
                r.valid_accuracy,
                r.valid_loss,
                r.valid_recall,
                r.learning_rate
            ));
        }
        csv
    }

    /// Writes the history as CSV
    pub fn export_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_csv())?;
        info!("Training history saved to: {}", path.display());
        Ok(())
    }
}

/// Arithmetic mean, NaN for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}
