//! Split statistics logged before training.

use seg_core::{image_is_positive, Sample};

/// Foreground statistics for a set of samples
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SplitStatistics {
    pub num_samples: usize,
    pub positive_images: usize,
    pub foreground_pixels: usize,
    pub total_pixels: usize,
}

impl SplitStatistics {
    /// `image_threshold` is the foreground pixel count an image must exceed
    /// to count as positive.
    pub fn from_samples(samples: &[Sample], image_threshold: usize) -> Self {
        let mut stats = Self::default();
        for sample in samples {
            let positive = sample.positive_pixels();
            stats.num_samples += 1;
            stats.foreground_pixels += positive;
            stats.total_pixels += sample.label.len();
            if image_is_positive(positive, image_threshold) {
                stats.positive_images += 1;
            }
        }
        stats
    }

    pub fn foreground_fraction(&self) -> f64 {
        if self.total_pixels == 0 {
            0.0
        } else {
            self.foreground_pixels as f64 / self.total_pixels as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_samples() {
        let samples = vec![
            Sample::new(vec![0.0; 4], vec![1, 1, 0, 0], 2).unwrap(),
            Sample::new(vec![0.0; 4], vec![0, 0, 0, 1], 2).unwrap(),
        ];
        let stats = SplitStatistics::from_samples(&samples, 1);
        assert_eq!(stats.num_samples, 2);
        assert_eq!(stats.positive_images, 1);
        assert_eq!(stats.foreground_pixels, 3);
        assert!((stats.foreground_fraction() - 0.375).abs() < 1e-12);
    }

    #[test]
    fn test_empty() {
        let stats = SplitStatistics::from_samples(&[], 1);
        assert_eq!(stats.foreground_fraction(), 0.0);
    }
}
