//! On-line augmentation for image/mask pairs.
//!
//! Every geometric transform is applied to the image and its mask together,
//! so foreground pixels stay aligned with the intensities they annotate.

use image::{imageops, ImageBuffer, Luma};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use seg_core::{Batch, Sample};

type ImageView<'a> = ImageBuffer<Luma<f32>, &'a mut [f32]>;
type MaskView<'a> = ImageBuffer<Luma<u8>, &'a mut [u8]>;

/// Which random flips are enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlipConfig {
    pub horizontal: bool,
    pub vertical: bool,
}

impl Default for FlipConfig {
    fn default() -> Self {
        Self {
            horizontal: true,
            vertical: true,
        }
    }
}

/// Random paired flips, each with probability one half.
pub struct PairedAugmenter {
    config: FlipConfig,
    rng: ChaCha8Rng,
}

impl PairedAugmenter {
    pub fn new(config: FlipConfig, seed: u64) -> Self {
        Self {
            config,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Augments a single sample in place
    pub fn augment_sample(&mut self, sample: &mut Sample) {
        let size = sample.size;
        self.augment_slices(&mut sample.image, &mut sample.label, size);
    }

    /// Augments every image of a batch independently
    pub fn augment_batch(&mut self, batch: &mut Batch) {
        let pixels = batch.size * batch.size;
        if pixels == 0 {
            return;
        }
        let size = batch.size;
        for (image, label) in batch
            .images
            .chunks_mut(pixels)
            .zip(batch.labels.chunks_mut(pixels))
        {
            self.augment_slices(image, label, size);
        }
    }

    fn augment_slices(&mut self, image: &mut [f32], label: &mut [u8], size: usize) {
        let Some((mut image, mut label)) = pair_views(image, label, size) else {
            return;
        };
        if self.config.horizontal && self.rng.gen_bool(0.5) {
            imageops::flip_horizontal_in_place(&mut image);
            imageops::flip_horizontal_in_place(&mut label);
        }
        if self.config.vertical && self.rng.gen_bool(0.5) {
            imageops::flip_vertical_in_place(&mut image);
            imageops::flip_vertical_in_place(&mut label);
        }
    }
}

/// Borrows a square image/mask pair as image buffers. `None` when a buffer
/// is shorter than `size * size`.
fn pair_views<'a>(image: &'a mut [f32], label: &'a mut [u8], size: usize) -> Option<(ImageView<'a>, MaskView<'a>)> {
    let side = u32::try_from(size).ok()?;
    Some((ImageBuffer::from_raw(side, side, image)?, ImageBuffer::from_raw(side, side, label)?))
}

/// Mirrors the columns of a square image and its mask.
pub fn flip_pair_horizontal(image: &mut [f32], label: &mut [u8], size: usize) {
    if let Some((mut image, mut label)) = pair_views(image, label, size) {
        imageops::flip_horizontal_in_place(&mut image);
        imageops::flip_horizontal_in_place(&mut label);
    }
}

/// Reverses the row order of a square image and its mask.
pub fn flip_pair_vertical(image: &mut [f32], label: &mut [u8], size: usize) {
    if let Some((mut image, mut label)) = pair_views(image, label, size) {
        imageops::flip_vertical_in_place(&mut image);
        imageops::flip_vertical_in_place(&mut label);
    }
}
