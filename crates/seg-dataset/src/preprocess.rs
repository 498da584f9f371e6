//! Pixel-level preprocessing for grayscale scans and their masks.
//!
//! Scans are held as `f32` luma buffers and masks as binary `GrayImage`s.
//! Every crop takes the same window out of both so the pair stays aligned.

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, ImageBuffer, Luma};
use rand::Rng;
use seg_core::{Error, Result};

/// Grayscale scan with intensities in `[0, 255]`
pub type GrayF32 = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Intensity adjustments applied to every image after cropping.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Preprocessor {
    /// Per-image standardization
    pub normalize: bool,
    /// Contrast factor around the image mean
    pub contrast: Option<f32>,
}

impl Preprocessor {
    pub fn new(normalize: bool, contrast: Option<f32>) -> Self {
        Self { normalize, contrast }
    }

    pub fn apply(&self, pixels: &mut [f32]) {
        if let Some(factor) = self.contrast {
            adjust_contrast(pixels, factor);
        }
        if self.normalize {
            standardize(pixels);
        }
    }
}

pub fn image_to_gray(image: &DynamicImage) -> GrayF32 {
    let gray = image.to_luma8();
    ImageBuffer::from_fn(gray.width(), gray.height(), |x, y| {
        Luma([f32::from(gray.get_pixel(x, y)[0])])
    })
}

/// Binary mask: any non-zero intensity is foreground.
pub fn image_to_mask(image: &DynamicImage) -> GrayImage {
    let mut mask = image.to_luma8();
    for pixel in mask.pixels_mut() {
        pixel[0] = (pixel[0] > 0) as u8;
    }
    mask
}

/// Rescales an image/mask pair by `scale`. Masks use nearest-neighbour so
/// they stay binary.
pub fn rescale_pair(image: &DynamicImage, mask: &DynamicImage, scale: f32) -> (DynamicImage, DynamicImage) {
    if (scale - 1.0).abs() < f32::EPSILON {
        return (image.clone(), mask.clone());
    }
    let w = ((image.width() as f32) * scale).round().max(1.0) as u32;
    let h = ((image.height() as f32) * scale).round().max(1.0) as u32;
    let image = image.resize_exact(w, h, FilterType::Triangle);
    let mask = DynamicImage::ImageLuma8(imageops::resize(&mask.to_luma8(), w, h, FilterType::Nearest));
    (image, mask)
}

fn crop_side(image: &GrayF32, mask: &GrayImage, size: usize) -> Result<u32> {
    if image.dimensions() != mask.dimensions() {
        return Err(Error::Dataset(format!(
            "image of {:?} does not match its mask of {:?}",
            image.dimensions(),
            mask.dimensions()
        )));
    }
    let side = u32::try_from(size).map_err(|_| Error::InvalidArgument(format!("crop size {} is too large", size)))?;
    let (width, height) = image.dimensions();
    if width < side || height < side {
        return Err(Error::Dataset(format!(
            "image of {}x{} is smaller than the {}x{} crop",
            width, height, size, size
        )));
    }
    Ok(side)
}

/// Copies the `side x side` window at (`left`, `top`) out of both buffers.
fn crop_pair(image: &GrayF32, mask: &GrayImage, left: u32, top: u32, side: u32) -> (Vec<f32>, Vec<u8>) {
    let image = imageops::crop_imm(image, left, top, side, side).to_image();
    let mask = imageops::crop_imm(mask, left, top, side, side).to_image();
    (image.into_raw(), mask.into_raw())
}

/// Center crop of an image and its mask.
pub fn center_crop_pair(image: &GrayF32, mask: &GrayImage, size: usize) -> Result<(Vec<f32>, Vec<u8>)> {
    let side = crop_side(image, mask, size)?;
    let left = (image.width() - side) / 2;
    let top = (image.height() - side) / 2;
    Ok(crop_pair(image, mask, left, top, side))
}

/// Random crop at the same offset in image and mask.
pub fn random_crop_pair<R: Rng>(
    image: &GrayF32,
    mask: &GrayImage,
    size: usize,
    rng: &mut R,
) -> Result<(Vec<f32>, Vec<u8>)> {
    let side = crop_side(image, mask, size)?;
    let left = rng.gen_range(0..=image.width() - side);
    let top = rng.gen_range(0..=image.height() - side);
    Ok(crop_pair(image, mask, left, top, side))
}

/// Zero mean, unit variance, with the deviation floored at `1/sqrt(n)`.
pub fn standardize(pixels: &mut [f32]) {
    if pixels.is_empty() {
        return;
    }
    let n = pixels.len() as f32;
    let mean = pixels.iter().sum::<f32>() / n;
    let variance = pixels.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
    let adjusted = variance.sqrt().max(1.0 / n.sqrt());
    for v in pixels.iter_mut() {
        *v = (*v - mean) / adjusted;
    }
}

/// Scales deviations from the image mean by `factor`.
pub fn adjust_contrast(pixels: &mut [f32], factor: f32) {
    if pixels.is_empty() {
        return;
    }
    let mean = pixels.iter().sum::<f32>() / pixels.len() as f32;
    for v in pixels.iter_mut() {
        *v = (*v - mean) * factor + mean;
    }
}
