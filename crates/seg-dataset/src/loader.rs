//! Image/mask loading from disk.
//!
//! Layout under the data root:
//!
//! ```text
//! <root>/<dataset>/{train,validation,test}/images/*.png
//! <root>/<dataset>/{train,validation,test}/masks/*.png   (same file names)
//! <root>/train_images/*.png + <root>/train_labels/*.png  (raw crop dataset)
//! ```

use image::DynamicImage;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use seg_core::{Error, ExperimentConfig, Result, Sample, Split};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::preprocess::{
    center_crop_pair, image_to_gray, image_to_mask, random_crop_pair, rescale_pair, Preprocessor,
};

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "tif"];

/// Produces training samples one at a time, indefinitely.
pub trait SampleSource: Send {
    fn next_sample(&mut self) -> Result<Sample>;
}

/// Loads a whole evaluation split into memory.
pub trait SplitSource {
    fn load_split(&self, split: Split) -> Result<Vec<Sample>>;
}

/// Where each split of a dataset lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetLayout {
    root: PathBuf,
    dataset: u32,
}

impl DatasetLayout {
    pub fn new(root: impl Into<PathBuf>, dataset: u32) -> Self {
        Self {
            root: root.into(),
            dataset,
        }
    }

    pub fn split_dir(&self, split: Split) -> PathBuf {
        self.root.join(self.dataset.to_string()).join(split.dir_name())
    }

    pub fn images_dir(&self, split: Split) -> PathBuf {
        self.split_dir(split).join("images")
    }

    pub fn masks_dir(&self, split: Split) -> PathBuf {
        self.split_dir(split).join("masks")
    }

    pub fn raw_images_dir(&self) -> PathBuf {
        self.root.join("train_images")
    }

    pub fn raw_labels_dir(&self) -> PathBuf {
        self.root.join("train_labels")
    }
}

/// Path of an image and the path of its mask
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePair {
    pub image: PathBuf,
    pub mask: PathBuf,
}

/// Image loader for image/mask datasets
#[derive(Debug, Clone)]
pub struct ImagePairLoader {
    layout: DatasetLayout,
    size: usize,
    preprocessor: Preprocessor,
}

impl ImagePairLoader {
    pub fn new(layout: DatasetLayout, size: usize, preprocessor: Preprocessor) -> Self {
        Self {
            layout,
            size,
            preprocessor,
        }
    }

    pub fn from_config(config: &ExperimentConfig) -> Self {
        Self::new(
            DatasetLayout::new(&config.data.data_dir, config.run.dataset),
            config.model.size,
            Preprocessor::new(config.data.normalize, config.data.contrast),
        )
    }

    pub fn layout(&self) -> &DatasetLayout {
        &self.layout
    }

    /// Lists every image with its mask, sorted by file name.
    pub fn list_pairs(images_dir: &Path, masks_dir: &Path) -> Result<Vec<ImagePair>> {
        if !images_dir.is_dir() {
            return Err(Error::NotFound(format!(
                "image directory not found: {}",
                images_dir.display()
            )));
        }

        let mut pairs = Vec::new();
        for entry in WalkDir::new(images_dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| Error::Dataset(e.to_string()))?;
            let path = entry.path();
            if !path.is_file() || !has_image_extension(path) {
                continue;
            }
            let file_name = match path.file_name() {
                Some(name) => name,
                None => continue,
            };
            let mask = masks_dir.join(file_name);
            if !mask.is_file() {
                return Err(Error::Dataset(format!(
                    "missing mask for {}: expected {}",
                    path.display(),
                    mask.display()
                )));
            }
            pairs.push(ImagePair {
                image: path.to_path_buf(),
                mask,
            });
        }
        pairs.sort_by(|a, b| a.image.cmp(&b.image));
        debug!("Found {} image pairs in {}", pairs.len(), images_dir.display());
        Ok(pairs)
    }

    pub fn split_pairs(&self, split: Split) -> Result<Vec<ImagePair>> {
        Self::list_pairs(&self.layout.images_dir(split), &self.layout.masks_dir(split))
    }

    pub fn raw_pairs(&self) -> Result<Vec<ImagePair>> {
        Self::list_pairs(&self.layout.raw_images_dir(), &self.layout.raw_labels_dir())
    }

    /// Training records per epoch: one per pre-cropped record, or
    /// `crops_per_image` per raw image for the raw crop dataset.
    pub fn count_training_records(&self, config: &ExperimentConfig) -> Result<usize> {
        if config.is_raw_crop_dataset() {
            Ok(self.raw_pairs()?.len() * config.data.crops_per_image)
        } else {
            Ok(self.split_pairs(Split::Train)?.len())
        }
    }

    /// Builds the sample source for one data worker.
    pub fn training_source(
        &self,
        config: &ExperimentConfig,
        worker: usize,
        num_workers: usize,
    ) -> Result<Box<dyn SampleSource>> {
        let seed = config.seed.wrapping_add(worker as u64 + 1);
        if config.is_raw_crop_dataset() {
            let pairs = shard(self.raw_pairs()?, worker, num_workers);
            Ok(Box::new(RandomCropSource::new(
                pairs,
                self.size,
                config.data.raw_scale,
                self.preprocessor,
                seed,
            )?))
        } else {
            let pairs = shard(self.split_pairs(Split::Train)?, worker, num_workers);
            Ok(Box::new(RecordSource::new(pairs, self.size, self.preprocessor, seed)?))
        }
    }
}

impl SplitSource for ImagePairLoader {
    fn load_split(&self, split: Split) -> Result<Vec<Sample>> {
        let pairs = self.split_pairs(split)?;
        let mut samples = Vec::with_capacity(pairs.len());
        for pair in &pairs {
            samples.push(load_centered(pair, self.size, &self.preprocessor)?);
        }
        info!("Loaded {} {} samples", samples.len(), split.dir_name());
        Ok(samples)
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Every `num_workers`-th pair starting at `worker`. Falls back to the full
/// list when the shard would be empty.
fn shard(pairs: Vec<ImagePair>, worker: usize, num_workers: usize) -> Vec<ImagePair> {
    let num_workers = num_workers.max(1);
    let subset: Vec<ImagePair> = pairs
        .iter()
        .skip(worker % num_workers)
        .step_by(num_workers)
        .cloned()
        .collect();
    if subset.is_empty() {
        pairs
    } else {
        subset
    }
}

fn open_image(path: &Path) -> Result<DynamicImage> {
    if !path.exists() {
        return Err(Error::NotFound(format!("Image file not found: {}", path.display())));
    }
    image::open(path)
        .map_err(|e| Error::Image(format!("Failed to load image {}: {}", path.display(), e)))
}

fn load_centered(pair: &ImagePair, size: usize, preprocessor: &Preprocessor) -> Result<Sample> {
    let image = image_to_gray(&open_image(&pair.image)?);
    let mask = image_to_mask(&open_image(&pair.mask)?);
    if image.dimensions() != mask.dimensions() {
        return Err(Error::Dataset(format!(
            "{} is {}x{} but its mask is {}x{}",
            pair.image.display(),
            image.width(),
            image.height(),
            mask.width(),
            mask.height()
        )));
    }
    let (mut pixels, label) = center_crop_pair(&image, &mask, size)?;
    preprocessor.apply(&mut pixels);
    Sample::new(pixels, label, size)
}

fn ensure_not_empty(pairs: &[ImagePair]) -> Result<()> {
    if pairs.is_empty() {
        return Err(Error::Dataset("no training images found".to_string()));
    }
    Ok(())
}

/// Cycles through samples that are already in memory.
pub struct InMemorySource {
    samples: Vec<Sample>,
    cursor: usize,
}

impl InMemorySource {
    pub fn new(samples: Vec<Sample>) -> Result<Self> {
        if samples.is_empty() {
            return Err(Error::Dataset("in-memory source needs at least one sample".to_string()));
        }
        Ok(Self { samples, cursor: 0 })
    }
}

impl SampleSource for InMemorySource {
    fn next_sample(&mut self) -> Result<Sample> {
        let sample = self.samples[self.cursor % self.samples.len()].clone();
        self.cursor = self.cursor.wrapping_add(1);
        Ok(sample)
    }
}

/// Cycles through pre-cropped records, reshuffling on every pass.
pub struct RecordSource {
    pairs: Vec<ImagePair>,
    order: Vec<usize>,
    cursor: usize,
    size: usize,
    preprocessor: Preprocessor,
    rng: ChaCha8Rng,
}

impl RecordSource {
    pub fn new(pairs: Vec<ImagePair>, size: usize, preprocessor: Preprocessor, seed: u64) -> Result<Self> {
        ensure_not_empty(&pairs)?;
        let order = (0..pairs.len()).collect();
        Ok(Self {
            pairs,
            order,
            cursor: usize::MAX,
            size,
            preprocessor,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    fn next_index(&mut self) -> usize {
        if self.cursor >= self.order.len() {
            self.order.shuffle(&mut self.rng);
            self.cursor = 0;
        }
        let idx = self.order[self.cursor];
        self.cursor += 1;
        idx
    }
}

impl SampleSource for RecordSource {
    fn next_sample(&mut self) -> Result<Sample> {
        let idx = self.next_index();
        load_centered(&self.pairs[idx], self.size, &self.preprocessor)
    }
}

/// Draws random crops from rescaled raw images.
pub struct RandomCropSource {
    pairs: Vec<ImagePair>,
    size: usize,
    scale: f32,
    preprocessor: Preprocessor,
    rng: ChaCha8Rng,
}

impl RandomCropSource {
    pub fn new(
        pairs: Vec<ImagePair>,
        size: usize,
        scale: f32,
        preprocessor: Preprocessor,
        seed: u64,
    ) -> Result<Self> {
        ensure_not_empty(&pairs)?;
        Ok(Self {
            pairs,
            size,
            scale,
            preprocessor,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }
}

impl SampleSource for RandomCropSource {
    fn next_sample(&mut self) -> Result<Sample> {
        let pair = match self.pairs.choose(&mut self.rng) {
            Some(pair) => pair.clone(),
            None => return Err(Error::Dataset("no training images found".to_string())),
        };
        let image = open_image(&pair.image)?;
        let mask = open_image(&pair.mask)?;
        let (image, mask) = rescale_pair(&image, &mask, self.scale);
        let image = image_to_gray(&image);
        let mask = image_to_mask(&mask);
        let (mut crop, label) = random_crop_pair(&image, &mask, self.size, &mut self.rng)?;
        self.preprocessor.apply(&mut crop);
        Sample::new(crop, label, self.size)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::write_pairs;
    use super::*;
    use tempfile::TempDir;

    fn layout_with_split(dir: &TempDir, split: Split, count: usize, side: u32) -> DatasetLayout {
        let layout = DatasetLayout::new(dir.path(), 12);
        write_pairs(&layout.images_dir(split), &layout.masks_dir(split), count, side);
        layout
    }

    #[test]
    fn test_layout_paths() {
        let layout = DatasetLayout::new("data", 12);
        assert_eq!(layout.images_dir(Split::Validation), PathBuf::from("data/12/validation/images"));
        assert_eq!(layout.masks_dir(Split::Test), PathBuf::from("data/12/test/masks"));
        assert_eq!(layout.raw_labels_dir(), PathBuf::from("data/train_labels"));
    }

    #[test]
    fn test_list_pairs_missing_dir() {
        let result = ImagePairLoader::list_pairs(Path::new("/nonexistent/images"), Path::new("/nonexistent/masks"));
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_list_pairs_missing_mask() {
        let dir = TempDir::new().unwrap();
        let layout = layout_with_split(&dir, Split::Train, 2, 16);
        std::fs::remove_file(layout.masks_dir(Split::Train).join("img_001.png")).unwrap();
        let result = ImagePairLoader::list_pairs(&layout.images_dir(Split::Train), &layout.masks_dir(Split::Train));
        assert!(matches!(result, Err(Error::Dataset(_))));
    }

    #[test]
    fn test_load_split_center_crops() {
        let dir = TempDir::new().unwrap();
        let layout = layout_with_split(&dir, Split::Validation, 3, 16);
        let loader = ImagePairLoader::new(layout, 12, Preprocessor::default());
        let samples = loader.load_split(Split::Validation).unwrap();
        assert_eq!(samples.len(), 3);
        for sample in &samples {
            assert_eq!(sample.size, 12);
            assert_eq!(sample.image.len(), 144);
            for (v, l) in sample.image.iter().zip(sample.label.iter()) {
                assert_eq!(*v > 100.0, *l == 1);
            }
        }
    }

    #[test]
    fn test_record_source_cycles() {
        let dir = TempDir::new().unwrap();
        let layout = layout_with_split(&dir, Split::Train, 2, 8);
        let loader = ImagePairLoader::new(layout, 8, Preprocessor::default());
        let pairs = loader.split_pairs(Split::Train).unwrap();
        let mut source = RecordSource::new(pairs, 8, Preprocessor::default(), 1).unwrap();
        for _ in 0..5 {
            let sample = source.next_sample().unwrap();
            assert_eq!(sample.positive_pixels(), 16);
        }
    }

    #[test]
    fn test_random_crop_source() {
        let dir = TempDir::new().unwrap();
        let layout = DatasetLayout::new(dir.path(), 100);
        write_pairs(&layout.raw_images_dir(), &layout.raw_labels_dir(), 2, 20);
        let loader = ImagePairLoader::new(layout, 8, Preprocessor::default());
        let mut source = RandomCropSource::new(loader.raw_pairs().unwrap(), 8, 1.0, Preprocessor::default(), 4).unwrap();
        for _ in 0..4 {
            let sample = source.next_sample().unwrap();
            assert_eq!(sample.image.len(), 64);
            for (v, l) in sample.image.iter().zip(sample.label.iter()) {
                assert_eq!(*v > 100.0, *l == 1);
            }
        }
    }

    #[test]
    fn test_count_training_records() {
        let dir = TempDir::new().unwrap();
        let mut config = ExperimentConfig::default();
        config.data.data_dir = dir.path().to_path_buf();

        let layout = DatasetLayout::new(dir.path(), 12);
        write_pairs(&layout.images_dir(Split::Train), &layout.masks_dir(Split::Train), 5, 8);
        let loader = ImagePairLoader::from_config(&config);
        assert_eq!(loader.count_training_records(&config).unwrap(), 5);

        config.run.dataset = 100;
        let raw = DatasetLayout::new(dir.path(), 100);
        write_pairs(&raw.raw_images_dir(), &raw.raw_labels_dir(), 4, 8);
        let loader = ImagePairLoader::from_config(&config);
        assert_eq!(loader.count_training_records(&config).unwrap(), 12);
    }

    #[test]
    fn test_shard() {
        let pairs: Vec<ImagePair> = (0..5)
            .map(|i| ImagePair {
                image: PathBuf::from(format!("{i}.png")),
                mask: PathBuf::from(format!("{i}.png")),
            })
            .collect();
        assert_eq!(shard(pairs.clone(), 1, 2).len(), 2);
        assert_eq!(shard(pairs.clone(), 0, 2).len(), 3);
        assert_eq!(shard(pairs[..1].to_vec(), 3, 6).len(), 1);
    }
}
