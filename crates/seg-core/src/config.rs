//! Configuration for a single segmentation experiment.
//!
//! The whole run is described by one immutable [`ExperimentConfig`]. It is
//! built once (defaults, optional TOML file, CLI overrides), validated, and
//! then handed by reference to every component constructor.

use crate::types::{Action, LabelMode};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Version string of the network layout, embedded in model names.
pub const ARCHITECTURE_VERSION: &str = "3.9.3.01";

/// Dataset id that reads raw images and slices random crops.
pub const RAW_CROP_DATASET: u32 = 100;

/// Main configuration for an experiment run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExperimentConfig {
    /// What to run and how to name it
    pub run: RunConfig,
    /// Network hyperparameters
    pub model: ModelParams,
    /// Optimization hyperparameters
    pub training: TrainingParams,
    /// Data pipeline configuration
    pub data: DataConfig,
    /// Decision thresholds for metrics
    pub evaluation: EvaluationConfig,
    /// Checkpoint and log locations
    pub output: OutputConfig,
    /// Random seed for the backend and data workers
    pub seed: u64,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            run: RunConfig::default(),
            model: ModelParams::default(),
            training: TrainingParams::default(),
            data: DataConfig::default(),
            evaluation: EvaluationConfig::default(),
            output: OutputConfig::default(),
            seed: 42,
        }
    }
}

impl ExperimentConfig {
    /// Deterministic name used for checkpoints and log directories.
    pub fn model_name(&self) -> String {
        format!(
            "model_s{}{}.{}{}",
            ARCHITECTURE_VERSION,
            self.run.label.code(),
            self.run.dataset,
            self.run.version
        )
    }

    /// Base learning rate before decay. Lower when only part of the network
    /// is trained.
    pub fn starting_learning_rate(&self) -> f64 {
        if self.training.freeze || self.training.stop_gradient {
            self.training.transfer_learning_rate
        } else {
            self.training.base_learning_rate
        }
    }

    /// Predicted-positive pixel count an image must exceed to be called positive.
    pub fn image_positive_threshold(&self) -> usize {
        let pixels = self.model.size * self.model.size;
        pixels.div_ceil(self.evaluation.image_threshold_divisor)
    }

    pub fn is_raw_crop_dataset(&self) -> bool {
        self.run.dataset == RAW_CROP_DATASET
    }

    /// Training steps per epoch for a given number of records.
    pub fn steps_per_epoch(&self, total_records: usize) -> usize {
        let steps = total_records / self.training.batch_size;
        if self.training.freeze {
            // one extra full-parameter step is taken before each checkpoint
            steps.saturating_sub(1)
        } else {
            steps
        }
    }

    pub fn train_log_dir(&self) -> PathBuf {
        self.output.log_dir.join(format!("tr_{}", self.model_name()))
    }

    pub fn test_log_dir(&self) -> PathBuf {
        self.output.log_dir.join(format!("te_{}", self.model_name()))
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        let size = self.model.size;
        if size < 64 || size % 8 != 0 {
            return Err(Error::Config(format!(
                "crop size must be a multiple of 8 and at least 64, got {}",
                size
            )));
        }
        if self.training.batch_size == 0 {
            return Err(Error::Config("batch size must be positive".to_string()));
        }
        if self.training.positive_weight <= 0.0 {
            return Err(Error::Config(format!(
                "positive class weight must be positive, got {}",
                self.training.positive_weight
            )));
        }
        if !(0.0..1.0).contains(&self.evaluation.threshold) {
            return Err(Error::Config(format!(
                "decision threshold must lie in [0, 1), got {}",
                self.evaluation.threshold
            )));
        }
        if self.evaluation.image_threshold_divisor == 0 {
            return Err(Error::Config("image threshold divisor must be positive".to_string()));
        }
        if !(0.0..1.0).contains(&self.model.pool_dropout) {
            return Err(Error::Config(format!(
                "dropout rate must lie in [0, 1), got {}",
                self.model.pool_dropout
            )));
        }
        if self.training.epochs_per_decay == 0 || self.training.checkpoint_every == 0 {
            return Err(Error::Config(
                "epochs_per_decay and checkpoint_every must be positive".to_string(),
            ));
        }
        self.data.queue.validate()?;
        Ok(())
    }
}

/// Run selection and naming
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    /// Number of training epochs
    pub epochs: usize,
    /// Dataset id
    pub dataset: u32,
    /// Annotation interpretation
    pub label: LabelMode,
    /// Train or evaluate only
    pub action: Action,
    /// Suffix appended to the model name
    pub version: String,
    /// Model to transfer weights from
    pub init_model: Option<String>,
    /// Model to restore and continue
    pub restore_model: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            epochs: 30,
            dataset: 12,
            label: LabelMode::Mask,
            action: Action::Train,
            version: String::new(),
            init_model: None,
            restore_model: None,
        }
    }
}

/// Network hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelParams {
    /// Square crop size fed to the network
    pub size: usize,
    /// Batch norm epsilon
    pub bn_epsilon: f64,
    /// Batch norm moving-average decay (fraction of the old value kept)
    pub bn_decay: f64,
    /// L2 penalty scale on regularized kernels
    pub l2_scale: f64,
    /// Dropout rate after pooling layers
    pub pool_dropout: f64,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            size: 480,
            bn_epsilon: 1e-8,
            bn_decay: 0.99,
            l2_scale: 1e-5,
            pool_dropout: 0.1,
        }
    }
}

/// Optimization hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainingParams {
    pub batch_size: usize,
    /// Starting rate when the whole network is trained
    pub base_learning_rate: f64,
    /// Starting rate in freeze or stop-gradient mode
    pub transfer_learning_rate: f64,
    pub decay_factor: f64,
    pub epochs_per_decay: usize,
    pub staircase: bool,
    /// Cross-entropy weight of positive pixels
    pub positive_weight: f64,
    /// Only train the decoder, bottleneck and last encoder stage
    pub freeze: bool,
    /// Stop-gradient mode, lowers the starting rate
    pub stop_gradient: bool,
    /// Log streaming metrics every N steps
    pub log_every: usize,
    /// Checkpoint every N epochs
    pub checkpoint_every: usize,
    /// Print a progress line every N epochs
    pub print_every: usize,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            batch_size: 16,
            base_learning_rate: 0.001,
            transfer_learning_rate: 0.0001,
            decay_factor: 0.85,
            epochs_per_decay: 10,
            staircase: true,
            positive_weight: 15.0,
            freeze: false,
            stop_gradient: false,
            log_every: 50,
            checkpoint_every: 1,
            print_every: 5,
        }
    }
}

/// Data configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DataConfig {
    /// Root of all dataset directories
    pub data_dir: PathBuf,
    /// Random paired flips on training batches
    pub distort: bool,
    /// Contrast factor applied around the image mean, if any
    pub contrast: Option<f32>,
    /// Per-image standardization
    pub normalize: bool,
    /// Random crops drawn from each raw image per epoch
    pub crops_per_image: usize,
    /// Rescale factor applied to raw images before cropping
    pub raw_scale: f32,
    /// Shuffling queue parameters
    pub queue: QueueConfig,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            distort: false,
            contrast: None,
            normalize: false,
            crops_per_image: 3,
            raw_scale: 0.66,
            queue: QueueConfig::default(),
        }
    }
}

/// Shuffling queue sizes, expressed in batches
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity_batches: usize,
    pub min_after_dequeue_batches: usize,
    pub num_threads: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity_batches: 75,
            min_after_dequeue_batches: 30,
            num_threads: 6,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_threads == 0 {
            return Err(Error::Config("queue needs at least one worker thread".to_string()));
        }
        if self.min_after_dequeue_batches >= self.capacity_batches {
            return Err(Error::Config(format!(
                "queue capacity ({}) must exceed min_after_dequeue ({})",
                self.capacity_batches, self.min_after_dequeue_batches
            )));
        }
        Ok(())
    }
}

/// Decision thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Pixel is positive when its probability exceeds this
    pub threshold: f64,
    /// Image is positive when positive pixels exceed size^2 / divisor
    pub image_threshold_divisor: usize,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            image_threshold_divisor: 750,
        }
    }
}

/// Output locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    pub model_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Draw a progress bar over training steps
    pub show_progress: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("model"),
            log_dir: PathBuf::from("logs"),
            show_progress: false,
        }
    }
}
