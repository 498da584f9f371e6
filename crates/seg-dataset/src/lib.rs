//! Data pipeline for the segmentation experiment.
//!
//! Loads grayscale scans with their binary masks, crops and normalizes them,
//! and serves shuffled training batches from background worker threads.

pub mod augmentation;
pub mod batcher;
pub mod loader;
pub mod preprocess;
pub mod queue;
pub mod statistics;

pub use augmentation::{FlipConfig, PairedAugmenter};
pub use batcher::{batch_count, into_batches};
pub use loader::{
    DatasetLayout, ImagePair, ImagePairLoader, InMemorySource, RandomCropSource, RecordSource,
    SampleSource, SplitSource,
};
pub use preprocess::Preprocessor;
pub use queue::{BatchSource, Coordinator, FixedBatches, QueueOptions, ShuffleQueue};
pub use statistics::SplitStatistics;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::augmentation::*;
    pub use crate::batcher::*;
    pub use crate::loader::*;
    pub use crate::preprocess::*;
    pub use crate::queue::*;
    pub use crate::statistics::*;
}
