//! Training infrastructure for the segmentation network.
//!
//! This crate provides:
//! - Declarative architecture description and the burn network built from it
//! - Class-weighted cross-entropy with L2 regularization
//! - Adam steps over all parameters or the decoder side only
//! - Checkpoint registry and cross-architecture weight transfer
//! - CSV/PNG summaries and the training orchestrator

pub mod architecture;
pub mod backend;
pub mod checkpoint;
pub mod evaluator;
pub mod init;
pub mod loss;
pub mod lr_schedule;
pub mod model;
pub mod optim;
pub mod summary;
pub mod trainer;
pub mod transfer;

pub use architecture::{ArchitectureSpec, ConvSpec, DecoderStep, PoolSpec, StageSpec, TransposeSpec};
pub use backend::{InferenceBackend, TrainingBackend};
pub use checkpoint::{CheckpointMetadata, CheckpointRegistry, FileCheckpointRegistry, InitPlan};
pub use evaluator::{Evaluator, SplitEvaluation};
pub use loss::{total_loss, weighted_cross_entropy};
pub use lr_schedule::ExponentialDecay;
pub use model::{SegNet, SegNetConfig};
pub use optim::{train_step, ParamScope};
pub use summary::SummaryWriter;
pub use trainer::{Phase, RunReport, TestReport, Trainer, TrainingData};
pub use transfer::{TransferMap, TransferPlan};

/// Re-export commonly used types
pub mod prelude {
    pub use super::architecture::ArchitectureSpec;
    pub use super::checkpoint::{FileCheckpointRegistry, InitPlan};
    pub use super::evaluator::Evaluator;
    pub use super::model::{SegNet, SegNetConfig};
    pub use super::trainer::{Trainer, TrainingData};
    pub use super::transfer::TransferMap;
}
