//! Checkpoint persistence and the start-up decision.
//!
//! A checkpoint is two files in the model directory:
//! - `<name>.ckpt.bin`: every parameter, full precision
//! - `<name>.ckpt.json`: [`CheckpointMetadata`]
//!
//! Both are overwritten in place on every save.

use burn::{
    module::Module,
    record::{BinFileRecorder, FullPrecisionSettings},
    tensor::backend::Backend,
};
use seg_core::{Error, LabelMode, Result, RunConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::architecture::ArchitectureSpec;
use crate::model::{SegNet, SegNetConfig};

/// Metadata stored next to the weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub model_name: String,
    pub global_step: u64,
    pub epoch: usize,
    pub architecture: ArchitectureSpec,
    pub label: LabelMode,
    pub num_classes: usize,
    pub dataset: u32,
    pub input_size: usize,
    pub timestamp: String,
}

impl CheckpointMetadata {
    pub fn new(
        model_name: impl Into<String>,
        global_step: u64,
        epoch: usize,
        architecture: ArchitectureSpec,
        label: LabelMode,
        dataset: u32,
        input_size: usize,
    ) -> Self {
        use chrono::Utc;
        Self {
            model_name: model_name.into(),
            global_step,
            epoch,
            architecture,
            label,
            num_classes: label.num_classes(),
            dataset,
            input_size,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Answers whether a named checkpoint is available.
pub trait CheckpointRegistry {
    fn contains(&self, name: &str) -> bool;
}

/// How the network gets its initial weights
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitPlan {
    /// Seeded initialization
    Fresh,
    /// Continue from a checkpoint, keeping its global step
    Restore { name: String },
    /// Copy the weights of another model, except its excluded layers, and
    /// start again from step 0
    Transfer { source: String },
}

impl InitPlan {
    /// Picks the initialization from the run settings. An init model takes
    /// precedence over a restore model, which takes precedence over the
    /// model's own previous checkpoint. Missing checkpoints fall through to
    /// [`InitPlan::Fresh`].
    pub fn decide(run: &RunConfig, own_name: &str, registry: &dyn CheckpointRegistry) -> Self {
        if let Some(init) = &run.init_model {
            return if registry.contains(init) {
                InitPlan::Transfer { source: init.clone() }
            } else {
                InitPlan::Fresh
            };
        }
        if let Some(restore) = &run.restore_model {
            return if registry.contains(restore) {
                InitPlan::Restore { name: restore.clone() }
            } else {
                InitPlan::Fresh
            };
        }
        if registry.contains(own_name) {
            InitPlan::Restore {
                name: own_name.to_string(),
            }
        } else {
            InitPlan::Fresh
        }
    }
}

/// Checkpoints stored as files in one directory
#[derive(Debug, Clone)]
pub struct FileCheckpointRegistry {
    model_dir: PathBuf,
}

impl FileCheckpointRegistry {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
        }
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    pub fn weights_path(&self, name: &str) -> PathBuf {
        self.model_dir.join(format!("{}.ckpt.bin", name))
    }

    pub fn metadata_path(&self, name: &str) -> PathBuf {
        self.model_dir.join(format!("{}.ckpt.json", name))
    }

    /// Writes weights and metadata under `metadata.model_name`.
    pub fn save<B: Backend>(&self, model: &SegNet<B>, metadata: &CheckpointMetadata) -> Result<()> {
        fs::create_dir_all(&self.model_dir)?;

        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        model
            .clone()
            .save_file(self.weights_path(&metadata.model_name), &recorder)
            .map_err(|e| Error::Checkpoint(format!("Failed to save weights: {}", e)))?;

        let json = serde_json::to_string_pretty(metadata)
            .map_err(|e| Error::Serialization(format!("Failed to serialize checkpoint metadata: {}", e)))?;
        fs::write(self.metadata_path(&metadata.model_name), json)?;

        info!(
            "Checkpoint {} saved at step {} to {:?}",
            metadata.model_name, metadata.global_step, self.model_dir
        );
        Ok(())
    }

    pub fn load_metadata(&self, name: &str) -> Result<CheckpointMetadata> {
        let path = self.metadata_path(name);
        if !path.exists() {
            return Err(Error::NotFound(format!("checkpoint metadata not found: {}", path.display())));
        }
        let json = fs::read_to_string(&path)?;
        serde_json::from_str(&json)
            .map_err(|e| Error::Serialization(format!("Failed to deserialize checkpoint metadata: {}", e)))
    }

    /// Loads the weights of `name` into `model`, which must have been built
    /// from the same architecture.
    pub fn load_into<B: Backend>(
        &self,
        name: &str,
        model: SegNet<B>,
        device: &B::Device,
    ) -> Result<(SegNet<B>, CheckpointMetadata)> {
        let metadata = self.load_metadata(name)?;
        if &metadata.architecture != model.architecture() {
            return Err(Error::Checkpoint(format!(
                "checkpoint {} was saved with architecture {} which does not match the model",
                name, metadata.architecture.version
            )));
        }
        let weights = self.weights_path(name);
        if !weights.exists() {
            return Err(Error::NotFound(format!("checkpoint weights not found: {}", weights.display())));
        }
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        let model = model
            .load_file(weights, &recorder, device)
            .map_err(|e| Error::Checkpoint(format!("Failed to load weights of {}: {}", name, e)))?;
        info!("Restored {} at step {}", name, metadata.global_step);
        Ok((model, metadata))
    }

    /// Rebuilds a checkpointed network from its stored architecture.
    pub fn load_model<B: Backend>(
        &self,
        name: &str,
        template: &SegNetConfig,
        device: &B::Device,
    ) -> Result<(SegNet<B>, CheckpointMetadata)> {
        let metadata = self.load_metadata(name)?;
        let config = SegNetConfig {
            architecture: metadata.architecture.clone(),
            size: metadata.input_size,
            ..template.clone()
        };
        let model = config.init::<B>(device)?;
        self.load_into(name, model, device)
    }
}

impl CheckpointRegistry for FileCheckpointRegistry {
    fn contains(&self, name: &str) -> bool {
        self.weights_path(name).is_file() && self.metadata_path(name).is_file()
    }
}
