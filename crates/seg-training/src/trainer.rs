//! Training orchestrator.
//!
//! A run walks an explicit state machine:
//!
//! ```text
//! Init -> TrainSteps(e) -> [Checkpoint(e)] -> Validate(e) -> TrainSteps(e + 1) ...
//!      -> FinalTest -> Done
//! ```
//!
//! The orchestrator owns the model, the optimizer and the summary writers.
//! Batches come from a [`BatchSource`], which is shut down before the final
//! test.

use burn::{
    module::AutodiffModule,
    tensor::backend::AutodiffBackend,
};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use seg_core::{
    mean, Action, Batch, EpochRecord, Error, ExperimentConfig, Result, StreamingMetrics, TrainingHistory,
};
use seg_dataset::BatchSource;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::architecture::ArchitectureSpec;
use crate::checkpoint::{CheckpointMetadata, FileCheckpointRegistry, InitPlan};
use crate::evaluator::{threshold_predictions, Evaluator, SplitEvaluation};
use crate::lr_schedule::ExponentialDecay;
use crate::model::{SegNet, SegNetConfig};
use crate::optim::{adam_config, train_step, ParamScope};
use crate::summary::SummaryWriter;
use crate::transfer::TransferMap;

/// Orchestrator state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    TrainSteps { epoch: usize },
    Checkpoint { epoch: usize },
    Validate { epoch: usize },
    FinalTest,
    Done,
}

impl Phase {
    /// Transition taken once the current phase has completed.
    pub fn next(self, config: &ExperimentConfig) -> Phase {
        let epochs = config.run.epochs;
        match self {
            Phase::Init => {
                if config.run.action == Action::Train && epochs > 0 {
                    Phase::TrainSteps { epoch: 0 }
                } else {
                    Phase::FinalTest
                }
            }
            Phase::TrainSteps { epoch } => {
                if epoch % config.training.checkpoint_every == 0 {
                    Phase::Checkpoint { epoch }
                } else {
                    Phase::Validate { epoch }
                }
            }
            Phase::Checkpoint { epoch } => Phase::Validate { epoch },
            Phase::Validate { epoch } => {
                if epoch + 1 < epochs {
                    Phase::TrainSteps { epoch: epoch + 1 }
                } else {
                    Phase::FinalTest
                }
            }
            Phase::FinalTest | Phase::Done => Phase::Done,
        }
    }
}

/// Everything the orchestrator reads data from.
pub struct TrainingData<Q: BatchSource> {
    /// Endless stream of training batches
    pub train: Q,
    /// Training records per epoch, before batching
    pub total_records: usize,
    pub validation: Vec<Batch>,
    pub test: Vec<Batch>,
}

/// Outcome of the final test pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    pub evaluation: SplitEvaluation,
    /// Thresholded predictions, in batch order
    pub predictions: Vec<u8>,
    /// Labels matching `predictions`
    pub ground_truth: Vec<u8>,
}

/// Summary of a finished run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub model_name: String,
    pub init: InitPlan,
    pub global_step: u64,
    pub steps_per_epoch: usize,
    pub history: TrainingHistory,
    pub test: TestReport,
}

/// Mutable state carried between training phases.
struct EpochState {
    global_step: u64,
    train_accuracies: Vec<f64>,
    train_losses: Vec<f64>,
    /// Streaming training metrics, reset at the start of every epoch
    train_metrics: StreamingMetrics,
}

/// Drives one experiment from initialization to the final test.
pub struct Trainer<B: AutodiffBackend> {
    config: ExperimentConfig,
    architecture: ArchitectureSpec,
    registry: FileCheckpointRegistry,
    transfers: TransferMap,
    device: B::Device,
}

impl<B: AutodiffBackend> Trainer<B> {
    /// Fails when the configuration does not validate.
    pub fn new(config: ExperimentConfig, architecture: ArchitectureSpec, device: B::Device) -> Result<Self> {
        config.validate()?;
        let registry = FileCheckpointRegistry::new(config.output.model_dir.clone());
        Ok(Self {
            config,
            architecture,
            registry,
            transfers: TransferMap::with_defaults(),
            device,
        })
    }

    pub fn with_registry(mut self, registry: FileCheckpointRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_transfers(mut self, transfers: TransferMap) -> Self {
        self.transfers = transfers;
        self
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn registry(&self) -> &FileCheckpointRegistry {
        &self.registry
    }

    /// Builds the initial network according to [`InitPlan::decide`].
    ///
    /// Returns the model with the global step to continue from.
    pub fn initialize(&self) -> Result<(SegNet<B>, u64, InitPlan)> {
        B::seed(self.config.seed);

        let own_name = self.config.model_name();
        let plan = InitPlan::decide(&self.config.run, &own_name, &self.registry);
        let template = SegNetConfig::from_experiment(&self.config, self.architecture.clone());

        let (model, global_step) = match &plan {
            InitPlan::Fresh => {
                if let Some(name) = self.config.run.init_model.as_ref().or(self.config.run.restore_model.as_ref()) {
                    warn!("Checkpoint {} not found in {:?}, initializing from scratch", name, self.registry.model_dir());
                } else {
                    info!("No checkpoint for {}, initializing from scratch", own_name);
                }
                (template.init::<B>(&self.device)?, 0)
            }
            InitPlan::Restore { name } => {
                let fresh = template.init::<B>(&self.device)?;
                let (model, metadata) = self.registry.load_into(name, fresh, &self.device)?;
                (model, metadata.global_step)
            }
            InitPlan::Transfer { source } => {
                let (source_model, metadata) = self.registry.load_model::<B>(source, &template, &self.device)?;
                let transfer = self.transfers.plan(&metadata.architecture, &self.architecture)?;
                let model = transfer.apply(&source_model, template.init::<B>(&self.device)?)?;
                info!("Initialized from {} (global step reset to 0)", source);
                (model, 0)
            }
        };

        Ok((model, global_step, plan))
    }

    /// Runs the whole experiment.
    pub fn run<Q: BatchSource>(&self, mut data: TrainingData<Q>) -> Result<RunReport> {
        let config = &self.config;
        let own_name = config.model_name();
        let training = config.run.action == Action::Train && config.run.epochs > 0;

        if training && data.total_records < config.training.batch_size {
            return Err(Error::Training(format!(
                "{} training records cannot fill a batch of {}",
                data.total_records, config.training.batch_size
            )));
        }
        let steps_per_epoch = config.steps_per_epoch(data.total_records);
        let schedule = ExponentialDecay::from_config(config, steps_per_epoch);
        let evaluator = Evaluator::new(config.evaluation.threshold, config.training.positive_weight);
        let mut optimizer = adam_config().init::<B, SegNet<B>>();

        let mut train_writer = SummaryWriter::new(config.train_log_dir())?;
        let mut test_writer = SummaryWriter::new(config.test_log_dir())?;
        let mut history = TrainingHistory::new();

        let (mut model, global_step, init) = self.initialize()?;
        let mut state = EpochState {
            global_step,
            train_accuracies: Vec::new(),
            train_losses: Vec::new(),
            train_metrics: StreamingMetrics::new(config.image_positive_threshold()),
        };
        let mut test_report = None;

        let mut phase = Phase::Init;
        while phase != Phase::Done {
            debug!("Entering phase {:?}", phase);
            match phase {
                Phase::Init => {
                    info!(
                        "{}: {} steps per epoch, starting at global step {}",
                        own_name, steps_per_epoch, state.global_step
                    );
                }
                Phase::TrainSteps { epoch } => {
                    model = self.train_epoch(
                        model,
                        &mut optimizer,
                        &mut data.train,
                        epoch,
                        steps_per_epoch,
                        &schedule,
                        &mut state,
                        &mut train_writer,
                    )?;
                }
                Phase::Checkpoint { epoch } => {
                    if config.training.freeze {
                        // one step over every parameter before saving
                        let batch = data.train.next_batch()?;
                        let lr = schedule.learning_rate(state.global_step);
                        let out = train_step(
                            model,
                            &mut optimizer,
                            &batch,
                            config.training.positive_weight,
                            lr,
                            ParamScope::All,
                            &self.device,
                        );
                        model = out.model;
                        state.global_step += 1;
                    }
                    let metadata = CheckpointMetadata::new(
                        own_name.clone(),
                        state.global_step,
                        epoch,
                        self.architecture.clone(),
                        config.run.label,
                        config.run.dataset,
                        config.model.size,
                    );
                    self.registry.save(&model, &metadata)?;
                }
                Phase::Validate { epoch } => {
                    let record = self.validate(&model, &data.validation, &evaluator, epoch, &schedule, &state, &mut test_writer)?;
                    if config.training.print_every > 0 && epoch % config.training.print_every == 0 {
                        let line = format!(
                            "Epoch {:02} - step {} - cv acc: {:.4} - train acc: {:.3} (mean)",
                            epoch, record.global_step, record.valid_accuracy, record.train_accuracy
                        );
                        println!("{}", line.cyan());
                    }
                    history.push(record);
                }
                Phase::FinalTest => {
                    data.train.shutdown()?;
                    let report = self.final_test(&model, &data.test, &evaluator, state.global_step, &mut test_writer)?;
                    history.export_csv(&config.train_log_dir().join("history.csv"))?;
                    test_report = Some(report);
                }
                Phase::Done => {}
            }
            phase = phase.next(config);
        }

        train_writer.flush()?;
        test_writer.flush()?;

        let test = test_report.ok_or_else(|| Error::Training("run finished without a test pass".to_string()))?;
        Ok(RunReport {
            model_name: own_name,
            init,
            global_step: state.global_step,
            steps_per_epoch,
            history,
            test,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn train_epoch<Q, O>(
        &self,
        mut model: SegNet<B>,
        optimizer: &mut O,
        source: &mut Q,
        epoch: usize,
        steps: usize,
        schedule: &ExponentialDecay,
        state: &mut EpochState,
        writer: &mut SummaryWriter,
    ) -> Result<SegNet<B>>
    where
        Q: BatchSource,
        O: burn::optim::Optimizer<SegNet<B>, B>,
    {
        let config = &self.config;
        let scope = ParamScope::from_config(config);
        let log_every = config.training.log_every;
        state.train_metrics.reset();
        state.train_accuracies.clear();
        state.train_losses.clear();

        let progress = self.progress_bar(steps, epoch);
        for i in 0..steps {
            let batch = source.next_batch()?;
            let lr = schedule.learning_rate(state.global_step);
            let out = train_step(
                model,
                optimizer,
                &batch,
                config.training.positive_weight,
                lr,
                scope,
                &self.device,
            );
            model = out.model;
            state.global_step += 1;
            state.train_losses.push(out.loss);

            let probabilities: Vec<f32> = out.probabilities.into_data().iter::<f32>().collect();
            let predictions = threshold_predictions(&probabilities, config.evaluation.threshold);
            state
                .train_metrics
                .update(&predictions, &batch.labels, batch.size * batch.size);

            if log_every > 0 && i % log_every == 0 && i != 0 {
                let snapshot = state.train_metrics.snapshot();
                state.train_accuracies.push(snapshot.accuracy);

                writer.add_scalars(snapshot.scalars(), state.global_step)?;
                writer.add_scalar("cross_entropy", out.cross_entropy, state.global_step)?;
                writer.add_scalar("learning_rate", lr, state.global_step)?;
                debug!(
                    "step {}: loss {:.4}, accuracy {:.4}, lr {:.6}",
                    state.global_step, out.loss, snapshot.accuracy, lr
                );
            }

            if i + 1 == steps {
                if let Some(kernels) = model.first_layer_kernels() {
                    let shape = kernels.dims();
                    let values: Vec<f32> = kernels.into_data().iter::<f32>().collect();
                    writer.write_kernel_image(&values, shape, state.global_step)?;
                }
            }
            progress.inc(1);
        }
        progress.finish_and_clear();
        writer.flush()?;

        info!(
            "Epoch {} finished at step {}, mean loss {:.4}",
            epoch,
            state.global_step,
            mean(&state.train_losses)
        );
        Ok(model)
    }

    #[allow(clippy::too_many_arguments)]
    fn validate(
        &self,
        model: &SegNet<B>,
        batches: &[Batch],
        evaluator: &Evaluator,
        epoch: usize,
        schedule: &ExponentialDecay,
        state: &EpochState,
        writer: &mut SummaryWriter,
    ) -> Result<EpochRecord> {
        if batches.is_empty() {
            warn!("Validation split is empty, epoch {} metrics will be NaN", epoch);
        }
        let inference = model.valid();
        let mut metrics = StreamingMetrics::new(self.config.image_positive_threshold());
        let evaluation = evaluator.evaluate_split(&inference, batches, &mut metrics, &self.device);

        writer.add_scalars(evaluation.metrics.scalars(), state.global_step)?;
        writer.add_scalar("cross_entropy", evaluation.mean_cross_entropy, state.global_step)?;
        writer.flush()?;

        Ok(EpochRecord {
            epoch,
            global_step: state.global_step,
            train_accuracy: mean(&state.train_accuracies),
            train_loss: mean(&state.train_losses),
            valid_accuracy: evaluation.metrics.accuracy,
            valid_loss: evaluation.mean_cross_entropy,
            valid_recall: evaluation.metrics.recall,
            learning_rate: schedule.learning_rate(state.global_step),
        })
    }

    fn final_test(
        &self,
        model: &SegNet<B>,
        batches: &[Batch],
        evaluator: &Evaluator,
        global_step: u64,
        writer: &mut SummaryWriter,
    ) -> Result<TestReport> {
        let inference = model.valid();
        let mut metrics = StreamingMetrics::new(self.config.image_positive_threshold());
        let mut predictions = Vec::new();
        let mut ground_truth = Vec::new();
        let evaluation =
            evaluator.evaluate_split_with(&inference, batches, &mut metrics, &self.device, |batch, outcome| {
                predictions.extend(outcome.predictions);
                ground_truth.extend_from_slice(&batch.labels);
            });

        let accuracy = evaluation.mean_batch_accuracy();
        let recall = evaluation.mean_batch_recall();
        writer.add_scalar("final_test_accuracy", accuracy, global_step)?;
        writer.add_scalar("final_test_recall", recall, global_step)?;
        writer.flush()?;

        println!(
            "{} accuracy {:.4} - recall {:.4} over {} images",
            "Test (mean):".green().bold(),
            accuracy,
            recall,
            evaluation.num_images
        );

        Ok(TestReport {
            evaluation,
            predictions,
            ground_truth,
        })
    }

    fn progress_bar(&self, steps: usize, epoch: usize) -> ProgressBar {
        if !self.config.output.show_progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(steps as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} steps {msg}")
        {
            bar.set_style(style.progress_chars("=>-"));
        }
        bar.set_message(format!("epoch {}", epoch));
        bar
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_support::small_config;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use seg_core::Sample;
    use seg_dataset::{into_batches, FixedBatches};
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn samples(n: usize, size: usize) -> Vec<Sample> {
        (0..n)
            .map(|i| {
                let image: Vec<f32> = (0..size * size).map(|p| ((p * (i + 1)) % 11) as f32 / 11.0).collect();
                let label: Vec<u8> = (0..size * size).map(|p| ((p / size) < size / 4) as u8).collect();
                Sample::new(image, label, size).unwrap()
            })
            .collect()
    }

    fn tiny_config(dir: &TempDir) -> ExperimentConfig {
        let mut config = ExperimentConfig::default();
        config.model.size = 64;
        config.run.epochs = 2;
        config.training.batch_size = 2;
        config.training.log_every = 1;
        config.training.print_every = 1;
        config.output.model_dir = dir.path().join("model");
        config.output.log_dir = dir.path().join("logs");
        config
    }

    fn tiny_data(n: usize) -> TrainingData<FixedBatches> {
        let all = samples(n, 64);
        TrainingData {
            train: FixedBatches::new(into_batches(&all, 2).unwrap()).unwrap(),
            total_records: n,
            validation: into_batches(&all[..2], 2).unwrap(),
            test: into_batches(&all[..3], 2).unwrap(),
        }
    }

    fn trainer(config: ExperimentConfig) -> Trainer<TestBackend> {
        let architecture = small_config().architecture;
        Trainer::new(config, architecture, Default::default()).unwrap()
    }

    #[test]
    fn test_phase_transitions() {
        let mut config = ExperimentConfig::default();
        config.run.epochs = 2;
        config.training.checkpoint_every = 2;

        let mut phase = Phase::Init;
        let mut visited = vec![phase];
        while phase != Phase::Done {
            phase = phase.next(&config);
            visited.push(phase);
        }
        assert_eq!(
            visited,
            vec![
                Phase::Init,
                Phase::TrainSteps { epoch: 0 },
                Phase::Checkpoint { epoch: 0 },
                Phase::Validate { epoch: 0 },
                Phase::TrainSteps { epoch: 1 },
                Phase::Validate { epoch: 1 },
                Phase::FinalTest,
                Phase::Done,
            ]
        );
    }

    #[test]
    fn test_evaluate_action_skips_training() {
        let mut config = ExperimentConfig::default();
        config.run.action = Action::Evaluate;
        assert_eq!(Phase::Init.next(&config), Phase::FinalTest);
    }

    #[test]
    fn test_full_run_writes_checkpoint_and_logs() {
        let dir = TempDir::new().unwrap();
        let config = tiny_config(&dir);
        let report = trainer(config.clone()).run(tiny_data(6)).unwrap();

        assert_eq!(report.steps_per_epoch, 3);
        assert_eq!(report.global_step, 6);
        assert_eq!(report.init, InitPlan::Fresh);
        assert_eq!(report.history.records.len(), 2);
        assert_eq!(report.test.predictions.len(), 3 * 64 * 64);
        assert_eq!(report.test.ground_truth.len(), report.test.predictions.len());

        let registry = FileCheckpointRegistry::new(&config.output.model_dir);
        let metadata = registry.load_metadata(&config.model_name()).unwrap();
        assert_eq!(metadata.global_step, 6);
        assert_eq!(metadata.epoch, 1);

        let train_dir = config.train_log_dir();
        assert!(train_dir.join("scalars.csv").is_file());
        assert!(train_dir.join("history.csv").is_file());
        assert!(train_dir.join("kernels_3.png").is_file());
        assert!(config.test_log_dir().join("scalars.csv").is_file());
    }

    #[test]
    fn test_second_run_restores_global_step() {
        let dir = TempDir::new().unwrap();
        let mut config = tiny_config(&dir);
        config.run.epochs = 1;
        trainer(config.clone()).run(tiny_data(4)).unwrap();

        let report = trainer(config.clone()).run(tiny_data(4)).unwrap();
        assert_eq!(
            report.init,
            InitPlan::Restore {
                name: config.model_name()
            }
        );
        assert_eq!(report.global_step, 4);
    }

    #[test]
    fn test_freeze_mode_takes_extra_step_before_checkpoint() {
        let dir = TempDir::new().unwrap();
        let mut config = tiny_config(&dir);
        config.run.epochs = 1;
        config.training.freeze = true;
        let report = trainer(config.clone()).run(tiny_data(6)).unwrap();

        // 3 batches minus one, plus the full step before saving
        assert_eq!(report.steps_per_epoch, 2);
        assert_eq!(report.global_step, 3);
    }

    #[test]
    fn test_evaluate_only_run() {
        let dir = TempDir::new().unwrap();
        let mut config = tiny_config(&dir);
        config.run.action = Action::Evaluate;
        let report = trainer(config).run(tiny_data(4)).unwrap();
        assert_eq!(report.global_step, 0);
        assert!(report.history.records.is_empty());
        assert_eq!(report.test.evaluation.num_images, 3);
    }

    #[test]
    fn test_too_few_records_is_an_error() {
        let dir = TempDir::new().unwrap();
        let config = tiny_config(&dir);
        let mut data = tiny_data(4);
        data.total_records = 1;
        assert!(matches!(trainer(config).run(data), Err(Error::Training(_))));
    }

    #[test]
    fn test_unvalidated_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = tiny_config(&dir);
        config.training.checkpoint_every = 0;
        let result = Trainer::<TestBackend>::new(config, small_config().architecture, Default::default());
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_training_metrics_cover_every_step() {
        let dir = TempDir::new().unwrap();
        let mut config = tiny_config(&dir);
        config.training.log_every = 2;
        let trainer = trainer(config.clone());

        let (model, global_step, _) = trainer.initialize().unwrap();
        let mut optimizer = adam_config().init::<TestBackend, SegNet<TestBackend>>();
        let mut source = tiny_data(8).train;
        let schedule = ExponentialDecay::from_config(&config, 4);
        let mut writer = SummaryWriter::new(dir.path().join("summaries")).unwrap();
        let mut state = EpochState {
            global_step,
            train_accuracies: Vec::new(),
            train_losses: Vec::new(),
            train_metrics: StreamingMetrics::new(config.image_positive_threshold()),
        };

        trainer
            .train_epoch(model, &mut optimizer, &mut source, 0, 4, &schedule, &mut state, &mut writer)
            .unwrap();

        // 4 steps of 2 images, 64x64 each
        assert_eq!(state.global_step, 4);
        assert_eq!(state.train_metrics.pixel_counts().total(), 4 * 2 * 64 * 64);
        assert_eq!(state.train_metrics.image_counts().total(), 8);
        // only step 2 is logged
        assert_eq!(state.train_accuracies.len(), 1);
        assert_eq!(state.train_losses.len(), 4);
    }

    #[test]
    fn test_transfer_copies_kept_layers_and_resets_step() {
        let dir = TempDir::new().unwrap();
        let mut source_config = tiny_config(&dir);
        source_config.run.epochs = 1;
        let source_name = source_config.model_name();
        trainer(source_config.clone()).run(tiny_data(4)).unwrap();

        let mut config = source_config.clone();
        config.run.version = "b".to_string();
        config.run.init_model = Some(source_name.clone());
        let (model, global_step, plan) = trainer(config).initialize().unwrap();
        assert_eq!(plan, InitPlan::Transfer { source: source_name.clone() });
        assert_eq!(global_step, 0);

        let (source, source_step, _) = trainer(source_config).initialize().unwrap();
        assert_eq!(source_step, 2);
        let kernel = |m: &SegNet<TestBackend>, n: &str| m.layer(n).unwrap().kernel().into_data();
        assert_eq!(kernel(&model, "conv0.1"), kernel(&source, "conv0.1"));
        assert_eq!(kernel(&model, "conv3.1"), kernel(&source, "conv3.1"));
        // decoder layers are excluded from the default transfer and start fresh
        assert_ne!(kernel(&model, "logits"), kernel(&source, "logits"));
        assert_ne!(kernel(&model, "up_conv2"), kernel(&source, "up_conv2"));
    }
}
