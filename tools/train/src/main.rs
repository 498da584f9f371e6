//! Training CLI Tool
//!
//! Trains the segmentation network on one dataset, validating every epoch
//! and finishing with a pass over the test split.

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use seg_core::{load_toml_config, setup_cli_logging, Action, Batch, ExperimentConfig, LabelMode, Split, ARCHITECTURE_VERSION};
use seg_dataset::{into_batches, BatchSource, FixedBatches, ImagePairLoader, ShuffleQueue, SplitSource, SplitStatistics};
use seg_training::{
    backend::{backend_name, default_device},
    ArchitectureSpec, RunReport, Trainer, TrainingBackend, TrainingData,
};
use std::path::PathBuf;
use tracing::info;

/// Segmentation network training tool
#[derive(Parser, Debug)]
#[command(
    name = "train",
    about = "Train the encoder-decoder segmentation network",
    disable_version_flag = true
)]
struct Args {
    /// Number of epochs
    #[arg(short, long, value_name = "N")]
    epochs: Option<usize>,

    /// Dataset id
    #[arg(short = 'd', long = "data", value_name = "ID")]
    dataset: Option<u32>,

    /// Initialize from this model's weights
    #[arg(short = 'm', long = "model", value_name = "NAME")]
    init_model: Option<String>,

    /// Restore this model and continue training it
    #[arg(short = 'r', long = "restore", value_name = "NAME")]
    restore_model: Option<String>,

    /// Label mode: label, normal, mask, mass or benign
    #[arg(short, long, value_name = "MODE")]
    label: Option<LabelMode>,

    /// "train", anything else only runs the test pass
    #[arg(short, long, value_name = "ACTION")]
    action: Option<String>,

    /// Only train the decoder side of the network
    #[arg(short, long)]
    freeze: bool,

    /// Stop-gradient mode (lower starting learning rate)
    #[arg(short = 's', long = "stop")]
    stop_gradient: bool,

    /// Pixel decision threshold
    #[arg(short, long, value_name = "P")]
    threshold: Option<f64>,

    /// Contrast factor applied to every image
    #[arg(short, long, value_name = "FACTOR")]
    contrast: Option<f32>,

    /// Per-image standardization
    #[arg(short, long)]
    normalize: bool,

    /// Cross-entropy weight of positive pixels
    #[arg(short, long, value_name = "W")]
    weight: Option<f64>,

    /// Suffix appended to the model name
    #[arg(short, long, value_name = "SUFFIX")]
    version: Option<String>,

    /// Random paired flips on training batches
    #[arg(long)]
    distort: bool,

    /// Crop size fed to the network
    #[arg(long, value_name = "PIXELS")]
    size: Option<usize>,

    /// Path to an experiment configuration file (TOML)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Root directory of the datasets
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Checkpoint directory
    #[arg(long, value_name = "DIR")]
    model_dir: Option<PathBuf>,

    /// Summary directory
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Random seed
    #[arg(long, value_name = "SEED")]
    seed: Option<u64>,

    /// Show a progress bar over training steps
    #[arg(long)]
    progress: bool,

    /// Verbose logging
    #[arg(long)]
    verbose: bool,

    /// Validate the configuration and data layout without training
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_cli_logging(args.verbose)?;

    let mut config = match &args.config {
        Some(path) => load_toml_config::<ExperimentConfig>(path).context("Failed to load configuration file")?,
        None => ExperimentConfig::default(),
    };
    apply_overrides(&mut config, &args);
    config.validate().context("Invalid configuration")?;

    println!("{}", format!("Segmentation training - {}", config.model_name()).green().bold());
    print_config_summary(&config);

    let loader = ImagePairLoader::from_config(&config);
    let training = config.run.action == Action::Train && config.run.epochs > 0;

    if args.dry_run {
        check_layout(&loader, &config, training)?;
        info!("Configuration validated successfully (dry run)");
        return Ok(());
    }

    let architecture = ArchitectureSpec::for_version(ARCHITECTURE_VERSION)?;
    let log_dir = config.train_log_dir();
    std::fs::create_dir_all(&log_dir).context("Failed to create log directory")?;
    let config_path = log_dir.join("config.toml");
    std::fs::write(&config_path, toml::to_string_pretty(&config)?).context("Failed to save configuration")?;
    info!("Configuration saved to: {}", config_path.display());

    let validation = if training {
        load_batches(&loader, &config, Split::Validation)?
    } else {
        Vec::new()
    };
    let test = load_batches(&loader, &config, Split::Test)?;
    let trainer = Trainer::<TrainingBackend>::new(config.clone(), architecture, default_device())
        .context("Failed to set up the trainer")?;

    let report = if training {
        let total_records = loader
            .count_training_records(&config)
            .context("Failed to count training records")?;
        info!("{} training records per epoch", total_records);
        let queue = ShuffleQueue::from_loader(&loader, &config).context("Failed to start data workers")?;
        run(&trainer, queue, total_records, validation, test)?
    } else {
        // no training data is read when only testing
        let source = FixedBatches::new(test.clone()).context("Test split is empty")?;
        run(&trainer, source, 0, validation, test)?
    };

    print_report(&report);
    Ok(())
}

fn run<Q: BatchSource>(
    trainer: &Trainer<TrainingBackend>,
    train: Q,
    total_records: usize,
    validation: Vec<Batch>,
    test: Vec<Batch>,
) -> Result<RunReport> {
    let data = TrainingData {
        train,
        total_records,
        validation,
        test,
    };
    trainer.run(data).context("Training run failed")
}

fn apply_overrides(config: &mut ExperimentConfig, args: &Args) {
    if let Some(epochs) = args.epochs {
        config.run.epochs = epochs;
    }
    if let Some(dataset) = args.dataset {
        config.run.dataset = dataset;
    }
    if let Some(ref name) = args.init_model {
        config.run.init_model = Some(name.clone());
    }
    if let Some(ref name) = args.restore_model {
        config.run.restore_model = Some(name.clone());
    }
    if let Some(label) = args.label {
        config.run.label = label;
    }
    if let Some(ref action) = args.action {
        config.run.action = Action::from(action.as_str());
    }
    if let Some(ref version) = args.version {
        config.run.version = version.clone();
    }
    if args.freeze {
        config.training.freeze = true;
    }
    if args.stop_gradient {
        config.training.stop_gradient = true;
    }
    if let Some(threshold) = args.threshold {
        config.evaluation.threshold = threshold;
    }
    if let Some(weight) = args.weight {
        config.training.positive_weight = weight;
    }
    if let Some(contrast) = args.contrast {
        config.data.contrast = Some(contrast);
    }
    if args.normalize {
        config.data.normalize = true;
    }
    if args.distort {
        config.data.distort = true;
    }
    if let Some(size) = args.size {
        config.model.size = size;
    }
    if let Some(ref dir) = args.data_dir {
        config.data.data_dir = dir.clone();
    }
    if let Some(ref dir) = args.model_dir {
        config.output.model_dir = dir.clone();
    }
    if let Some(ref dir) = args.log_dir {
        config.output.log_dir = dir.clone();
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if args.progress {
        config.output.show_progress = true;
    }
}

fn print_config_summary(config: &ExperimentConfig) {
    info!("");
    info!("Configuration Summary:");
    info!("  Backend: {}", backend_name());
    info!("  Action: {:?}", config.run.action);
    info!("  Dataset: {} ({})", config.run.dataset, config.data.data_dir.display());
    info!("  Label: {}", config.run.label);
    info!("  Epochs: {}", config.run.epochs);
    info!("  Batch size: {}", config.training.batch_size);
    info!("  Crop size: {}", config.model.size);
    info!("  Starting learning rate: {}", config.starting_learning_rate());
    info!("  Positive weight: {}", config.training.positive_weight);
    info!("  Threshold: {}", config.evaluation.threshold);
    info!("  Freeze: {}", config.training.freeze);
    if let Some(ref name) = config.run.init_model {
        info!("  Init model: {}", name);
    }
    if let Some(ref name) = config.run.restore_model {
        info!("  Restore model: {}", name);
    }
    info!("  Model dir: {}", config.output.model_dir.display());
    info!("  Log dir: {}", config.output.log_dir.display());
    info!("");
}

/// Lists every split the run will read so a dry run fails on missing data.
fn check_layout(loader: &ImagePairLoader, config: &ExperimentConfig, training: bool) -> Result<()> {
    if training {
        let records = loader
            .count_training_records(config)
            .context("Training data is not readable")?;
        info!("  Training records per epoch: {}", records);
        let pairs = loader.split_pairs(Split::Validation).context("Validation split is not readable")?;
        info!("  Validation pairs: {}", pairs.len());
    }
    let pairs = loader.split_pairs(Split::Test).context("Test split is not readable")?;
    info!("  Test pairs: {}", pairs.len());
    Ok(())
}

fn load_batches(loader: &ImagePairLoader, config: &ExperimentConfig, split: Split) -> Result<Vec<Batch>> {
    let samples = loader
        .load_split(split)
        .with_context(|| format!("Failed to load the {} split", split.dir_name()))?;
    let stats = SplitStatistics::from_samples(&samples, config.image_positive_threshold());
    info!(
        "  {}: {} samples, {} with foreground, {:.2}% foreground pixels",
        split.dir_name(),
        stats.num_samples,
        stats.positive_images,
        stats.foreground_fraction() * 100.0
    );
    Ok(into_batches(&samples, config.training.batch_size)?)
}

fn print_report(report: &RunReport) {
    let test = &report.test.evaluation;
    println!();
    println!("{}", "Run Summary:".cyan().bold());
    println!("  Model:            {}", report.model_name);
    println!("  Initialization:   {:?}", report.init);
    println!("  Global step:      {}", report.global_step);
    println!("  Epochs recorded:  {}", report.history.records.len());
    if let Some(last) = report.history.last() {
        println!("  Last cv accuracy: {:.4}", last.valid_accuracy);
    }
    println!("  Test images:      {}", test.num_images);
    println!("  Test accuracy:    {:.4} (pixel), {:.4} (image)", test.metrics.accuracy, test.metrics.image_accuracy);
    println!("  Test recall:      {:.4} (pixel), {:.4} (image)", test.metrics.recall, test.metrics.image_recall);
    println!("  Test F1:          {:.4}", test.metrics.f1);
    println!("{}", "Done.".green().bold());
}
