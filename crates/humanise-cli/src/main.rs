//! Humanise CLI - train and evaluate the humanisation GAN
//!
//! Usage:
//!   humanise train --dataset pairs.jsonl --validation held_out.jsonl --epochs 20
//!   humanise train --model-size tiny --epochs 2            (synthetic data)
//!   humanise train --resume models/humanise-2024-05-01_12-00-00.safetensors --epochs 5
//!   humanise train --resume-latest --model-name humanise --epochs 5
//!   humanise validate --checkpoint models/humanise-2024-05-01_12-00-00.safetensors
//!   humanise inspect --checkpoint models/humanise-2024-05-01_12-00-00.safetensors

mod inspect;
mod train;
mod validate;

use anyhow::Result;
use candle_core::Device;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use humanise_core::HumaniseConfig;
use humanise_training::{PerformanceDataset, TrainerConfig};

#[derive(Parser)]
#[command(
    name = "humanise",
    about = "Humanise CLI - adversarial training for humanised performances",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train generator and discriminator, checkpointing after every epoch
    Train {
        #[command(flatten)]
        config: ConfigArgs,

        #[command(flatten)]
        data: DataArgs,

        /// Number of epochs to run in this invocation
        #[arg(long, default_value = "10")]
        epochs: u64,

        /// Name of the metrics log directory under the stats path
        #[arg(long, default_value = "humanise")]
        log_name: String,

        /// Prefix of checkpoint file names
        #[arg(long, default_value = "humanise")]
        model_name: String,

        /// Resume from a checkpoint (.safetensors)
        #[arg(long, conflicts_with = "resume_latest")]
        resume: Option<PathBuf>,

        /// Resume from the newest checkpoint of --model-name in the output directory
        #[arg(long)]
        resume_latest: bool,
    },

    /// Run one validation pass with a saved checkpoint
    Validate {
        #[command(flatten)]
        config: ConfigArgs,

        #[command(flatten)]
        data: DataArgs,

        /// Checkpoint to evaluate (.safetensors)
        #[arg(long)]
        checkpoint: PathBuf,
    },

    /// Print counters and tensor inventory of a checkpoint
    Inspect {
        /// Checkpoint to read (.safetensors)
        #[arg(long)]
        checkpoint: PathBuf,

        /// List every tensor with its shape
        #[arg(long)]
        tensors: bool,
    },
}

/// Session configuration: a JSON file, a size preset and per-flag overrides.
#[derive(Args, Clone)]
pub struct ConfigArgs {
    /// TrainerConfig JSON file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Network size preset when no config file is given: tiny, small, default
    #[arg(long, default_value = "small")]
    model_size: String,

    /// Largest batch the session accepts
    #[arg(long)]
    batch_size: Option<usize>,

    /// Emit metrics every N batches
    #[arg(long)]
    log_frequency: Option<usize>,

    /// Generator learning rate
    #[arg(long)]
    generator_lr: Option<f64>,

    /// Discriminator learning rate
    #[arg(long)]
    discriminator_lr: Option<f64>,

    /// Root directory for metric logs
    #[arg(long)]
    stats_dir: Option<PathBuf>,

    /// Directory checkpoints are written to
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

impl ConfigArgs {
    pub fn resolve(&self) -> Result<TrainerConfig> {
        let mut config = match &self.config {
            Some(path) => TrainerConfig::from_file(path)?,
            None => {
                let model = match self.model_size.as_str() {
                    "tiny" => HumaniseConfig::tiny(),
                    "small" => HumaniseConfig::small(),
                    "default" => HumaniseConfig::default(),
                    other => anyhow::bail!("Unknown model size: {}. Use: tiny, small, default", other),
                };
                TrainerConfig {
                    model,
                    ..Default::default()
                }
            }
        };

        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(log_frequency) = self.log_frequency {
            config.log_frequency = log_frequency;
        }
        if let Some(lr) = self.generator_lr {
            config.generator_optimiser.lr = lr;
        }
        if let Some(lr) = self.discriminator_lr {
            config.discriminator_optimiser.lr = lr;
        }
        if let Some(dir) = &self.stats_dir {
            config.train_stats_log_path = dir.clone();
        }
        if let Some(dir) = &self.output_dir {
            config.model_output_path = dir.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

/// Where batches come from: JSONL files, or synthetic pairs when none are given.
#[derive(Args, Clone)]
pub struct DataArgs {
    /// Training pairs (JSONL, one sample per line)
    #[arg(long)]
    dataset: Option<PathBuf>,

    /// Validation pairs (JSONL); defaults to a held-out synthetic set
    #[arg(long)]
    validation: Option<PathBuf>,

    /// Synthetic samples per epoch when no dataset is given
    #[arg(long, default_value = "256")]
    synthetic_samples: usize,

    /// Time steps per synthetic sample
    #[arg(long, default_value = "64")]
    sequence_length: usize,

    /// Seed for shuffling and synthetic data
    #[arg(long, default_value = "42")]
    seed: u64,
}

impl DataArgs {
    pub fn training_set(&self, config: &TrainerConfig, device: &Device) -> Result<PerformanceDataset> {
        let dataset = match &self.dataset {
            Some(path) => PerformanceDataset::load_jsonl(path, config.batch_size, device)?,
            None => self.synthetic(config, self.synthetic_samples, self.seed, device)?,
        };
        Ok(dataset.with_shuffle(self.seed))
    }

    pub fn validation_set(&self, config: &TrainerConfig, device: &Device) -> Result<PerformanceDataset> {
        match &self.validation {
            Some(path) => PerformanceDataset::load_jsonl(path, config.batch_size, device),
            None => {
                let samples = (self.synthetic_samples / 4).max(config.batch_size);
                self.synthetic(config, samples, self.seed.wrapping_add(1), device)
            }
        }
    }

    fn synthetic(
        &self,
        config: &TrainerConfig,
        samples: usize,
        seed: u64,
        device: &Device,
    ) -> Result<PerformanceDataset> {
        tracing::info!(
            "No dataset given, using {} synthetic samples of {} steps",
            samples,
            self.sequence_length
        );
        PerformanceDataset::synthetic(
            &config.model,
            samples,
            self.sequence_length,
            config.batch_size,
            seed,
            device,
        )
    }
}

pub fn select_device() -> Result<Device> {
    if candle_core::utils::cuda_is_available() {
        tracing::info!("CUDA available, using GPU");
        Ok(Device::new_cuda(0)?)
    } else {
        tracing::info!("No CUDA, using CPU");
        Ok(Device::Cpu)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            config,
            data,
            epochs,
            log_name,
            model_name,
            resume,
            resume_latest,
        } => {
            train::run(&config, &data, epochs, &log_name, &model_name, resume, resume_latest)?;
        }

        Commands::Validate {
            config,
            data,
            checkpoint,
        } => {
            validate::run(&config, &data, checkpoint)?;
        }

        Commands::Inspect { checkpoint, tensors } => {
            inspect::run(checkpoint, tensors)?;
        }
    }

    Ok(())
}
