//! Training session: state ownership, epoch driver and persistence

use anyhow::{Context, Result};
use candle_core::{Device, Var};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use humanise_core::{
    BuildNetwork, Discriminator, Generator, HumaniseError, NoteDiscriminator, NoteTransformer,
};

use crate::checkpoint::{latest_checkpoint, unique_checkpoint_path, Checkpoint};
use crate::config::TrainerConfig;
use crate::dataset::BatchSource;
use crate::step::AdversarialPair;
use crate::summary::{MetricsSink, SummaryWriter};

pub const TRAIN_GROUP: &str = "train";
pub const VALIDATION_GROUP: &str = "validation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationMode {
    Inference,
    Train,
}

/// Epoch-level view of one `train` or `validate` pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: u64,
    pub batches: usize,
    /// Mean of each reported scalar over the epoch's batches
    pub means: BTreeMap<String, f64>,
}

impl EpochSummary {
    fn new(epoch: u64) -> Self {
        Self {
            epoch,
            batches: 0,
            means: BTreeMap::new(),
        }
    }

    /// Fold one batch into the running means.
    fn record(&mut self, scalars: &[(&str, f64)]) {
        self.batches += 1;
        let n = self.batches as f64;
        for (name, value) in scalars {
            let mean = self.means.entry(name.to_string()).or_insert(0.0);
            *mean += (value - *mean) / n;
        }
    }

    pub fn mean(&self, name: &str) -> Option<f64> {
        self.means.get(name).copied()
    }
}

/// Everything one adversarial training job owns.
///
/// `epoch` and `global_step` only move forward: `global_step` once per
/// training batch, `epoch` once per [`Session::advance_epoch`]. Both are
/// persisted by [`Session::checkpoint`] and restored by [`Session::load`].
pub struct Session<G, D> {
    log_name: String,
    config: TrainerConfig,
    device: Device,
    pair: AdversarialPair<G, D>,
    epoch: u64,
    global_step: u64,
    mode: OperationMode,
    summary: Box<dyn MetricsSink>,
}

/// Session over the reference networks
pub type HumaniseSession = Session<NoteTransformer, NoteDiscriminator>;

impl<G, D> Session<G, D>
where
    G: Generator + BuildNetwork,
    D: Discriminator + BuildNetwork,
{
    /// Fresh networks and optimisers, metrics written under
    /// `<train_stats_log_path>/<log_name>`.
    pub fn new(log_name: &str, config: TrainerConfig, device: &Device) -> Result<Self> {
        let log_dir = config.train_stats_log_path.join(log_name);
        let summary = SummaryWriter::new(&log_dir)?;
        Self::with_sink(log_name, config, device, Box::new(summary))
    }

    pub fn with_sink(
        log_name: &str,
        config: TrainerConfig,
        device: &Device,
        summary: Box<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;

        let generator = G::build(&config.model, device)?;
        let discriminator = D::build(&config.model, device)?;
        let pair = AdversarialPair::new(generator, discriminator, &config, device)?;

        tracing::info!(
            "Session {}: {} generator / {} discriminator tensors, batch ceiling {}",
            log_name,
            pair.generator_params().len(),
            pair.discriminator_params().len(),
            config.batch_size
        );

        Ok(Self {
            log_name: log_name.to_string(),
            config,
            device: device.clone(),
            pair,
            epoch: 0,
            global_step: 0,
            mode: OperationMode::Train,
            summary,
        })
    }

    /// Resume from `<model_output_path>/<model_name>`.
    pub fn load(model_name: &str, config: TrainerConfig, device: &Device) -> Result<Self> {
        let path = config.model_output_path.join(model_name);
        Self::load_path(path, config, device)
    }

    /// Resume from the newest `<model_name>-*` checkpoint under the model
    /// output path, or `None` when there is none yet.
    pub fn load_latest(model_name: &str, config: TrainerConfig, device: &Device) -> Result<Option<Self>> {
        match latest_checkpoint(&config.model_output_path, model_name)? {
            Some(path) => Ok(Some(Self::load_path(path, config, device)?)),
            None => Ok(None),
        }
    }

    pub fn load_path(path: impl AsRef<Path>, config: TrainerConfig, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let checkpoint = Checkpoint::load(path, device)?;

        let mut session = Self::new(&checkpoint.log_name, config, device)?;
        session
            .restore(&checkpoint)
            .with_context(|| format!("Failed to restore session from {}", path.display()))?;

        tracing::info!(
            "Resumed {} at epoch {}, global step {}",
            session.log_name,
            session.epoch,
            session.global_step
        );
        Ok(session)
    }
}

impl<G: Generator, D: Discriminator> Session<G, D> {
    /// Copy of the full training state.
    pub fn snapshot(&self) -> Result<Checkpoint> {
        Ok(Checkpoint {
            log_name: self.log_name.clone(),
            epoch: self.epoch,
            global_step: self.global_step,
            generator: copy_params(self.pair.generator_params())?,
            discriminator: copy_params(self.pair.discriminator_params())?,
            generator_optimiser: self.pair.generator_optimiser().state_dict()?,
            discriminator_optimiser: self.pair.discriminator_optimiser().state_dict()?,
            criterion: self.pair.criterion().state_dict(),
        })
    }

    /// Overwrite networks, optimisers, criterion and counters from `checkpoint`.
    ///
    /// Every parameter of both networks must be present with a matching shape.
    pub fn restore(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        restore_params(self.pair.generator_params(), &checkpoint.generator, "generator", &self.device)?;
        restore_params(
            self.pair.discriminator_params(),
            &checkpoint.discriminator,
            "discriminator",
            &self.device,
        )?;

        self.pair
            .generator_optimiser_mut()
            .load_state_dict(&checkpoint.generator_optimiser, &self.device)?;
        self.pair
            .discriminator_optimiser_mut()
            .load_state_dict(&checkpoint.discriminator_optimiser, &self.device)?;
        self.pair
            .criterion_mut()
            .load_state_dict(&checkpoint.criterion, &self.device)?;

        self.epoch = checkpoint.epoch;
        self.global_step = checkpoint.global_step;
        Ok(())
    }

    /// Flush metrics and write a timestamped checkpoint into the model output directory.
    pub fn checkpoint(&mut self, model_name: &str) -> Result<PathBuf> {
        self.summary.flush()?;

        let dir = &self.config.model_output_path;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create model directory {}", dir.display()))?;

        let path = unique_checkpoint_path(dir, model_name);
        self.snapshot()?.save(&path)?;

        tracing::info!(
            "Checkpoint saved to {} (epoch {}, global step {})",
            path.display(),
            self.epoch,
            self.global_step
        );
        Ok(path)
    }

    pub fn set_mode(&mut self, mode: OperationMode) {
        self.pair.set_training(mode == OperationMode::Train);
        self.mode = mode;
    }

    pub fn mode(&self) -> OperationMode {
        self.mode
    }

    pub fn advance_epoch(&mut self) {
        self.epoch += 1;
    }

    /// One training pass over `source`.
    ///
    /// Scalars go to the sink for every batch whose index within the epoch
    /// is a multiple of `log_frequency`; every batch advances `global_step`.
    pub fn train(&mut self, source: &mut impl BatchSource) -> Result<EpochSummary> {
        source.reset()?;
        let pb = progress_bar(source.num_batches(), "train")?;
        let mut summary = EpochSummary::new(self.epoch);

        let mut batch_idx = 0usize;
        while let Some(batch) = source.next_batch()? {
            let metrics = self.pair.train_step(&batch)?;
            let scalars = metrics.scalars();

            if batch_idx % self.config.log_frequency == 0 {
                self.summary
                    .add_scalars(TRAIN_GROUP, &scalars, self.global_step)?;
                tracing::debug!(
                    "epoch {} step {}: Loss(D) {:.4} Loss(G) {:.4} D(x) {:.4} D(G(z)) {:.4} / {:.4}",
                    self.epoch,
                    self.global_step,
                    metrics.loss_d,
                    metrics.loss_g,
                    metrics.d_x,
                    metrics.d_g_z1,
                    metrics.d_g_z2
                );
                pb.set_message(format!(
                    "Loss(D): {:.4} | Loss(G): {:.4} | step: {}",
                    metrics.loss_d, metrics.loss_g, self.global_step
                ));
            }

            summary.record(&scalars);
            self.global_step += 1;
            batch_idx += 1;
            pb.inc(1);
        }

        pb.finish_and_clear();
        tracing::info!(
            "Epoch {} train: {} batches, Loss(D) {:.4}, Loss(G) {:.4}",
            self.epoch,
            summary.batches,
            summary.mean("Loss(D)").unwrap_or(f64::NAN),
            summary.mean("Loss(G)").unwrap_or(f64::NAN)
        );
        Ok(summary)
    }

    /// One validation pass over `source`; no parameter or counter changes.
    ///
    /// Scalars are keyed by the current `global_step`.
    pub fn validate(&mut self, source: &mut impl BatchSource) -> Result<EpochSummary> {
        source.reset()?;
        let pb = progress_bar(source.num_batches(), "validate")?;
        let mut summary = EpochSummary::new(self.epoch);

        let mut batch_idx = 0usize;
        while let Some(batch) = source.next_batch()? {
            let metrics = self.pair.validate_step(&batch)?;
            let scalars = metrics.scalars();

            if batch_idx % self.config.log_frequency == 0 {
                self.summary
                    .add_scalars(VALIDATION_GROUP, &scalars, self.global_step)?;
                pb.set_message(format!(
                    "Loss(D): {:.4} | Loss(G): {:.4}",
                    metrics.loss_d, metrics.loss_g
                ));
            }

            summary.record(&scalars);
            batch_idx += 1;
            pb.inc(1);
        }

        pb.finish_and_clear();
        tracing::info!(
            "Epoch {} validation: {} batches, Loss(D) {:.4}, Loss(G) {:.4}",
            self.epoch,
            summary.batches,
            summary.mean("Loss(D)").unwrap_or(f64::NAN),
            summary.mean("Loss(G)").unwrap_or(f64::NAN)
        );
        Ok(summary)
    }

    pub fn log_name(&self) -> &str {
        &self.log_name
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    pub fn pair(&self) -> &AdversarialPair<G, D> {
        &self.pair
    }
}

impl<G, D> Drop for Session<G, D> {
    fn drop(&mut self) {
        if let Err(e) = self.summary.close() {
            tracing::warn!("Failed to close metrics sink for {}: {}", self.log_name, e);
        }
    }
}

fn progress_bar(len: Option<usize>, phase: &str) -> Result<ProgressBar> {
    let pb = match len {
        Some(len) => {
            let pb = ProgressBar::new(len as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("  {prefix} {bar:40.cyan/blue} {pos}/{len} [{elapsed_precise}] {msg}")?,
            );
            pb
        }
        None => ProgressBar::new_spinner(),
    };
    pb.set_prefix(phase.to_string());
    Ok(pb)
}

fn copy_params(params: &[(String, Var)]) -> Result<HashMap<String, candle_core::Tensor>> {
    params
        .iter()
        .map(|(name, var)| -> Result<(String, candle_core::Tensor)> {
            Ok((name.clone(), var.as_tensor().copy()?))
        })
        .collect()
}

fn restore_params(
    params: &[(String, Var)],
    stored: &HashMap<String, candle_core::Tensor>,
    section: &str,
    device: &Device,
) -> Result<()> {
    for (name, var) in params {
        let tensor = stored
            .get(name)
            .ok_or_else(|| HumaniseError::MissingCheckpointEntry(format!("{}.{}", section, name)))?;
        if tensor.dims() != var.dims() {
            return Err(HumaniseError::ShapeMismatch {
                what: "checkpoint parameter",
                expected: var.dims().to_vec(),
                got: tensor.dims().to_vec(),
            }
            .into());
        }
        var.set(&tensor.to_device(device)?.to_dtype(var.dtype())?)?;
    }
    Ok(())
}
