//! Training session configuration

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use humanise_core::HumaniseConfig;
use humanise_optimizer::AdamConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub model: HumaniseConfig,
    /// Largest batch the session accepts; sizes the label buffer
    pub batch_size: usize,
    pub generator_optimiser: AdamConfig,
    pub discriminator_optimiser: AdamConfig,
    /// Emit metrics when the batch index within an epoch is a multiple of this
    pub log_frequency: usize,
    /// Root for per-session metric logs (`<root>/<log_name>`)
    pub train_stats_log_path: PathBuf,
    /// Directory checkpoints are written to and loaded from
    pub model_output_path: PathBuf,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            model: HumaniseConfig::default(),
            batch_size: 16,
            generator_optimiser: AdamConfig::gan(),
            discriminator_optimiser: AdamConfig::gan(),
            log_frequency: 10,
            train_stats_log_path: PathBuf::from("stats"),
            model_output_path: PathBuf::from("models"),
        }
    }
}

impl TrainerConfig {
    /// Tiny networks writing under `root`, for smoke runs and tests
    pub fn tiny(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            model: HumaniseConfig::tiny(),
            batch_size: 4,
            log_frequency: 5,
            train_stats_log_path: root.join("stats"),
            model_output_path: root.join("models"),
            ..Default::default()
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_log_frequency(mut self, log_frequency: usize) -> Self {
        self.log_frequency = log_frequency;
        self
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), json)
            .with_context(|| format!("Failed to write config {}", path.as_ref().display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;

        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be positive");
        }

        if self.log_frequency == 0 {
            anyhow::bail!("log_frequency must be positive");
        }

        for (name, optimiser) in [
            ("generator_optimiser", &self.generator_optimiser),
            ("discriminator_optimiser", &self.discriminator_optimiser),
        ] {
            if optimiser.lr <= 0.0 {
                anyhow::bail!("{}.lr must be positive", name);
            }
            if !(0.0..1.0).contains(&optimiser.beta1) || !(0.0..1.0).contains(&optimiser.beta2) {
                anyhow::bail!("{} betas must be in [0, 1)", name);
            }
        }

        if self.train_stats_log_path.as_os_str().is_empty() {
            anyhow::bail!("train_stats_log_path must not be empty");
        }

        if self.model_output_path.as_os_str().is_empty() {
            anyhow::bail!("model_output_path must not be empty");
        }

        Ok(())
    }
}
