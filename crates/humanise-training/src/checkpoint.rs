//! Session checkpoints as a single safetensors archive
//!
//! Every tensor lives under a section prefix (`generator.`, `discriminator.`,
//! `generator_optimiser.`, `discriminator_optimiser.`, `criterion.`); the
//! session counters and log name travel in the header metadata.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use humanise_core::HumaniseError;

/// Value of the `format` metadata key
pub const CHECKPOINT_FORMAT: &str = "humanise-checkpoint-v1";
pub const CHECKPOINT_EXTENSION: &str = "safetensors";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

const GENERATOR: &str = "generator";
const DISCRIMINATOR: &str = "discriminator";
const GENERATOR_OPTIMISER: &str = "generator_optimiser";
const DISCRIMINATOR_OPTIMISER: &str = "discriminator_optimiser";
const CRITERION: &str = "criterion";

const LOG_NAME: &str = "log_name";
const EPOCH: &str = "epoch";
const GLOBAL_STEP: &str = "global_step";
const FORMAT: &str = "format";

#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    pub log_name: String,
    pub epoch: u64,
    pub global_step: u64,
    pub generator: HashMap<String, Tensor>,
    pub discriminator: HashMap<String, Tensor>,
    pub generator_optimiser: HashMap<String, Tensor>,
    pub discriminator_optimiser: HashMap<String, Tensor>,
    pub criterion: HashMap<String, Tensor>,
}

impl Checkpoint {
    fn sections(&self) -> [(&'static str, &HashMap<String, Tensor>); 5] {
        [
            (GENERATOR, &self.generator),
            (DISCRIMINATOR, &self.discriminator),
            (GENERATOR_OPTIMISER, &self.generator_optimiser),
            (DISCRIMINATOR_OPTIMISER, &self.discriminator_optimiser),
            (CRITERION, &self.criterion),
        ]
    }

    fn section_mut(&mut self, name: &str) -> Option<&mut HashMap<String, Tensor>> {
        match name {
            GENERATOR => Some(&mut self.generator),
            DISCRIMINATOR => Some(&mut self.discriminator),
            GENERATOR_OPTIMISER => Some(&mut self.generator_optimiser),
            DISCRIMINATOR_OPTIMISER => Some(&mut self.discriminator_optimiser),
            CRITERION => Some(&mut self.criterion),
            _ => None,
        }
    }

    pub fn num_tensors(&self) -> usize {
        self.sections().iter().map(|(_, section)| section.len()).sum()
    }

    /// `(section, tensor count)` pairs in archive order
    pub fn inventory(&self) -> Vec<(&'static str, usize)> {
        self.sections()
            .iter()
            .map(|(name, section)| (*name, section.len()))
            .collect()
    }

    /// Write the archive to `path`, replacing any existing file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let mut tensors: Vec<(String, Tensor)> = Vec::with_capacity(self.num_tensors());
        for (section, entries) in self.sections() {
            for (name, tensor) in entries {
                tensors.push((format!("{}.{}", section, name), tensor.clone()));
            }
        }
        tensors.sort_by(|a, b| a.0.cmp(&b.0));

        let metadata: HashMap<String, String> = [
            (LOG_NAME, self.log_name.clone()),
            (EPOCH, self.epoch.to_string()),
            (GLOBAL_STEP, self.global_step.to_string()),
            (FORMAT, CHECKPOINT_FORMAT.to_string()),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect();

        safetensors::serialize_to_file(tensors, &Some(metadata), path)
            .with_context(|| format!("Failed to write checkpoint {}", path.display()))?;

        tracing::debug!("Wrote {} tensors to {}", self.num_tensors(), path.display());
        Ok(())
    }

    /// Read an archive written by [`Checkpoint::save`], placing tensors on `device`.
    pub fn load(path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let buffer = std::fs::read(path)
            .with_context(|| format!("Failed to read checkpoint {}", path.display()))?;

        let (_, header) = safetensors::SafeTensors::read_metadata(&buffer)
            .with_context(|| format!("Invalid checkpoint header in {}", path.display()))?;
        let metadata = header.metadata().clone().unwrap_or_default();

        let format = metadata.get(FORMAT).map(String::as_str);
        if format != Some(CHECKPOINT_FORMAT) {
            anyhow::bail!(
                "{} is not a humanise checkpoint (format {:?})",
                path.display(),
                format
            );
        }

        let mut checkpoint = Self {
            log_name: required(&metadata, LOG_NAME)?.clone(),
            epoch: required(&metadata, EPOCH)?
                .parse()
                .context("Checkpoint epoch is not an integer")?,
            global_step: required(&metadata, GLOBAL_STEP)?
                .parse()
                .context("Checkpoint global_step is not an integer")?,
            ..Default::default()
        };

        let tensors = candle_core::safetensors::load_buffer(&buffer, device)?;
        for (key, tensor) in tensors {
            let Some((section, name)) = key.split_once('.') else {
                tracing::warn!("Ignoring unsectioned checkpoint tensor {}", key);
                continue;
            };
            match checkpoint.section_mut(section) {
                Some(entries) => {
                    entries.insert(name.to_string(), tensor);
                }
                None => tracing::warn!("Ignoring unknown checkpoint section {}", section),
            }
        }

        Ok(checkpoint)
    }
}

fn required<'a>(metadata: &'a HashMap<String, String>, key: &str) -> Result<&'a String> {
    metadata
        .get(key)
        .ok_or_else(|| HumaniseError::MissingCheckpointEntry(key.to_string()).into())
}

/// `<model_name>-<YYYY-MM-DD_HH-MM-SS>.safetensors`, stamped with local time.
pub fn checkpoint_file_name(model_name: &str) -> String {
    let timestamp = chrono::Local::now().format(TIMESTAMP_FORMAT);
    format!("{}-{}.{}", model_name, timestamp, CHECKPOINT_EXTENSION)
}

/// Checkpoint path inside `dir` that does not exist yet.
///
/// Two checkpoints within the same second get `-1`, `-2`, ... suffixes.
pub fn unique_checkpoint_path(dir: &Path, model_name: &str) -> PathBuf {
    let file_name = checkpoint_file_name(model_name);
    let candidate = dir.join(&file_name);
    if !candidate.exists() {
        return candidate;
    }

    let stem = file_name
        .strip_suffix(&format!(".{}", CHECKPOINT_EXTENSION))
        .unwrap_or(&file_name)
        .to_string();
    (1u32..)
        .map(|n| dir.join(format!("{}-{}.{}", stem, n, CHECKPOINT_EXTENSION)))
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}

/// Most recently modified checkpoint in `dir` whose name starts with `model_name`.
pub fn latest_checkpoint(dir: &Path, model_name: &str) -> Result<Option<PathBuf>> {
    if !dir.exists() {
        return Ok(None);
    }

    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to list checkpoints in {}", dir.display()))?
    {
        let path = entry?.path();
        let matches = path.extension().is_some_and(|ext| ext == CHECKPOINT_EXTENSION)
            && path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(&format!("{}-", model_name)));
        if !matches {
            continue;
        }

        let modified = std::fs::metadata(&path)?.modified()?;
        if newest.as_ref().map_or(true, |(time, _)| modified >= *time) {
            newest = Some((modified, path));
        }
    }

    Ok(newest.map(|(_, path)| path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn sample(device: &Device) -> Result<Checkpoint> {
        let mut checkpoint = Checkpoint {
            log_name: "run-a".to_string(),
            epoch: 3,
            global_step: 120,
            ..Default::default()
        };
        checkpoint.generator.insert(
            "output_proj.weight".to_string(),
            Tensor::arange(0f32, 6.0, device)?.reshape((2, 3))?,
        );
        checkpoint.discriminator.insert(
            "score_head.bias".to_string(),
            Tensor::new(&[0.5f32], device)?,
        );
        checkpoint.generator_optimiser.insert(
            "step".to_string(),
            Tensor::new(7i64, device)?,
        );
        Ok(checkpoint)
    }

    #[test]
    fn test_save_then_load() -> Result<()> {
        let device = Device::Cpu;
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("model.safetensors");

        sample(&device)?.save(&path)?;
        let loaded = Checkpoint::load(&path, &device)?;

        assert_eq!(loaded.log_name, "run-a");
        assert_eq!((loaded.epoch, loaded.global_step), (3, 120));
        assert_eq!(loaded.num_tensors(), 3);
        assert_eq!(
            loaded.generator["output_proj.weight"].to_vec2::<f32>()?,
            vec![vec![0.0, 1.0, 2.0], vec![3.0, 4.0, 5.0]]
        );
        let step = &loaded.generator_optimiser["step"];
        assert_eq!(step.dtype(), DType::I64);
        assert_eq!(step.to_scalar::<i64>()?, 7);
        assert!(loaded.criterion.is_empty());
        Ok(())
    }

    #[test]
    fn test_rejects_foreign_archive() -> Result<()> {
        let device = Device::Cpu;
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("plain.safetensors");

        let mut tensors = HashMap::new();
        tensors.insert("weight".to_string(), Tensor::zeros(2, DType::F32, &device)?);
        candle_core::safetensors::save(&tensors, &path)?;

        assert!(Checkpoint::load(&path, &device).is_err());
        Ok(())
    }

    #[test]
    fn test_file_name_format() {
        let name = checkpoint_file_name("humanise");
        let timestamp = name
            .strip_prefix("humanise-")
            .and_then(|rest| rest.strip_suffix(".safetensors"))
            .unwrap();

        assert!(chrono::NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).is_ok());
    }

    #[test]
    fn test_unique_path_and_latest() -> Result<()> {
        let device = Device::Cpu;
        let dir = tempfile::tempdir()?;

        let first = unique_checkpoint_path(dir.path(), "model");
        sample(&device)?.save(&first)?;
        let second = unique_checkpoint_path(dir.path(), "model");
        assert_ne!(first, second);
        sample(&device)?.save(&second)?;

        let latest = latest_checkpoint(dir.path(), "model")?.unwrap();
        assert!(latest == first || latest == second);
        assert!(latest_checkpoint(dir.path(), "other")?.is_none());
        assert!(latest_checkpoint(&dir.path().join("missing"), "model")?.is_none());
        Ok(())
    }
}
