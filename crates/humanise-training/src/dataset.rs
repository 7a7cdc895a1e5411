//! Performance pairs and batching
//!
//! A sample pairs a quantised performance (`source`) with the humanised
//! performance it was derived from (`target`), both as `[time][feature]`
//! integer notes. Batches stack samples of equal length.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::path::Path;

use humanise_core::{CoderMask, HumaniseConfig};

/// One `(source, target, mask)` triple.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[B, Ts, F]` u32 quantised notes
    pub source: Tensor,
    /// `[B, T, F]` u32 humanised notes
    pub target: Tensor,
    pub mask: CoderMask,
}

impl Batch {
    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.source.dim(0)?)
    }
}

/// A finite, restartable stream of batches; one pass is one epoch.
pub trait BatchSource {
    /// Rewind to the start of a new epoch.
    fn reset(&mut self) -> Result<()>;

    fn next_batch(&mut self) -> Result<Option<Batch>>;

    /// Batches per epoch, when known up front
    fn num_batches(&self) -> Option<usize> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub source: Vec<Vec<u32>>,
    pub target: Vec<Vec<u32>>,
    /// Per target step, 1 where the step is padding; empty means no padding
    #[serde(default)]
    pub padding: Vec<u8>,
}

pub struct PerformanceDataset {
    samples: Vec<PerformanceSample>,
    batch_size: usize,
    shuffle: bool,
    order: Vec<usize>,
    cursor: usize,
    rng: StdRng,
    device: Device,
}

impl PerformanceDataset {
    pub fn new(samples: Vec<PerformanceSample>, batch_size: usize, device: &Device) -> Result<Self> {
        if batch_size == 0 {
            anyhow::bail!("batch_size must be positive");
        }
        validate_samples(&samples)?;

        let order = (0..samples.len()).collect();
        Ok(Self {
            samples,
            batch_size,
            shuffle: false,
            order,
            cursor: 0,
            rng: StdRng::seed_from_u64(0),
            device: device.clone(),
        })
    }

    /// Shuffle sample order at every `reset`, seeded for reproducibility.
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.shuffle = true;
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Load samples from a JSONL file, one [`PerformanceSample`] per line.
    pub fn load_jsonl(path: impl AsRef<Path>, batch_size: usize, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open dataset file {}", path.display()))?;
        let reader = std::io::BufReader::new(file);

        let mut samples = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let sample: PerformanceSample = serde_json::from_str(&line)
                .with_context(|| format!("Invalid sample on line {}", line_no + 1))?;
            samples.push(sample);
        }

        tracing::info!("Loaded {} samples from {}", samples.len(), path.display());
        Self::new(samples, batch_size, device)
    }

    /// Random quantised performances paired with jittered "humanised" copies.
    ///
    /// Sources sit on a coarse grid (multiples of 8); targets nudge every
    /// feature by up to ±3 within [0, N].
    pub fn synthetic(
        config: &HumaniseConfig,
        num_samples: usize,
        time: usize,
        batch_size: usize,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let max = config.note_feature_size as i64;

        let samples = (0..num_samples)
            .map(|_| {
                let source: Vec<Vec<u32>> = (0..time)
                    .map(|_| {
                        (0..config.note_features)
                            .map(|_| (rng.gen_range(0..=max) / 8 * 8) as u32)
                            .collect()
                    })
                    .collect();
                let target = source
                    .iter()
                    .map(|step| {
                        step.iter()
                            .map(|&note| (note as i64 + rng.gen_range(-3..=3)).clamp(0, max) as u32)
                            .collect()
                    })
                    .collect();
                PerformanceSample {
                    source,
                    target,
                    padding: Vec::new(),
                }
            })
            .collect();

        Self::new(samples, batch_size, device)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn get(&self, index: usize) -> Option<&PerformanceSample> {
        self.samples.get(index)
    }

    fn prepare_batch(&self, indices: &[usize]) -> Result<Batch> {
        let first = &self.samples[indices[0]];
        let source_time = first.source.len();
        let time = first.target.len();
        let features = first.target.first().map(|step| step.len()).unwrap_or(0);
        let batch_size = indices.len();

        let mut source = Vec::with_capacity(batch_size * source_time * features);
        let mut target = Vec::with_capacity(batch_size * time * features);
        let mut padding = Vec::with_capacity(batch_size);
        for &idx in indices {
            let sample = &self.samples[idx];
            source.extend(sample.source.iter().flatten().copied());
            target.extend(sample.target.iter().flatten().copied());
            padding.push(if sample.padding.is_empty() {
                vec![0u8; time]
            } else {
                sample.padding.clone()
            });
        }

        Ok(Batch {
            source: Tensor::from_vec(source, (batch_size, source_time, features), &self.device)?,
            target: Tensor::from_vec(target, (batch_size, time, features), &self.device)?,
            mask: CoderMask::with_padding(&padding, &self.device)?,
        })
    }
}

impl BatchSource for PerformanceDataset {
    fn reset(&mut self) -> Result<()> {
        self.cursor = 0;
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
        Ok(())
    }

    fn next_batch(&mut self) -> Result<Option<Batch>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }

        let end = (self.cursor + self.batch_size).min(self.order.len());
        let batch = self.prepare_batch(&self.order[self.cursor..end])?;
        self.cursor = end;
        Ok(Some(batch))
    }

    fn num_batches(&self) -> Option<usize> {
        Some((self.samples.len() + self.batch_size - 1) / self.batch_size)
    }
}

/// Every sample must share source length, target length and feature count.
fn validate_samples(samples: &[PerformanceSample]) -> Result<()> {
    let Some(first) = samples.first() else {
        return Ok(());
    };
    let source_time = first.source.len();
    let time = first.target.len();
    let features = first.target.first().map(|step| step.len()).unwrap_or(0);

    for (idx, sample) in samples.iter().enumerate() {
        if sample.source.len() != source_time || sample.target.len() != time {
            anyhow::bail!(
                "Sample {} has lengths (source {}, target {}), expected ({}, {})",
                idx,
                sample.source.len(),
                sample.target.len(),
                source_time,
                time
            );
        }
        let ragged = sample
            .source
            .iter()
            .chain(sample.target.iter())
            .any(|step| step.len() != features);
        if ragged {
            anyhow::bail!("Sample {} does not have {} features per step", idx, features);
        }
        if !sample.padding.is_empty() && sample.padding.len() != time {
            anyhow::bail!(
                "Sample {} padding covers {} steps, target has {}",
                idx,
                sample.padding.len(),
                time
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(value: u32, time: usize) -> PerformanceSample {
        PerformanceSample {
            source: vec![vec![value, value]; time],
            target: vec![vec![value + 1, value + 1]; time],
            padding: Vec::new(),
        }
    }

    #[test]
    fn test_batches_cover_dataset_once() -> Result<()> {
        let samples = (0..5).map(|v| sample(v, 4)).collect();
        let mut dataset = PerformanceDataset::new(samples, 2, &Device::Cpu)?;
        assert_eq!(dataset.num_batches(), Some(3));

        dataset.reset()?;
        let mut sizes = Vec::new();
        while let Some(batch) = dataset.next_batch()? {
            assert_eq!(batch.target.dims()[1..], [4, 2]);
            sizes.push(batch.batch_size()?);
        }
        assert_eq!(sizes, vec![2, 2, 1]);

        // restartable
        dataset.reset()?;
        assert!(dataset.next_batch()?.is_some());
        Ok(())
    }

    #[test]
    fn test_batch_keeps_sample_order() -> Result<()> {
        let samples = vec![sample(10, 3), sample(20, 3)];
        let mut dataset = PerformanceDataset::new(samples, 2, &Device::Cpu)?;

        dataset.reset()?;
        let batch = dataset.next_batch()?.unwrap();

        let source = batch.source.to_vec3::<u32>()?;
        assert_eq!(source[0][0], vec![10, 10]);
        assert_eq!(source[1][2], vec![20, 20]);
        assert_eq!(batch.mask.time_length()?, 3);
        Ok(())
    }

    #[test]
    fn test_shuffle_is_a_permutation() -> Result<()> {
        let samples = (0..8).map(|v| sample(v, 2)).collect();
        let mut dataset = PerformanceDataset::new(samples, 8, &Device::Cpu)?.with_shuffle(7);

        dataset.reset()?;
        let batch = dataset.next_batch()?.unwrap();
        let mut firsts: Vec<u32> = batch
            .source
            .to_vec3::<u32>()?
            .iter()
            .map(|s| s[0][0])
            .collect();
        firsts.sort();
        assert_eq!(firsts, (0..8).collect::<Vec<u32>>());
        Ok(())
    }

    #[test]
    fn test_rejects_ragged_samples() {
        let samples = vec![sample(0, 4), sample(0, 5)];
        assert!(PerformanceDataset::new(samples, 2, &Device::Cpu).is_err());
    }

    #[test]
    fn test_load_jsonl() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pairs.jsonl");
        let lines = [
            serde_json::to_string(&sample(1, 3))?,
            String::new(),
            serde_json::to_string(&PerformanceSample {
                padding: vec![0, 0, 1],
                ..sample(2, 3)
            })?,
        ];
        std::fs::write(&path, lines.join("\n"))?;

        let mut dataset = PerformanceDataset::load_jsonl(&path, 4, &Device::Cpu)?;
        assert_eq!(dataset.len(), 2);

        dataset.reset()?;
        let batch = dataset.next_batch()?.unwrap();
        assert_eq!(batch.mask.target_padding.to_vec2::<u8>()?[1], vec![0, 0, 1]);
        Ok(())
    }

    #[test]
    fn test_synthetic_within_range() -> Result<()> {
        let config = HumaniseConfig::tiny();
        let dataset = PerformanceDataset::synthetic(&config, 6, 10, 3, 42, &Device::Cpu)?;

        assert_eq!(dataset.len(), 6);
        let sample = dataset.get(0).unwrap();
        assert_eq!(sample.target.len(), 10);
        for (source, target) in sample.source.iter().zip(&sample.target) {
            for (&s, &t) in source.iter().zip(target) {
                assert!(t as usize <= config.note_feature_size);
                assert!((s as i64 - t as i64).abs() <= 3);
            }
        }
        Ok(())
    }
}
