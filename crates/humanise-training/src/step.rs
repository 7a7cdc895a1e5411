//! Adversarial step engine
//!
//! One training step is two ordered phases over the same batch:
//!
//! 1. **Discriminator phase**: real notes scored against REAL labels, the
//!    detached generator output scored against FAKE labels; both backward
//!    passes accumulate before a single discriminator update.
//! 2. **Generator phase**: the (non-detached) generator output is re-scored
//!    by the freshly updated discriminator against REAL labels, then the
//!    generator is updated.

use anyhow::Result;
use candle_core::{Device, Tensor, Var};

use humanise_core::{normalise_note, shift_target, CoderMask, Discriminator, Generator, ShiftedTarget};
use humanise_optimizer::{named_vars, Adam, Gradients};

use crate::config::TrainerConfig;
use crate::criterion::BceLoss;
use crate::dataset::Batch;
use crate::label::{LabelBuffer, FAKE_LABEL, REAL_LABEL};

/// Scalars produced by one training batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainStepMetrics {
    pub loss_d: f64,
    pub loss_g: f64,
    /// Mean discriminator score on real notes
    pub d_x: f64,
    /// Mean score on generated notes before the discriminator update
    pub d_g_z1: f64,
    /// Mean score on generated notes after the discriminator update
    pub d_g_z2: f64,
}

impl TrainStepMetrics {
    pub fn scalars(&self) -> [(&'static str, f64); 5] {
        [
            ("Loss(D)", self.loss_d),
            ("Loss(G)", self.loss_g),
            ("D(x)", self.d_x),
            ("D(G(z1))", self.d_g_z1),
            ("D(G(z2))", self.d_g_z2),
        ]
    }
}

/// Scalars produced by one validation batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationStepMetrics {
    pub loss_d: f64,
    pub loss_g: f64,
    pub d_x: f64,
    pub d_g_z: f64,
}

impl ValidationStepMetrics {
    pub fn scalars(&self) -> [(&'static str, f64); 4] {
        [
            ("Loss(D)", self.loss_d),
            ("Loss(G)", self.loss_g),
            ("D(x)", self.d_x),
            ("D(G(z))", self.d_g_z),
        ]
    }
}

/// Discriminator phase output the generator phase consumes.
struct DiscriminatorPhase {
    generated: Tensor,
    loss: f64,
    d_x: f64,
    d_g_z1: f64,
}

/// Generator and discriminator with their optimisers, gradient accumulators,
/// shared criterion and label storage.
pub struct AdversarialPair<G, D> {
    generator: G,
    discriminator: D,
    generator_params: Vec<(String, Var)>,
    discriminator_params: Vec<(String, Var)>,
    generator_optimiser: Adam,
    discriminator_optimiser: Adam,
    generator_grads: Gradients,
    discriminator_grads: Gradients,
    criterion: BceLoss,
    labels: LabelBuffer,
    note_feature_size: usize,
    window_length: usize,
}

impl<G: Generator, D: Discriminator> AdversarialPair<G, D> {
    pub fn new(generator: G, discriminator: D, config: &TrainerConfig, device: &Device) -> Result<Self> {
        let generator_params = named_vars(generator.varmap())?;
        let discriminator_params = named_vars(discriminator.varmap())?;

        Ok(Self {
            generator,
            discriminator,
            generator_params,
            discriminator_params,
            generator_optimiser: Adam::new(config.generator_optimiser.clone()),
            discriminator_optimiser: Adam::new(config.discriminator_optimiser.clone()),
            generator_grads: Gradients::new(),
            discriminator_grads: Gradients::new(),
            criterion: BceLoss::new(),
            labels: LabelBuffer::new(config.batch_size, device),
            note_feature_size: config.model.note_feature_size,
            window_length: config.model.window_length,
        })
    }

    pub fn train_step(&mut self, batch: &Batch) -> Result<TrainStepMetrics> {
        let batch_size = batch.batch_size()?;
        let (shifted, mask) = shift_target(&batch.target, &batch.mask, self.window_length)?;

        let discriminated = self.discriminator_phase(&batch.source, &shifted, &mask, batch_size)?;
        let (loss_g, d_g_z2) = self.generator_phase(&discriminated.generated, batch_size)?;

        Ok(TrainStepMetrics {
            loss_d: discriminated.loss,
            loss_g,
            d_x: discriminated.d_x,
            d_g_z1: discriminated.d_g_z1,
            d_g_z2,
        })
    }

    fn discriminator_phase(
        &mut self,
        source: &Tensor,
        shifted: &ShiftedTarget,
        mask: &CoderMask,
        batch_size: usize,
    ) -> Result<DiscriminatorPhase> {
        self.discriminator_grads.clear();

        let real = normalise_note(&shifted.expected, self.note_feature_size)?;
        let label = self.labels.fill(batch_size, REAL_LABEL)?;
        let score_real = self.discriminator.forward(&real)?;
        let err_real = self.criterion.forward(&score_real, &label)?;
        self.discriminator_grads
            .backward(&err_real, &self.discriminator_params)?;
        let d_x = mean(&score_real)?;

        let label = self.labels.fill(batch_size, FAKE_LABEL)?;
        let generated = self.generator.forward(source, &shifted.input, mask)?;
        let score_fake = self.discriminator.forward(&generated.detach())?;
        let err_fake = self.criterion.forward(&score_fake, &label)?;
        self.discriminator_grads
            .backward(&err_fake, &self.discriminator_params)?;
        let d_g_z1 = mean(&score_fake)?;

        let loss = scalar(&err_real)? + scalar(&err_fake)?;
        self.discriminator_optimiser
            .step(&self.discriminator_params, &self.discriminator_grads)?;

        Ok(DiscriminatorPhase {
            generated,
            loss,
            d_x,
            d_g_z1,
        })
    }

    /// Returns `(Loss(G), D(G(z2)))`.
    fn generator_phase(&mut self, generated: &Tensor, batch_size: usize) -> Result<(f64, f64)> {
        self.generator_grads.clear();

        let label = self.labels.fill(batch_size, REAL_LABEL)?;
        let score_generated = self.discriminator.forward(generated)?;
        let err_generated = self.criterion.forward(&score_generated, &label)?;
        self.generator_grads
            .backward(&err_generated, &self.generator_params)?;
        let d_g_z2 = mean(&score_generated)?;

        self.generator_optimiser
            .step(&self.generator_params, &self.generator_grads)?;

        Ok((scalar(&err_generated)?, d_g_z2))
    }

    /// Same forwards as [`Self::train_step`], all outputs detached, nothing updated.
    pub fn validate_step(&mut self, batch: &Batch) -> Result<ValidationStepMetrics> {
        let batch_size = batch.batch_size()?;
        let (shifted, mask) = shift_target(&batch.target, &batch.mask, self.window_length)?;

        let real = normalise_note(&shifted.expected, self.note_feature_size)?;
        let label = self.labels.fill(batch_size, REAL_LABEL)?;
        let score_real = self.discriminator.forward(&real)?.detach();
        let err_real = self.criterion.forward(&score_real, &label)?;

        let label = self.labels.fill(batch_size, FAKE_LABEL)?;
        let generated = self
            .generator
            .forward(&batch.source, &shifted.input, &mask)?
            .detach();
        let score_fake = self.discriminator.forward(&generated)?.detach();
        let err_fake = self.criterion.forward(&score_fake, &label)?;

        Ok(ValidationStepMetrics {
            loss_d: scalar(&err_real)?,
            loss_g: scalar(&err_fake)?,
            d_x: mean(&score_real)?,
            d_g_z: mean(&score_fake)?,
        })
    }

    /// Switch both networks between training and inference behaviour.
    pub fn set_training(&mut self, training: bool) {
        self.generator.set_training(training);
        self.discriminator.set_training(training);
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    pub fn discriminator(&self) -> &D {
        &self.discriminator
    }

    pub fn generator_params(&self) -> &[(String, Var)] {
        &self.generator_params
    }

    pub fn discriminator_params(&self) -> &[(String, Var)] {
        &self.discriminator_params
    }

    pub fn generator_optimiser(&self) -> &Adam {
        &self.generator_optimiser
    }

    pub fn generator_optimiser_mut(&mut self) -> &mut Adam {
        &mut self.generator_optimiser
    }

    pub fn discriminator_optimiser(&self) -> &Adam {
        &self.discriminator_optimiser
    }

    pub fn discriminator_optimiser_mut(&mut self) -> &mut Adam {
        &mut self.discriminator_optimiser
    }

    pub fn criterion(&self) -> &BceLoss {
        &self.criterion
    }

    pub fn criterion_mut(&mut self) -> &mut BceLoss {
        &mut self.criterion
    }

    pub fn labels(&self) -> &LabelBuffer {
        &self.labels
    }
}

fn scalar(loss: &Tensor) -> candle_core::Result<f64> {
    Ok(loss.to_scalar::<f32>()? as f64)
}

fn mean(scores: &Tensor) -> candle_core::Result<f64> {
    Ok(scores.mean_all()?.to_scalar::<f32>()? as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{BatchSource, PerformanceDataset};
    use humanise_core::{BuildNetwork, HumaniseError, Network, NoteDiscriminator, NoteTransformer};

    fn pair(config: &TrainerConfig) -> Result<AdversarialPair<NoteTransformer, NoteDiscriminator>> {
        let device = Device::Cpu;
        let generator = NoteTransformer::build(&config.model, &device)?;
        let discriminator = NoteDiscriminator::build(&config.model, &device)?;
        AdversarialPair::new(generator, discriminator, config, &device)
    }

    fn first_batch(config: &TrainerConfig, batch_size: usize) -> Result<Batch> {
        let mut data =
            PerformanceDataset::synthetic(&config.model, batch_size, 6, batch_size, 3, &Device::Cpu)?;
        data.reset()?;
        data.next_batch()?
            .ok_or_else(|| anyhow::anyhow!("synthetic dataset is empty"))
    }

    fn snapshot(params: &[(String, Var)]) -> Result<Vec<Vec<f32>>> {
        params
            .iter()
            .map(|(_, var)| -> Result<Vec<f32>> { Ok(var.as_tensor().flatten_all()?.to_vec1::<f32>()?) })
            .collect()
    }

    #[test]
    fn test_train_step_updates_both_networks() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = TrainerConfig::tiny(dir.path());
        let mut pair = pair(&config)?;
        let batch = first_batch(&config, 4)?;

        let generator_before = snapshot(pair.generator_params())?;
        let discriminator_before = snapshot(pair.discriminator_params())?;

        let metrics = pair.train_step(&batch)?;

        assert_ne!(snapshot(pair.generator_params())?, generator_before);
        assert_ne!(snapshot(pair.discriminator_params())?, discriminator_before);
        assert_eq!(pair.generator_optimiser().get_step(), 1);
        assert_eq!(pair.discriminator_optimiser().get_step(), 1);

        for (name, value) in metrics.scalars() {
            assert!(value.is_finite(), "{} is not finite", name);
        }
        for score in [metrics.d_x, metrics.d_g_z1, metrics.d_g_z2] {
            assert!((0.0..=1.0).contains(&score));
        }
        Ok(())
    }

    #[test]
    fn test_validate_step_changes_nothing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = TrainerConfig::tiny(dir.path());
        let mut pair = pair(&config)?;
        pair.set_training(false);
        let batch = first_batch(&config, 3)?;

        let generator_before = snapshot(pair.generator_params())?;
        let discriminator_before = snapshot(pair.discriminator_params())?;

        let first = pair.validate_step(&batch)?;
        let second = pair.validate_step(&batch)?;

        assert_eq!(snapshot(pair.generator_params())?, generator_before);
        assert_eq!(snapshot(pair.discriminator_params())?, discriminator_before);
        assert_eq!(pair.generator_optimiser().get_step(), 0);
        // inference mode is deterministic
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn test_validation_loss_d_scores_real_notes_only() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = TrainerConfig::tiny(dir.path());
        let mut pair = pair(&config)?;
        pair.set_training(false);
        let batch = first_batch(&config, 3)?;

        let metrics = pair.validate_step(&batch)?;

        let (shifted, _) = shift_target(&batch.target, &batch.mask, config.model.window_length)?;
        let real = normalise_note(&shifted.expected, config.model.note_feature_size)?;
        let score_real = pair.discriminator().forward(&real)?;
        let ones = Tensor::ones(score_real.dims(), score_real.dtype(), &Device::Cpu)?;
        let expected = scalar(&BceLoss::new().forward(&score_real, &ones)?)?;

        assert!(
            (metrics.loss_d - expected).abs() < 1e-6,
            "Loss(D) {} != BCE(D(x), REAL) {}",
            metrics.loss_d,
            expected
        );
        assert!((metrics.d_x - mean(&score_real)?).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_set_training_switches_both() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut pair = pair(&TrainerConfig::tiny(dir.path()))?;

        pair.set_training(false);
        assert!(!pair.generator().is_training());
        assert!(!pair.discriminator().is_training());

        pair.set_training(true);
        assert!(pair.generator().is_training() && pair.discriminator().is_training());
        Ok(())
    }

    #[test]
    fn test_rejects_batch_over_capacity() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = TrainerConfig::tiny(dir.path()).with_batch_size(2);
        let mut pair = pair(&config)?;
        let batch = first_batch(&config, 3)?;

        assert!(pair.train_step(&batch).is_err());
        Ok(())
    }

    #[test]
    fn test_rejects_sequence_not_longer_than_window() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = TrainerConfig::tiny(dir.path());
        config.model.window_length = 6;
        let mut pair = pair(&config)?;
        let batch = first_batch(&config, 2)?;

        let err = pair.validate_step(&batch).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HumaniseError>(),
            Some(HumaniseError::SequenceTooShort { time: 6, window: 6 })
        ));
        Ok(())
    }
}
