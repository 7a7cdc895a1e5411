//! Reference discriminator: per-step MLP, mean pooled over time, sigmoid head

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{Dropout, Linear, VarBuilder, VarMap};

use crate::config::HumaniseConfig;
use crate::layers::{leaky_relu, sigmoid};
use crate::network::{BuildNetwork, Discriminator, Network};

pub struct NoteDiscriminator {
    varmap: VarMap,
    training: bool,
    leaky_slope: f64,

    input_proj: Linear,
    hidden_proj: Linear,
    dropout: Dropout,
    score_head: Linear,
}

impl NoteDiscriminator {
    pub fn new(config: &HumaniseConfig, varmap: VarMap, device: &Device) -> Result<Self> {
        config
            .validate()
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;

        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let hidden = config.discriminator_hidden_size;

        Ok(Self {
            input_proj: candle_nn::linear(config.note_features, hidden, vb.pp("input_proj"))?,
            hidden_proj: candle_nn::linear(hidden, hidden, vb.pp("hidden_proj"))?,
            score_head: candle_nn::linear(hidden, 1, vb.pp("score_head"))?,
            dropout: Dropout::new(config.dropout),
            leaky_slope: config.leaky_slope,
            training: true,
            varmap,
        })
    }
}

impl Network for NoteDiscriminator {
    fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

impl Discriminator for NoteDiscriminator {
    fn forward(&self, sequence: &Tensor) -> Result<Tensor> {
        let hidden = leaky_relu(&self.input_proj.forward(sequence)?, self.leaky_slope)?;
        let hidden = self.dropout.forward(&hidden, self.training)?;
        let hidden = leaky_relu(&self.hidden_proj.forward(&hidden)?, self.leaky_slope)?;

        // [B, T, H] -> [B, H]
        let pooled = hidden.mean(1)?;
        let logits = self.score_head.forward(&pooled)?.squeeze(1)?;
        sigmoid(&logits)
    }
}

impl BuildNetwork for NoteDiscriminator {
    fn build(config: &HumaniseConfig, device: &Device) -> Result<Self> {
        Self::new(config, VarMap::new(), device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scores_one_probability_per_sample() -> Result<()> {
        let device = Device::Cpu;
        let config = HumaniseConfig::tiny();
        let discriminator = NoteDiscriminator::build(&config, &device)?;

        let sequence = Tensor::rand(-1f32, 1.0, (3, 7, config.note_features), &device)?;
        let scores = discriminator.forward(&sequence)?;

        assert_eq!(scores.dims(), &[3]);
        for score in scores.to_vec1::<f32>()? {
            assert!((0.0..=1.0).contains(&score));
        }
        Ok(())
    }

    #[test]
    fn test_mode_toggle() -> Result<()> {
        let mut discriminator = NoteDiscriminator::build(&HumaniseConfig::tiny(), &Device::Cpu)?;
        assert!(discriminator.is_training());
        discriminator.set_training(false);
        assert!(!discriminator.is_training());
        Ok(())
    }
}
