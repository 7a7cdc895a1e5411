//! Interfaces the training loop needs from the two adversaries
//!
//! Both networks own their parameters through a `VarMap` so optimisers and
//! checkpoints can address every tensor by name.

use candle_core::{Device, Result, Tensor};
use candle_nn::VarMap;

use crate::config::HumaniseConfig;
use crate::mask::CoderMask;

pub trait Network {
    fn varmap(&self) -> &VarMap;

    /// Toggle stochastic layers (dropout) on or off.
    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;
}

/// Produces a humanised sequence from a quantised source and a teacher-forced target prefix.
pub trait Generator: Network {
    /// `source: [B, Ts, F]`, `target_input: [B, T, F]` (u32 notes) -> `[B, T, F]` in [-1, 1]
    fn forward(&self, source: &Tensor, target_input: &Tensor, mask: &CoderMask) -> Result<Tensor>;
}

/// Scores how humanised a normalised sequence looks.
pub trait Discriminator: Network {
    /// `[B, T, F]` f32 in [-1, 1] -> `[B]` probabilities
    fn forward(&self, sequence: &Tensor) -> Result<Tensor>;
}

/// Fresh, randomly initialised construction from configuration.
pub trait BuildNetwork: Sized {
    fn build(config: &HumaniseConfig, device: &Device) -> Result<Self>;
}
