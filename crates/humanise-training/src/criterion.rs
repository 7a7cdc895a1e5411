//! Binary cross-entropy over discriminator probabilities

use candle_core::{Device, Result, Tensor};
use std::collections::HashMap;

/// Log-probabilities are floored here, so a saturated discriminator costs 100
/// per sample instead of infinity.
const LOG_FLOOR: f32 = -100.0;

/// Floor of `p * (1 - p)` in the gradient denominator.
const GRAD_EPSILON: f32 = 1e-12;

const WEIGHT: &str = "weight";

/// Mean binary cross-entropy with an optional per-sample rescaling weight.
///
/// The weight is the criterion's only state and travels with checkpoints.
#[derive(Debug, Clone, Default)]
pub struct BceLoss {
    weight: Option<Tensor>,
}

impl BceLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_weight(weight: Tensor) -> Self {
        Self {
            weight: Some(weight),
        }
    }

    pub fn weight(&self) -> Option<&Tensor> {
        self.weight.as_ref()
    }

    /// `-mean(w * (y * log(p) + (1 - y) * log(1 - p)))`, each log floored at -100.
    ///
    /// The gradient with respect to `p` is `w * (p - y) / max(p * (1 - p), 1e-12) / n`,
    /// which stays finite and non-zero when `p` saturates at 0 or 1.
    pub fn forward(&self, probabilities: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let p = probabilities.detach();
        let not_p = p.affine(-1.0, 1.0)?;
        let log_p = p.log()?.clamp(LOG_FLOOR, 0f32)?;
        let log_not_p = not_p.log()?.clamp(LOG_FLOOR, 0f32)?;

        let value = (targets.mul(&log_p)? + targets.affine(-1.0, 1.0)?.mul(&log_not_p)?)?.neg()?;
        let slope = (p.sub(targets)? / p.mul(&not_p)?.clamp(GRAD_EPSILON, 1f32)?)?;
        // zero in value, carries `slope` back to the probabilities
        let gradient = probabilities.sub(&p)?.mul(&slope)?;

        let per_sample = (value + gradient)?;
        let per_sample = match &self.weight {
            Some(weight) => per_sample.broadcast_mul(weight)?,
            None => per_sample,
        };

        per_sample.mean_all()
    }

    pub fn state_dict(&self) -> HashMap<String, Tensor> {
        let mut dict = HashMap::new();
        if let Some(weight) = &self.weight {
            dict.insert(WEIGHT.to_string(), weight.clone());
        }
        dict
    }

    pub fn load_state_dict(&mut self, dict: &HashMap<String, Tensor>, device: &Device) -> Result<()> {
        self.weight = dict
            .get(WEIGHT)
            .map(|weight| weight.to_device(device))
            .transpose()?;
        Ok(())
    }
}
