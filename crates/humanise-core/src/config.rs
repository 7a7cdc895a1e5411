//! Humanise model configuration
//!
//! Note encoding constants plus the sizes of the reference networks

use serde::{Deserialize, Serialize};

use crate::error::{HumaniseError, HumaniseResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumaniseConfig {
    // Note encoding
    /// Largest integer value a note feature can take; features live in [0, N]
    pub note_feature_size: usize,
    /// Features per time step (pitch, velocity, onset, duration, ...)
    pub note_features: usize,
    /// Time steps in one window; generator input and expected output differ by this shift
    pub window_length: usize,

    // Reference networks
    pub hidden_size: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    pub intermediate_size: usize,
    pub discriminator_hidden_size: usize,
    pub dropout: f32,
    pub layer_norm_eps: f64,
    /// Negative slope of the discriminator's leaky ReLU
    pub leaky_slope: f64,
}

impl Default for HumaniseConfig {
    fn default() -> Self {
        Self {
            // MIDI data bytes are 7 bit
            note_feature_size: 127,
            note_features: 4,
            window_length: 16,

            hidden_size: 256,
            num_heads: 8,
            num_layers: 4,
            intermediate_size: 1024,
            discriminator_hidden_size: 128,
            dropout: 0.1,
            layer_norm_eps: 1e-5,
            leaky_slope: 0.2,
        }
    }
}

impl HumaniseConfig {
    /// Smallest useful networks, for smoke runs and tests
    pub fn tiny() -> Self {
        Self {
            window_length: 2,
            hidden_size: 32,
            num_heads: 4,
            num_layers: 1,
            intermediate_size: 64,
            discriminator_hidden_size: 16,
            ..Default::default()
        }
    }

    pub fn small() -> Self {
        Self {
            hidden_size: 128,
            num_heads: 4,
            num_layers: 2,
            intermediate_size: 512,
            discriminator_hidden_size: 64,
            ..Default::default()
        }
    }

    /// Builder: set the note feature cardinality
    pub fn with_note_feature_size(mut self, note_feature_size: usize) -> Self {
        self.note_feature_size = note_feature_size;
        self
    }

    /// Builder: set the shift between generator input and expected output
    pub fn with_window_length(mut self, window_length: usize) -> Self {
        self.window_length = window_length;
        self
    }

    /// Builder: disable stochastic layers
    pub fn without_dropout(mut self) -> Self {
        self.dropout = 0.0;
        self
    }

    pub fn validate(&self) -> HumaniseResult<()> {
        if self.note_feature_size == 0 {
            return Err(HumaniseError::InvalidConfig(
                "note_feature_size must be positive".to_string(),
            ));
        }

        if self.note_features == 0 {
            return Err(HumaniseError::InvalidConfig(
                "note_features must be positive".to_string(),
            ));
        }

        if self.window_length == 0 {
            return Err(HumaniseError::InvalidConfig(
                "window_length must be positive".to_string(),
            ));
        }

        if self.hidden_size % self.num_heads != 0 {
            return Err(HumaniseError::InvalidConfig(format!(
                "hidden_size ({}) must be divisible by num_heads ({})",
                self.hidden_size, self.num_heads
            )));
        }

        if !(0.0..1.0).contains(&self.dropout) {
            return Err(HumaniseError::InvalidConfig(
                "dropout must be in [0, 1)".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        assert!(HumaniseConfig::default().validate().is_ok());
        assert!(HumaniseConfig::tiny().validate().is_ok());
        assert!(HumaniseConfig::small().validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut invalid = HumaniseConfig::default();
        invalid.hidden_size = 250; // Not divisible by num_heads
        assert!(invalid.validate().is_err());

        let invalid = HumaniseConfig::default().with_window_length(0);
        assert!(invalid.validate().is_err());

        let mut invalid = HumaniseConfig::default();
        invalid.dropout = 1.0;
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let config = HumaniseConfig::tiny().with_note_feature_size(100);
        let json = serde_json::to_string(&config).unwrap();
        let back: HumaniseConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
