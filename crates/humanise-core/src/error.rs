//! Error types for note encoding, masking and buffer bookkeeping

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HumaniseError {
    #[error("Shape mismatch for {what}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Sequence too short: time length {time} must exceed window length {window}")]
    SequenceTooShort { time: usize, window: usize },

    #[error("Label buffer holds {capacity} entries, batch of {requested} requested")]
    LabelCapacity { requested: usize, capacity: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Checkpoint has no entry `{0}`")]
    MissingCheckpointEntry(String),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub type HumaniseResult<T> = std::result::Result<T, HumaniseError>;
