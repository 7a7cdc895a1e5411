//! Note feature scaling
//!
//! Integer note features in [0, N] map linearly onto [-1.0, 1.0]. The
//! discriminator only ever sees the signed range, so every real sequence must
//! pass through `normalise_note` with the same N the generator was built with.

use candle_core::{DType, Result, Tensor};

/// Map integer notes in [0, N] to f32 in [-1.0, 1.0]: `value / N * 2 - 1`.
pub fn normalise_note(note: &Tensor, note_feature_size: usize) -> Result<Tensor> {
    let n = note_feature_size as f64;
    ((note.to_dtype(DType::F32)? / n)? * 2.0)? - 1.0
}

/// Inverse of [`normalise_note`], rounded and clamped back to [0, N].
pub fn denormalise_note(normalised: &Tensor, note_feature_size: usize) -> Result<Tensor> {
    let n = note_feature_size as f64;
    ((normalised.to_dtype(DType::F32)? + 1.0)? * (n / 2.0))?
        .round()?
        .clamp(0f32, n as f32)?
        .to_dtype(DType::U32)
}
