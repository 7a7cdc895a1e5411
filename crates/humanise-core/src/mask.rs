//! Decoder masks and teacher-forcing shift
//!
//! The generator is trained autoregressively: its target input is the ground
//! truth without the last time window, and it is expected to produce the
//! ground truth without the first one. Both mask components shrink in
//! lockstep with the target's time axis.

use candle_core::{DType, Device, Tensor};

use crate::error::{HumaniseError, HumaniseResult};

/// Additive mask value for blocked attention positions
pub const MASKED: f32 = -1e9;

/// Masks consumed by the generator's decoder.
#[derive(Debug, Clone)]
pub struct CoderMask {
    /// `[batch, time]`, u8, 1 where the target time step is padding
    pub target_padding: Tensor,
    /// `[time, time]`, f32, additive (0 = visible, [`MASKED`] = blocked)
    pub target_attention: Tensor,
}

impl CoderMask {
    pub fn new(target_padding: Tensor, target_attention: Tensor) -> HumaniseResult<Self> {
        let mask = Self {
            target_padding,
            target_attention,
        };
        mask.time_length()?;
        Ok(mask)
    }

    /// Causal attention with no padding.
    pub fn causal(batch_size: usize, time: usize, device: &Device) -> HumaniseResult<Self> {
        let target_padding = Tensor::zeros((batch_size, time), DType::U8, device)?;
        Ok(Self {
            target_padding,
            target_attention: causal_attention(time, device)?,
        })
    }

    /// Causal attention over a per-sample padding layout (`[batch][time]`, 1 = padded).
    pub fn with_padding(padding: &[Vec<u8>], device: &Device) -> HumaniseResult<Self> {
        let batch_size = padding.len();
        let time = padding.first().map(|p| p.len()).unwrap_or(0);
        if let Some(row) = padding.iter().find(|p| p.len() != time) {
            return Err(HumaniseError::ShapeMismatch {
                what: "padding row",
                expected: vec![time],
                got: vec![row.len()],
            });
        }

        let flat: Vec<u8> = padding.iter().flatten().copied().collect();
        let target_padding = Tensor::from_vec(flat, (batch_size, time), device)?;
        Ok(Self {
            target_padding,
            target_attention: causal_attention(time, device)?,
        })
    }

    /// Time length shared by both components; errors when they disagree.
    pub fn time_length(&self) -> HumaniseResult<usize> {
        let (_, padding_time) = self.target_padding.dims2()?;
        let (rows, cols) = self.target_attention.dims2()?;
        if rows != cols || rows != padding_time {
            return Err(HumaniseError::ShapeMismatch {
                what: "target attention mask",
                expected: vec![padding_time, padding_time],
                got: vec![rows, cols],
            });
        }
        Ok(padding_time)
    }

    /// Key padding as an additive `[batch, 1, 1, time]` mask for attention scores.
    pub fn padding_bias(&self) -> HumaniseResult<Tensor> {
        let (batch_size, time) = self.target_padding.dims2()?;
        let bias = (self.target_padding.to_dtype(DType::F32)? * MASKED as f64)?;
        Ok(bias.reshape((batch_size, 1, 1, time))?)
    }

    /// Attention plus padding, broadcastable to `[batch, heads, time, time]`.
    pub fn decoder_bias(&self) -> HumaniseResult<Tensor> {
        let (rows, cols) = self.target_attention.dims2()?;
        let attention = self.target_attention.reshape((1, 1, rows, cols))?;
        Ok(attention.broadcast_add(&self.padding_bias()?)?)
    }
}

/// Generator input and expected output derived from one target.
#[derive(Debug, Clone)]
pub struct ShiftedTarget {
    /// `target[:, 0:T-W, :]`
    pub input: Tensor,
    /// `target[:, W:T, :]`
    pub expected: Tensor,
}

/// Shift `target` by one window for teacher forcing and shrink `mask` to match.
///
/// The original mask is left untouched; the returned mask has its trailing
/// `window` padding columns and attention rows/columns removed.
pub fn shift_target(
    target: &Tensor,
    mask: &CoderMask,
    window: usize,
) -> HumaniseResult<(ShiftedTarget, CoderMask)> {
    let (batch_size, time, _) = target.dims3()?;
    if time <= window {
        return Err(HumaniseError::SequenceTooShort { time, window });
    }

    let mask_time = mask.time_length()?;
    let (mask_batch, _) = mask.target_padding.dims2()?;
    if mask_time != time || mask_batch != batch_size {
        return Err(HumaniseError::ShapeMismatch {
            what: "target padding mask",
            expected: vec![batch_size, time],
            got: vec![mask_batch, mask_time],
        });
    }

    let kept = time - window;
    let shifted = ShiftedTarget {
        input: target.narrow(1, 0, kept)?,
        expected: target.narrow(1, window, kept)?,
    };
    let mask = CoderMask {
        target_padding: mask.target_padding.narrow(1, 0, kept)?,
        target_attention: mask.target_attention.narrow(0, 0, kept)?.narrow(1, 0, kept)?,
    };

    Ok((shifted, mask))
}

fn causal_attention(time: usize, device: &Device) -> HumaniseResult<Tensor> {
    let mut mask_data = vec![0.0f32; time * time];

    for i in 0..time {
        for j in (i + 1)..time {
            mask_data[i * time + j] = MASKED;
        }
    }

    Ok(Tensor::from_vec(mask_data, (time, time), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_target(batch_size: usize, time: usize, features: usize) -> HumaniseResult<Tensor> {
        let data: Vec<u32> = (0..(batch_size * time * features) as u32).collect();
        Ok(Tensor::from_vec(data, (batch_size, time, features), &Device::Cpu)?)
    }

    #[test]
    fn test_shift_lengths() -> HumaniseResult<()> {
        let target = ramp_target(2, 10, 3)?;
        let mask = CoderMask::causal(2, 10, &Device::Cpu)?;

        let (shifted, _) = shift_target(&target, &mask, 4)?;

        assert_eq!(shifted.input.dims(), &[2, 6, 3]);
        assert_eq!(shifted.expected.dims(), &[2, 6, 3]);
        Ok(())
    }

    #[test]
    fn test_shift_alignment() -> HumaniseResult<()> {
        let window = 3;
        let target = ramp_target(2, 8, 2)?;
        let mask = CoderMask::causal(2, 8, &Device::Cpu)?;

        let (shifted, _) = shift_target(&target, &mask, window)?;

        let original = target.to_vec3::<u32>()?;
        let input = shifted.input.to_vec3::<u32>()?;
        let expected = shifted.expected.to_vec3::<u32>()?;
        for b in 0..2 {
            for t in 0..(8 - window) {
                assert_eq!(input[b][t], original[b][t]);
                assert_eq!(expected[b][t], original[b][t + window]);
            }
        }
        Ok(())
    }

    #[test]
    fn test_mask_shrinks_and_stays_square() -> HumaniseResult<()> {
        let target = ramp_target(3, 12, 4)?;
        let mask = CoderMask::causal(3, 12, &Device::Cpu)?;

        let (_, shifted_mask) = shift_target(&target, &mask, 5)?;

        assert_eq!(shifted_mask.target_padding.dims(), &[3, 7]);
        assert_eq!(shifted_mask.target_attention.dims(), &[7, 7]);
        assert_eq!(shifted_mask.time_length()?, 7);
        // the caller's mask is not touched
        assert_eq!(mask.target_attention.dims(), &[12, 12]);
        Ok(())
    }

    #[test]
    fn test_shifted_mask_keeps_leading_entries() -> HumaniseResult<()> {
        let padding = vec![vec![0, 0, 0, 1, 1], vec![0, 0, 0, 0, 1]];
        let mask = CoderMask::with_padding(&padding, &Device::Cpu)?;
        let target = ramp_target(2, 5, 1)?;

        let (_, shifted_mask) = shift_target(&target, &mask, 2)?;

        assert_eq!(
            shifted_mask.target_padding.to_vec2::<u8>()?,
            vec![vec![0, 0, 0], vec![0, 0, 0]]
        );
        let attention = shifted_mask.target_attention.to_vec2::<f32>()?;
        assert_eq!(attention[0], vec![0.0, MASKED, MASKED]);
        assert_eq!(attention[2], vec![0.0, 0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_shift_rejects_short_sequence() -> HumaniseResult<()> {
        let target = ramp_target(1, 4, 2)?;
        let mask = CoderMask::causal(1, 4, &Device::Cpu)?;

        let result = shift_target(&target, &mask, 4);

        assert!(matches!(
            result,
            Err(HumaniseError::SequenceTooShort { time: 4, window: 4 })
        ));
        Ok(())
    }

    #[test]
    fn test_shift_rejects_mismatched_mask() -> HumaniseResult<()> {
        let target = ramp_target(2, 8, 2)?;
        let mask = CoderMask::causal(2, 6, &Device::Cpu)?;

        assert!(matches!(
            shift_target(&target, &mask, 2),
            Err(HumaniseError::ShapeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_decoder_bias_blocks_padding() -> HumaniseResult<()> {
        let padding = vec![vec![0, 0, 1]];
        let mask = CoderMask::with_padding(&padding, &Device::Cpu)?;

        let bias = mask.decoder_bias()?;

        assert_eq!(bias.dims(), &[1, 1, 3, 3]);
        let rows = bias.squeeze(0)?.squeeze(0)?.to_vec2::<f32>()?;
        assert_eq!(rows[2][0], 0.0);
        assert!(rows[2][2] < -1e8);
        Ok(())
    }
}
