//! Multi-head attention shared by the generator's encoder and decoder
//!
//! Self-attention passes the same sequence as query and memory; the decoder's
//! cross-attention passes the encoded source as memory.

use candle_core::{Device, Module, Result, Tensor, D};
use candle_nn::{Dropout, Linear, VarBuilder};

pub struct MultiHeadAttention {
    num_heads: usize,
    head_dim: usize,
    hidden_size: usize,

    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,

    dropout: Dropout,
}

impl MultiHeadAttention {
    pub fn new(hidden_size: usize, num_heads: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        if hidden_size % num_heads != 0 {
            candle_core::bail!(
                "hidden_size ({}) must be divisible by num_heads ({})",
                hidden_size,
                num_heads
            );
        }

        let head_dim = hidden_size / num_heads;

        let q_proj = candle_nn::linear(hidden_size, hidden_size, vb.pp("q_proj"))?;
        let k_proj = candle_nn::linear(hidden_size, hidden_size, vb.pp("k_proj"))?;
        let v_proj = candle_nn::linear(hidden_size, hidden_size, vb.pp("v_proj"))?;
        let o_proj = candle_nn::linear(hidden_size, hidden_size, vb.pp("o_proj"))?;

        Ok(Self {
            num_heads,
            head_dim,
            hidden_size,
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            dropout: Dropout::new(dropout),
        })
    }

    /// `query: [B, Tq, H]`, `memory: [B, Tk, H]`, `bias` broadcastable to `[B, heads, Tq, Tk]`.
    pub fn forward(
        &self,
        query: &Tensor,
        memory: &Tensor,
        bias: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let q = self.reshape_for_heads(&self.q_proj.forward(query)?)?;
        let k = self.reshape_for_heads(&self.k_proj.forward(memory)?)?;
        let v = self.reshape_for_heads(&self.v_proj.forward(memory)?)?;

        // Scaled dot-product attention
        let scale = (self.head_dim as f64).sqrt();
        let k_t = k.transpose(2, 3)?.contiguous()?;
        let scores = (q.matmul(&k_t)? / scale)?;

        let scores = match bias {
            Some(bias) => scores.broadcast_add(bias)?,
            None => scores,
        };

        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let probs = self.dropout.forward(&probs, train)?;

        let context = probs.matmul(&v)?;
        self.o_proj.forward(&self.reshape_from_heads(&context)?)
    }

    fn reshape_for_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, _) = x.dims3()?;
        x.reshape((batch_size, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn reshape_from_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (batch_size, _, seq_len, _) = x.dims4()?;
        x.transpose(1, 2)?
            .contiguous()?
            .reshape((batch_size, seq_len, self.hidden_size))
    }
}

/// Sinusoidal position table, `[seq_len, hidden_size]`.
pub fn positional_encoding(seq_len: usize, hidden_size: usize, device: &Device) -> Result<Tensor> {
    let mut table = vec![0.0f32; seq_len * hidden_size];

    for pos in 0..seq_len {
        for i in 0..hidden_size {
            let exponent = (2 * (i / 2)) as f32 / hidden_size as f32;
            let angle = pos as f32 / 10000f32.powf(exponent);
            table[pos * hidden_size + i] = if i % 2 == 0 { angle.sin() } else { angle.cos() };
        }
    }

    Tensor::from_vec(table, (seq_len, hidden_size), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    #[test]
    fn test_self_attention_shape() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let attn = MultiHeadAttention::new(32, 4, 0.0, vb)?;

        let hidden = Tensor::randn(0f32, 1.0, (2, 6, 32), &device)?;
        let output = attn.forward(&hidden, &hidden, None, false)?;

        assert_eq!(output.dims(), &[2, 6, 32]);
        Ok(())
    }

    #[test]
    fn test_cross_attention_takes_query_length() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let attn = MultiHeadAttention::new(16, 2, 0.0, vb)?;

        let query = Tensor::randn(0f32, 1.0, (3, 4, 16), &device)?;
        let memory = Tensor::randn(0f32, 1.0, (3, 9, 16), &device)?;
        let output = attn.forward(&query, &memory, None, false)?;

        assert_eq!(output.dims(), &[3, 4, 16]);
        Ok(())
    }

    #[test]
    fn test_rejects_uneven_heads() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        assert!(MultiHeadAttention::new(30, 4, 0.0, vb).is_err());
    }

    #[test]
    fn test_positional_encoding_origin() -> Result<()> {
        let table = positional_encoding(3, 4, &Device::Cpu)?.to_vec2::<f32>()?;
        assert_eq!(table[0], vec![0.0, 1.0, 0.0, 1.0]);
        Ok(())
    }
}
