//! Building blocks for the reference networks
//!
//! Layer norm is written out with primitive ops so gradients flow through it
//! into the generator during the adversarial phase.

use candle_core::{Module, Result, Tensor, D};
use candle_nn::{Dropout, Init, Linear, VarBuilder};

pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(size, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }
}

impl Module for LayerNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mean = xs.mean_keepdim(D::Minus1)?;
        let centered = xs.broadcast_sub(&mean)?;
        let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        normed.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)
    }
}

/// Position-wise two-layer MLP with GELU.
pub struct FeedForward {
    up_proj: Linear,
    down_proj: Linear,
    dropout: Dropout,
}

impl FeedForward {
    pub fn new(
        hidden_size: usize,
        intermediate_size: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            up_proj: candle_nn::linear(hidden_size, intermediate_size, vb.pp("up_proj"))?,
            down_proj: candle_nn::linear(intermediate_size, hidden_size, vb.pp("down_proj"))?,
            dropout: Dropout::new(dropout),
        })
    }

    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let hidden = self.up_proj.forward(xs)?.gelu()?;
        let hidden = self.dropout.forward(&hidden, train)?;
        self.down_proj.forward(&hidden)
    }
}

/// Logistic sigmoid from primitive ops; logits are clamped to ±30 so `exp` stays finite.
pub fn sigmoid(xs: &Tensor) -> Result<Tensor> {
    (xs.clamp(-30f32, 30f32)?.neg()?.exp()? + 1.0)?.recip()
}

pub fn leaky_relu(xs: &Tensor, negative_slope: f64) -> Result<Tensor> {
    xs.maximum(&(xs * negative_slope)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_layer_norm_statistics() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = LayerNorm::new(4, 1e-5, vb)?;

        let xs = Tensor::new(&[[1f32, 2.0, 3.0, 4.0], [10.0, 10.0, 10.0, 14.0]], &device)?;
        let normed = norm.forward(&xs)?;

        let means = normed.mean_keepdim(D::Minus1)?.flatten_all()?.to_vec1::<f32>()?;
        for mean in means {
            assert!(mean.abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_sigmoid_values() -> Result<()> {
        let xs = Tensor::new(&[0f32, 100.0, -100.0], &Device::Cpu)?;
        let ys = sigmoid(&xs)?.to_vec1::<f32>()?;
        assert!((ys[0] - 0.5).abs() < 1e-6);
        assert!((ys[1] - 1.0).abs() < 1e-6);
        assert!(ys[2].abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_leaky_relu() -> Result<()> {
        let xs = Tensor::new(&[-2f32, 0.0, 3.0], &Device::Cpu)?;
        let ys = leaky_relu(&xs, 0.2)?.to_vec1::<f32>()?;
        assert_eq!(ys, vec![-0.4, 0.0, 3.0]);
        Ok(())
    }
}
