//! Reference generator: an encoder-decoder transformer over note windows
//!
//! The encoder reads the quantised source; the decoder reads the teacher-forced
//! target prefix under the causal/padding mask and cross-attends to the source.
//! Output notes are squashed into the signed normalised range with `tanh`.

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{Dropout, Linear, VarBuilder, VarMap};

use crate::attention::{positional_encoding, MultiHeadAttention};
use crate::config::HumaniseConfig;
use crate::layers::{FeedForward, LayerNorm};
use crate::mask::CoderMask;
use crate::network::{BuildNetwork, Generator, Network};
use crate::note::normalise_note;

pub struct NoteTransformer {
    config: HumaniseConfig,
    varmap: VarMap,
    training: bool,

    source_proj: Linear,
    target_proj: Linear,
    embedding_dropout: Dropout,
    encoder_layers: Vec<EncoderLayer>,
    decoder_layers: Vec<DecoderLayer>,
    final_norm: LayerNorm,
    output_proj: Linear,
}

impl NoteTransformer {
    pub fn new(config: HumaniseConfig, varmap: VarMap, device: &Device) -> Result<Self> {
        config
            .validate()
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;

        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let source_proj = candle_nn::linear(config.note_features, config.hidden_size, vb.pp("source_proj"))?;
        let target_proj = candle_nn::linear(config.note_features, config.hidden_size, vb.pp("target_proj"))?;

        let mut encoder_layers = Vec::with_capacity(config.num_layers);
        let mut decoder_layers = Vec::with_capacity(config.num_layers);
        for layer_idx in 0..config.num_layers {
            encoder_layers.push(EncoderLayer::new(&config, vb.pp(format!("encoder.{}", layer_idx)))?);
            decoder_layers.push(DecoderLayer::new(&config, vb.pp(format!("decoder.{}", layer_idx)))?);
        }

        let final_norm = LayerNorm::new(config.hidden_size, config.layer_norm_eps, vb.pp("final_norm"))?;
        let output_proj = candle_nn::linear(config.hidden_size, config.note_features, vb.pp("output_proj"))?;

        Ok(Self {
            embedding_dropout: Dropout::new(config.dropout),
            config,
            varmap,
            training: true,
            source_proj,
            target_proj,
            encoder_layers,
            decoder_layers,
            final_norm,
            output_proj,
        })
    }

    pub fn config(&self) -> &HumaniseConfig {
        &self.config
    }

    /// Normalise, project and add positions: `[B, T, F] (u32) -> [B, T, H]`.
    fn embed(&self, notes: &Tensor, proj: &Linear) -> Result<Tensor> {
        let (_, seq_len, _) = notes.dims3()?;
        let normalised = normalise_note(notes, self.config.note_feature_size)?;
        let positions = positional_encoding(seq_len, self.config.hidden_size, notes.device())?;
        let embedded = proj.forward(&normalised)?.broadcast_add(&positions)?;
        self.embedding_dropout.forward(&embedded, self.training)
    }
}

impl Network for NoteTransformer {
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

impl Generator for NoteTransformer {
    fn forward(&self, source: &Tensor, target_input: &Tensor, mask: &CoderMask) -> Result<Tensor> {
        let mut memory = self.embed(source, &self.source_proj)?;
        for layer in &self.encoder_layers {
            memory = layer.forward(&memory, self.training)?;
        }

        let bias = mask
            .decoder_bias()
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;

        let mut hidden = self.embed(target_input, &self.target_proj)?;
        for layer in &self.decoder_layers {
            hidden = layer.forward(&hidden, &memory, &bias, self.training)?;
        }

        let hidden = self.final_norm.forward(&hidden)?;
        self.output_proj.forward(&hidden)?.tanh()
    }
}

impl BuildNetwork for NoteTransformer {
    fn build(config: &HumaniseConfig, device: &Device) -> Result<Self> {
        Self::new(config.clone(), VarMap::new(), device)
    }
}

struct EncoderLayer {
    attention: MultiHeadAttention,
    ffn: FeedForward,
    attention_norm: LayerNorm,
    ffn_norm: LayerNorm,
}

impl EncoderLayer {
    fn new(config: &HumaniseConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            attention: MultiHeadAttention::new(
                config.hidden_size,
                config.num_heads,
                config.dropout,
                vb.pp("attention"),
            )?,
            ffn: FeedForward::new(
                config.hidden_size,
                config.intermediate_size,
                config.dropout,
                vb.pp("ffn"),
            )?,
            attention_norm: LayerNorm::new(config.hidden_size, config.layer_norm_eps, vb.pp("attention_norm"))?,
            ffn_norm: LayerNorm::new(config.hidden_size, config.layer_norm_eps, vb.pp("ffn_norm"))?,
        })
    }

    fn forward(&self, hidden_states: &Tensor, train: bool) -> Result<Tensor> {
        // Pre-norm attention with residual
        let normed = self.attention_norm.forward(hidden_states)?;
        let attn_out = self.attention.forward(&normed, &normed, None, train)?;
        let hidden_states = hidden_states.add(&attn_out)?;

        let normed = self.ffn_norm.forward(&hidden_states)?;
        hidden_states.add(&self.ffn.forward(&normed, train)?)
    }
}

struct DecoderLayer {
    self_attention: MultiHeadAttention,
    cross_attention: MultiHeadAttention,
    ffn: FeedForward,
    self_attention_norm: LayerNorm,
    cross_attention_norm: LayerNorm,
    ffn_norm: LayerNorm,
}

impl DecoderLayer {
    fn new(config: &HumaniseConfig, vb: VarBuilder) -> Result<Self> {
        let attention = |name: &str| {
            MultiHeadAttention::new(config.hidden_size, config.num_heads, config.dropout, vb.pp(name))
        };
        let norm = |name: &str| LayerNorm::new(config.hidden_size, config.layer_norm_eps, vb.pp(name));

        Ok(Self {
            self_attention: attention("self_attention")?,
            cross_attention: attention("cross_attention")?,
            ffn: FeedForward::new(
                config.hidden_size,
                config.intermediate_size,
                config.dropout,
                vb.pp("ffn"),
            )?,
            self_attention_norm: norm("self_attention_norm")?,
            cross_attention_norm: norm("cross_attention_norm")?,
            ffn_norm: norm("ffn_norm")?,
        })
    }

    fn forward(&self, hidden_states: &Tensor, memory: &Tensor, bias: &Tensor, train: bool) -> Result<Tensor> {
        let normed = self.self_attention_norm.forward(hidden_states)?;
        let attn_out = self.self_attention.forward(&normed, &normed, Some(bias), train)?;
        let hidden_states = hidden_states.add(&attn_out)?;

        let normed = self.cross_attention_norm.forward(&hidden_states)?;
        let cross_out = self.cross_attention.forward(&normed, memory, None, train)?;
        let hidden_states = hidden_states.add(&cross_out)?;

        let normed = self.ffn_norm.forward(&hidden_states)?;
        hidden_states.add(&self.ffn.forward(&normed, train)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::shift_target;

    fn notes(batch_size: usize, time: usize, config: &HumaniseConfig, device: &Device) -> Result<Tensor> {
        let count = batch_size * time * config.note_features;
        let data: Vec<u32> = (0..count)
            .map(|i| (i % (config.note_feature_size + 1)) as u32)
            .collect();
        Tensor::from_vec(data, (batch_size, time, config.note_features), device)
    }

    #[test]
    fn test_generator_output_matches_target_input() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let config = HumaniseConfig::tiny();
        let generator = NoteTransformer::build(&config, &device)?;

        let source = notes(2, 8, &config, &device)?;
        let target = notes(2, 8, &config, &device)?;
        let mask = CoderMask::causal(2, 8, &device)?;
        let (shifted, mask) = shift_target(&target, &mask, config.window_length)?;

        let generated = generator.forward(&source, &shifted.input, &mask)?;

        assert_eq!(generated.dims(), shifted.input.dims());
        let max = generated.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert!(max <= 1.0);
        Ok(())
    }

    #[test]
    fn test_inference_is_deterministic() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let config = HumaniseConfig::tiny();
        let mut generator = NoteTransformer::build(&config, &device)?;
        generator.set_training(false);
        assert!(!generator.is_training());

        let source = notes(1, 6, &config, &device)?;
        let mask = CoderMask::causal(1, 6, &device)?;

        let first = generator.forward(&source, &source, &mask)?.flatten_all()?.to_vec1::<f32>()?;
        let second = generator.forward(&source, &source, &mask)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn test_parameters_registered_by_name() -> Result<()> {
        let device = Device::Cpu;
        let generator = NoteTransformer::build(&HumaniseConfig::tiny(), &device)?;

        let data = generator.varmap().data().lock().unwrap();
        assert!(data.contains_key("source_proj.weight"));
        assert!(data.contains_key("decoder.0.cross_attention.q_proj.weight"));
        assert!(data.contains_key("final_norm.weight"));
        Ok(())
    }
}
