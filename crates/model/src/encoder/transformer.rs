use attention::{MultiHeadAttention, MultiHeadConfig};
use candle_core::{Result, Var};
use embedding::{
    SinusoidalConfig, SinusoidalPositionalEncoding, TokenEmbedding, TokenEmbeddingConfig,
};
use graph::GraphInput;
use layers::{
    Dropout, FeedForward, FeedForwardConfig, FeedForwardLayer, LayerNorm, NormConfig,
    NormalizationLayer, PrecisionPolicy, Residual, ResidualConfig,
};

use super::{Encoder, EncoderOutput};
use crate::config::ModelConfig;

#[derive(Debug)]
struct EncoderLayer {
    self_attention: MultiHeadAttention,
    attention_residual: Residual,
    feed_forward: FeedForward,
    feed_forward_residual: Residual,
}

/// Self-attention encoder over the node id sequence, ignoring graph structure.
#[derive(Debug)]
pub struct TransformerEncoder {
    embedding: TokenEmbedding,
    positions: SinusoidalPositionalEncoding,
    input_dropout: Dropout,
    layers: Vec<EncoderLayer>,
    output_norm: LayerNorm,
    policy: PrecisionPolicy,
}

impl TransformerEncoder {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let device = &config.device;
        let hidden = config.hidden_size;
        let mut residual = ResidualConfig::new(hidden, config.norm_placement);
        residual.dropout_p = config.dropout_p;
        let mut attention = MultiHeadConfig::new(hidden, config.num_heads);
        attention.dropout_p = config.attention_dropout_p;
        let mut feed_forward = FeedForwardConfig::new(hidden, config.filter_size);
        feed_forward.dropout_p = config.dropout_p;

        let layers = (0..config.num_layers)
            .map(|index| {
                let seed = config.seed_for(100 + 4 * index as u64);
                Ok(EncoderLayer {
                    self_attention: MultiHeadAttention::new(attention.clone(), device, config.dtype)?,
                    attention_residual: Residual::new(residual.clone(), device, config.dtype, seed)?,
                    feed_forward: FeedForward::new(feed_forward.clone(), device, config.dtype, seed.wrapping_add(1))?,
                    feed_forward_residual: Residual::new(residual.clone(), device, config.dtype, seed.wrapping_add(2))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            embedding: TokenEmbedding::new(TokenEmbeddingConfig::new(
                config.src_vocab_size,
                hidden,
                config.dtype,
                device,
            ))?,
            positions: SinusoidalPositionalEncoding::new(SinusoidalConfig::new(hidden))?,
            input_dropout: Dropout::new(config.dropout_p, config.seed_for(99))?,
            layers,
            output_norm: LayerNorm::identity(NormConfig::new(hidden), config.dtype, device)?,
            policy: PrecisionPolicy::from_parameter_dtype(config.dtype),
        })
    }
}

impl Encoder for TransformerEncoder {
    fn kind(&self) -> &'static str {
        "transformer"
    }

    fn encode(&self, input: &GraphInput, training: bool) -> Result<EncoderOutput> {
        let bias = input.attention_bias()?;
        let embedded = self.embedding.forward(input.nodes())?;
        let embedded = self.positions.add_to(&embedded, 0)?;
        let mut hidden = self.input_dropout.forward(&embedded, training, &self.policy)?;

        for layer in &self.layers {
            hidden = layer.attention_residual.forward(&hidden, &self.policy, training, |x| {
                Ok(layer.self_attention.self_attention(x, Some(&bias), None, training)?)
            })?;
            hidden = layer.feed_forward_residual.forward(&hidden, &self.policy, training, |x| {
                layer.feed_forward.forward(x, &self.policy, training)
            })?;
        }

        Ok(EncoderOutput {
            memory: self.output_norm.forward(&hidden, &self.policy)?,
            attention_bias: bias,
            final_state: None,
        })
    }

    fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = self.embedding.named_parameters(&format!("{scope}.embedding"));
        for (index, layer) in self.layers.iter().enumerate() {
            let layer_scope = format!("{scope}.layer_{index}");
            params.extend(layer.self_attention.named_parameters(&format!("{layer_scope}.self_attention")));
            params.extend(layer.attention_residual.named_parameters(&format!("{layer_scope}.self_attention")));
            params.extend(layer.feed_forward.named_parameters(&format!("{layer_scope}.ffn")));
            params.extend(layer.feed_forward_residual.named_parameters(&format!("{layer_scope}.ffn")));
        }
        params.extend(self.output_norm.named_parameters(&format!("{scope}.output_norm")));
        params
    }
}
