use attention::masks::decoder_self_attention_bias;
use attention::DecoderCache;
use candle_core::{bail, Result, Tensor, Var};
use embedding::{
    SinusoidalConfig, SinusoidalPositionalEncoding, TokenEmbedding, TokenEmbeddingConfig,
};
use layers::{
    linear::{Linear, LinearConfig, LinearInit, LinearLayer},
    Dropout, LayerNorm, NormConfig, NormalizationLayer, PrecisionPolicy,
};

use super::layer::DecoderLayer;
use super::{DecodeCache, Decoder, DecoderOutput};
use crate::config::ModelConfig;
use crate::encoder::EncoderOutput;

/// Stack of transformer decoder layers over the target embedding.
#[derive(Debug)]
pub struct TransformerDecoderStack {
    embedding: TokenEmbedding,
    positions: SinusoidalPositionalEncoding,
    input_dropout: Dropout,
    layers: Vec<DecoderLayer>,
    output_norm: LayerNorm,
    /// `None` when logits come from the transposed embedding table.
    projection: Option<Linear>,
    policy: PrecisionPolicy,
}

impl TransformerDecoderStack {
    pub fn new(config: &ModelConfig, tie_embeddings: bool) -> Result<Self> {
        let device = &config.device;
        let hidden = config.hidden_size;
        let layers = (0..config.num_layers)
            .map(|index| DecoderLayer::new(config, config.seed_for(200 + 4 * index as u64)))
            .collect::<Result<Vec<_>>>()?;
        let projection = if tie_embeddings {
            None
        } else {
            Some(Linear::with_init(
                LinearConfig::without_bias(hidden, config.tgt_vocab_size),
                LinearInit::XavierUniform,
                device,
                config.dtype,
            )?)
        };
        log::info!(
            "transformer decoder: {} layers, {} heads, tied embeddings {}",
            config.num_layers,
            config.num_heads,
            tie_embeddings
        );
        Ok(Self {
            embedding: TokenEmbedding::new(TokenEmbeddingConfig::new(
                config.tgt_vocab_size,
                hidden,
                config.dtype,
                device,
            ))?,
            positions: SinusoidalPositionalEncoding::new(SinusoidalConfig::new(hidden))?,
            input_dropout: Dropout::new(config.dropout_p, config.seed_for(199))?,
            layers,
            output_norm: LayerNorm::identity(NormConfig::new(hidden), config.dtype, device)?,
            projection,
            policy: PrecisionPolicy::from_parameter_dtype(config.dtype),
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    fn logits(&self, hidden: &Tensor) -> Result<Tensor> {
        let normed = self.output_norm.forward(hidden, &self.policy)?;
        match &self.projection {
            Some(projection) => projection.forward(&normed, &self.policy),
            None => self.embedding.linear_out(&normed),
        }
    }

    fn embed(&self, ids: &Tensor, offset: usize, training: bool) -> Result<Tensor> {
        let embedded = self.embedding.forward(ids)?;
        let embedded = self.positions.add_to(&embedded, offset)?;
        self.input_dropout.forward(&embedded, training, &self.policy)
    }
}

impl Decoder for TransformerDecoderStack {
    fn kind(&self) -> &'static str {
        "transformer"
    }

    fn vocab_size(&self) -> usize {
        self.embedding.config().vocab_size
    }

    fn forward_teacher_forced(
        &self,
        decoder_input: &Tensor,
        _targets: &Tensor,
        encoded: &EncoderOutput,
        training: bool,
    ) -> Result<DecoderOutput> {
        let self_bias = decoder_self_attention_bias(decoder_input)?;
        let mut hidden = self.embed(decoder_input, 0, training)?;
        for layer in &self.layers {
            hidden = layer.forward(
                &hidden,
                &encoded.memory,
                Some(&self_bias),
                &encoded.attention_bias,
                None,
                training,
            )?;
        }
        Ok(DecoderOutput {
            logits: self.logits(&hidden)?,
            loss: None,
        })
    }

    fn start_incremental(&self, _encoded: &EncoderOutput) -> Result<DecodeCache> {
        Ok(DecodeCache::Attention(DecoderCache::new(self.layers.len())))
    }

    fn step(
        &self,
        last_tokens: &Tensor,
        position: usize,
        encoded: &EncoderOutput,
        cache: &mut DecodeCache,
    ) -> Result<Tensor> {
        let DecodeCache::Attention(records) = cache else {
            bail!("transformer decoder requires an attention cache");
        };
        if records.num_layers() != self.layers.len() {
            bail!(
                "cache has {} layers, decoder has {}",
                records.num_layers(),
                self.layers.len()
            );
        }
        let mut hidden = self.embed(last_tokens, position, false)?;
        for (layer, record) in self.layers.iter().zip(records.layers_mut()) {
            hidden = layer.forward(
                &hidden,
                &encoded.memory,
                None,
                &encoded.attention_bias,
                Some(record),
                false,
            )?;
        }
        log::trace!("transformer decoder step {position}");
        self.logits(&hidden)?.squeeze(1)
    }

    fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = self.embedding.named_parameters(&format!("{scope}.embedding"));
        for (index, layer) in self.layers.iter().enumerate() {
            params.extend(layer.named_parameters(&format!("{scope}.layer_{index}")));
        }
        params.extend(self.output_norm.named_parameters(&format!("{scope}.output_norm")));
        if let Some(projection) = &self.projection {
            params.extend(projection.named_parameters(&format!("{scope}.projection")));
        }
        params
    }
}
