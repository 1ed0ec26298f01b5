use candle_core::{bail, DType, Result, Tensor, Var, D};
use embedding::{TokenEmbedding, TokenEmbeddingConfig};
use layers::{
    linear::{Linear, LinearConfig, LinearInit, LinearLayer},
    PrecisionPolicy,
};

use super::{DecodeCache, Decoder, DecoderOutput};
use crate::config::ModelConfig;
use crate::encoder::EncoderOutput;
use crate::gru::GruCell;

/// Additive attention: `score = v^T tanh(W_m memory + W_q query)`.
#[derive(Debug)]
struct AdditiveAttention {
    memory_proj: Linear,
    query_proj: Linear,
    score: Linear,
}

impl AdditiveAttention {
    fn new(config: &ModelConfig) -> Result<Self> {
        let hidden = config.hidden_size;
        let dense = |output: usize, bias: bool| {
            let linear = if bias {
                LinearConfig::new(hidden, output)
            } else {
                LinearConfig::without_bias(hidden, output)
            };
            Linear::with_init(linear, LinearInit::XavierUniform, &config.device, config.dtype)
        };
        Ok(Self {
            memory_proj: dense(hidden, true)?,
            query_proj: dense(hidden, true)?,
            score: dense(1, false)?,
        })
    }

    /// Context vector `[batch, hidden]` for `query [batch, hidden]`.
    fn context(&self, encoded: &EncoderOutput, query: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let (batch, nodes, _) = encoded.memory.dims3()?;
        let keys = self.memory_proj.forward(&encoded.memory, policy)?;
        let query = self.query_proj.forward(query, policy)?.unsqueeze(1)?;
        let energy = keys.broadcast_add(&query)?.tanh()?;
        let scores = self.score.forward(&energy, policy)?.to_dtype(DType::F32)?;
        let bias = encoded.attention_bias.reshape((batch, nodes, 1))?;
        let weights = candle_nn::ops::softmax(&scores.broadcast_add(&bias)?, 1)?;
        weights
            .to_dtype(encoded.memory.dtype())?
            .broadcast_mul(&encoded.memory)?
            .sum(1)
    }

    fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = self.memory_proj.named_parameters(&format!("{scope}.memory"));
        params.extend(self.query_proj.named_parameters(&format!("{scope}.query")));
        params.extend(self.score.named_parameters(&format!("{scope}.score")));
        params
    }
}

/// GRU decoder with additive attention over the encoder memory.
///
/// Teacher-forced passes run step by step and return the summed
/// padding-masked cross-entropy alongside the logits.
#[derive(Debug)]
pub struct RecurrentDecoder {
    embedding: TokenEmbedding,
    attention: AdditiveAttention,
    cell: GruCell,
    output: Linear,
    policy: PrecisionPolicy,
}

impl RecurrentDecoder {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let hidden = config.hidden_size;
        let mut embedding =
            TokenEmbeddingConfig::new(config.tgt_vocab_size, hidden, config.dtype, &config.device);
        embedding.scale_by_sqrt_dim = false;
        log::info!("recurrent decoder: hidden {hidden}, vocab {}", config.tgt_vocab_size);
        Ok(Self {
            embedding: TokenEmbedding::new(embedding)?,
            attention: AdditiveAttention::new(config)?,
            cell: GruCell::new(2 * hidden, hidden, &config.device, config.dtype)?,
            output: Linear::with_init(
                LinearConfig::new(hidden, config.tgt_vocab_size),
                LinearInit::XavierUniform,
                &config.device,
                config.dtype,
            )?,
            policy: PrecisionPolicy::from_parameter_dtype(config.dtype),
        })
    }

    fn initial_hidden(&self, encoded: &EncoderOutput) -> Result<Tensor> {
        match &encoded.final_state {
            Some(state) => Ok(state.clone()),
            None => encoded.pooled_memory(),
        }
    }

    /// `tokens [batch, 1]` -> (`[batch, vocab]` logits, next hidden).
    fn advance(&self, tokens: &Tensor, hidden: &Tensor, encoded: &EncoderOutput) -> Result<(Tensor, Tensor)> {
        let embedded = self.embedding.forward(tokens)?.squeeze(1)?;
        let context = self.attention.context(encoded, hidden, &self.policy)?;
        let input = Tensor::cat(&[&context, &embedded], D::Minus1)?;
        let hidden = self.cell.step(&input, hidden)?;
        let logits = self.output.forward(&hidden, &self.policy)?;
        Ok((logits, hidden))
    }
}

/// Batch mean of the cross-entropy, with padded targets contributing zero.
fn masked_step_loss(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;
    let targets = targets.to_dtype(DType::U32)?;
    let picked = log_probs.gather(&targets.unsqueeze(1)?.contiguous()?, 1)?.squeeze(1)?;
    let mask = targets.ne(0u32)?.to_dtype(DType::F32)?;
    (picked.neg()? * mask)?.mean_all()
}

impl Decoder for RecurrentDecoder {
    fn kind(&self) -> &'static str {
        "recurrent"
    }

    fn vocab_size(&self) -> usize {
        self.embedding.config().vocab_size
    }

    fn forward_teacher_forced(
        &self,
        decoder_input: &Tensor,
        targets: &Tensor,
        encoded: &EncoderOutput,
        _training: bool,
    ) -> Result<DecoderOutput> {
        let (_, len) = decoder_input.dims2()?;
        if targets.dims() != decoder_input.dims() {
            bail!(
                "targets {:?} do not match decoder input {:?}",
                targets.dims(),
                decoder_input.dims()
            );
        }
        let mut hidden = self.initial_hidden(encoded)?;
        let mut steps = Vec::with_capacity(len);
        let mut loss = Tensor::zeros((), DType::F32, decoder_input.device())?;
        for t in 0..len {
            let (logits, next) = self.advance(&decoder_input.narrow(1, t, 1)?, &hidden, encoded)?;
            let target = targets.narrow(1, t, 1)?.squeeze(1)?;
            loss = (loss + masked_step_loss(&logits, &target)?)?;
            steps.push(logits);
            hidden = next;
        }
        Ok(DecoderOutput {
            logits: Tensor::stack(&steps, 1)?,
            loss: Some(loss),
        })
    }

    fn start_incremental(&self, encoded: &EncoderOutput) -> Result<DecodeCache> {
        Ok(DecodeCache::Recurrent {
            hidden: self.initial_hidden(encoded)?,
        })
    }

    fn step(
        &self,
        last_tokens: &Tensor,
        position: usize,
        encoded: &EncoderOutput,
        cache: &mut DecodeCache,
    ) -> Result<Tensor> {
        let DecodeCache::Recurrent { hidden } = cache else {
            bail!("recurrent decoder requires a recurrent cache");
        };
        let (logits, next) = self.advance(last_tokens, hidden, encoded)?;
        *hidden = next;
        log::trace!("recurrent decoder step {position}");
        Ok(logits)
    }

    fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = self.embedding.named_parameters(&format!("{scope}.embedding"));
        params.extend(self.attention.named_parameters(&format!("{scope}.attention")));
        params.extend(self.cell.named_parameters(&format!("{scope}.gru")));
        params.extend(self.output.named_parameters(&format!("{scope}.output")));
        params
    }
}
