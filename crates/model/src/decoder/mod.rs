//! Decoder capability: teacher-forced training passes and incremental steps.

mod layer;
mod recurrent;
mod transformer;

pub use self::recurrent::RecurrentDecoder;
pub use self::transformer::TransformerDecoderStack;

use attention::DecoderCache;
use candle_core::{bail, DType, Result, Tensor, Var};
use generation::ReorderState;

use crate::config::{DecoderKind, ModelConfig};
use crate::encoder::EncoderOutput;

/// Result of one teacher-forced pass.
#[derive(Debug, Clone)]
pub struct DecoderOutput {
    /// `[batch, len, vocab]`
    pub logits: Tensor,
    /// Scalar loss accumulated by decoders that compute it step by step.
    pub loss: Option<Tensor>,
}

/// Decoder history owned by one decode call and reordered with its beams.
#[derive(Debug, Clone)]
pub enum DecodeCache {
    /// One key/value record per transformer layer.
    Attention(DecoderCache),
    /// `[rows, hidden]` recurrent state.
    Recurrent { hidden: Tensor },
}

impl ReorderState for DecodeCache {
    fn reorder(&mut self, indices: &Tensor) -> Result<()> {
        match self {
            DecodeCache::Attention(cache) => ReorderState::reorder(cache, indices),
            DecodeCache::Recurrent { hidden } => {
                *hidden = hidden.index_select(indices, 0)?;
                Ok(())
            }
        }
    }
}

pub trait Decoder: Send + Sync {
    fn kind(&self) -> &'static str;

    fn vocab_size(&self) -> usize;

    /// Processes the whole target at once. `decoder_input` is the target
    /// shifted right behind the start token; `targets` feeds decoders that
    /// accumulate their own loss.
    fn forward_teacher_forced(
        &self,
        decoder_input: &Tensor,
        targets: &Tensor,
        encoded: &EncoderOutput,
        training: bool,
    ) -> Result<DecoderOutput>;

    /// Fresh history for a decode over the rows of `encoded`.
    fn start_incremental(&self, encoded: &EncoderOutput) -> Result<DecodeCache>;

    /// Logits `[rows, vocab]` for the token after `last_tokens [rows, 1]`,
    /// which sits at `position` in the decoder input.
    fn step(
        &self,
        last_tokens: &Tensor,
        position: usize,
        encoded: &EncoderOutput,
        cache: &mut DecodeCache,
    ) -> Result<Tensor>;

    fn named_parameters(&self, scope: &str) -> Vec<(String, Var)>;
}

/// Builds the decoder selected by `config.decoder`.
pub fn build_decoder(config: &ModelConfig) -> Result<Box<dyn Decoder>> {
    let decoder: Box<dyn Decoder> = match config.decoder {
        DecoderKind::Transformer { tie_embeddings } => {
            Box::new(TransformerDecoderStack::new(config, tie_embeddings)?)
        }
        DecoderKind::Recurrent => Box::new(RecurrentDecoder::new(config)?),
    };
    log::info!("decoder: {}", decoder.kind());
    Ok(decoder)
}

/// `[start, t_0, ..., t_{len-2}]` for every row of `targets [batch, len]`.
pub fn shift_right(targets: &Tensor, start_id: u32) -> Result<Tensor> {
    let (batch, len) = targets.dims2()?;
    let targets = targets.to_dtype(DType::U32)?;
    let start = Tensor::full(start_id, (batch, 1), targets.device())?;
    match len {
        0 => bail!("targets must contain at least one position"),
        1 => return Ok(start),
        _ => {}
    }
    Tensor::cat(&[start, targets.narrow(1, 0, len - 1)?], 1)
}
