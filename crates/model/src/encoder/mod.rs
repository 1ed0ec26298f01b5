//! Encoder capability and its three variants.

mod graph_attention;
mod recurrent;
mod transformer;

pub use self::graph_attention::GraphAttentionEncoder;
pub use self::recurrent::RecurrentEncoder;
pub use self::transformer::TransformerEncoder;

use candle_core::{Result, Tensor, Var};
use graph::GraphInput;

use crate::config::{EncoderKind, ModelConfig};

/// What every decoder reads from the encoder.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// `[batch, nodes, hidden]`
    pub memory: Tensor,
    /// `[batch, 1, 1, nodes]` hiding padded slots.
    pub attention_bias: Tensor,
    /// `[batch, hidden]` summary state of recurrent encoders.
    pub final_state: Option<Tensor>,
}

impl EncoderOutput {
    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.memory.dims3()?.0)
    }

    /// Repeats every batch row `beam_size` times so row `b * beam_size + j`
    /// belongs to element `b`.
    pub fn tile(&self, beam_size: usize) -> Result<Self> {
        if beam_size == 1 {
            return Ok(self.clone());
        }
        let batch = self.batch_size()?;
        let rows: Vec<u32> = (0..batch * beam_size).map(|r| (r / beam_size) as u32).collect();
        let index = Tensor::from_vec(rows, batch * beam_size, self.memory.device())?;
        Ok(Self {
            memory: self.memory.index_select(&index, 0)?,
            attention_bias: self.attention_bias.index_select(&index, 0)?,
            final_state: self
                .final_state
                .as_ref()
                .map(|state| state.index_select(&index, 0))
                .transpose()?,
        })
    }

    /// `[batch, hidden]` mean of the memory over non-padded slots.
    pub fn pooled_memory(&self) -> Result<Tensor> {
        let (batch, nodes, _) = self.memory.dims3()?;
        let keep = self
            .attention_bias
            .reshape((batch, nodes, 1))?
            .eq(0f32)?
            .to_dtype(self.memory.dtype())?;
        let total = self.memory.broadcast_mul(&keep)?.sum(1)?;
        let count = keep.sum(1)?.maximum(1f64)?;
        total.broadcast_div(&count)
    }
}

/// Turns graph inputs into encoder memory.
pub trait Encoder: Send + Sync {
    fn kind(&self) -> &'static str;

    fn encode(&self, input: &GraphInput, training: bool) -> Result<EncoderOutput>;

    fn named_parameters(&self, scope: &str) -> Vec<(String, Var)>;
}

/// Builds the encoder selected by `config.encoder`.
pub fn build_encoder(config: &ModelConfig) -> Result<Box<dyn Encoder>> {
    let encoder: Box<dyn Encoder> = match config.encoder {
        EncoderKind::Graph { .. } => Box::new(GraphAttentionEncoder::new(config)?),
        EncoderKind::Transformer => Box::new(TransformerEncoder::new(config)?),
        EncoderKind::Recurrent => Box::new(RecurrentEncoder::new(config)?),
    };
    log::info!("encoder: {}", encoder.kind());
    Ok(encoder)
}
