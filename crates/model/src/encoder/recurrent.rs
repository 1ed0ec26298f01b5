use candle_core::{Result, Tensor, Var};
use embedding::{TokenEmbedding, TokenEmbeddingConfig};
use graph::GraphInput;

use super::{Encoder, EncoderOutput};
use crate::config::ModelConfig;
use crate::gru::GruCell;

/// Bidirectional GRU over the node id sequence. Outputs and final states of
/// the two directions are averaged.
#[derive(Debug)]
pub struct RecurrentEncoder {
    embedding: TokenEmbedding,
    forward_cell: GruCell,
    backward_cell: GruCell,
}

impl RecurrentEncoder {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let hidden = config.hidden_size;
        let mut embedding = TokenEmbeddingConfig::new(config.src_vocab_size, hidden, config.dtype, &config.device);
        embedding.scale_by_sqrt_dim = false;
        Ok(Self {
            embedding: TokenEmbedding::new(embedding)?,
            forward_cell: GruCell::new(hidden, hidden, &config.device, config.dtype)?,
            backward_cell: GruCell::new(hidden, hidden, &config.device, config.dtype)?,
        })
    }
}

impl Encoder for RecurrentEncoder {
    fn kind(&self) -> &'static str {
        "recurrent"
    }

    fn encode(&self, input: &GraphInput, _training: bool) -> Result<EncoderOutput> {
        let embedded = self.embedding.forward(input.nodes())?;
        let (batch, _, _) = embedded.dims3()?;
        let initial = Tensor::zeros((batch, self.forward_cell.hidden_dim()), embedded.dtype(), embedded.device())?;
        let (forward_states, forward_last) = self.forward_cell.run(&embedded, &initial, false)?;
        let (backward_states, backward_last) = self.backward_cell.run(&embedded, &initial, true)?;
        Ok(EncoderOutput {
            memory: ((forward_states + backward_states)? * 0.5)?,
            attention_bias: input.attention_bias()?,
            final_state: Some(((forward_last + backward_last)? * 0.5)?),
        })
    }

    fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = self.embedding.named_parameters(&format!("{scope}.embedding"));
        params.extend(self.forward_cell.named_parameters(&format!("{scope}.forward_gru")));
        params.extend(self.backward_cell.named_parameters(&format!("{scope}.backward_gru")));
        params
    }
}
