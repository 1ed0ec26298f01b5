use candle_core::{Result, Var};
use graph::{GraphEmbedder, GraphEncoderConfig, GraphEncoderStack, GraphInput, GraphLayout};

use super::{Encoder, EncoderOutput};
use crate::config::{EncoderKind, ModelConfig};

/// Graph attention encoder over the input layout chosen at build time.
#[derive(Debug)]
pub struct GraphAttentionEncoder {
    embedder: GraphEmbedder,
    stack: GraphEncoderStack,
}

impl GraphAttentionEncoder {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let mut stack = GraphEncoderConfig::new(
            config.hidden_size,
            config.filter_size,
            config.num_layers,
            config.num_heads,
        );
        stack.dropout_p = config.dropout_p;
        let mut layout = GraphLayout::default();
        if let EncoderKind::Graph {
            shortcut,
            leaky_slope,
            node_positions,
            layout: chosen,
        } = config.encoder
        {
            stack.shortcut = shortcut;
            stack.leaky_slope = leaky_slope;
            stack.node_positions = node_positions;
            layout = chosen;
        }
        let embedder = match layout {
            GraphLayout::Reified => {
                GraphEmbedder::reified(config.src_vocab_size, config.hidden_size, &config.device, config.dtype)?
            }
            GraphLayout::Roles => GraphEmbedder::roles(
                config.src_vocab_size,
                config.role_vocab_size,
                config.hidden_size,
                &config.device,
                config.dtype,
            )?,
        };
        Ok(Self {
            embedder,
            stack: GraphEncoderStack::new(stack, &config.device, config.dtype, config.seed_for(1))?,
        })
    }
}

impl Encoder for GraphAttentionEncoder {
    fn kind(&self) -> &'static str {
        "graph_attention"
    }

    fn encode(&self, input: &GraphInput, training: bool) -> Result<EncoderOutput> {
        let features = self.embedder.embed(input)?;
        Ok(EncoderOutput {
            memory: self.stack.forward(&features, training)?,
            attention_bias: input.attention_bias()?,
            final_state: None,
        })
    }

    fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = self.embedder.named_parameters(&format!("{scope}.embedder"));
        params.extend(self.stack.named_parameters(&format!("{scope}.stack")));
        params
    }
}
