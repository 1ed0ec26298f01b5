//! Stack of graph-attention blocks producing the encoder memory.

use candle_core::{bail, DType, Device, Result, Tensor, Var};
use embedding::{SinusoidalConfig, SinusoidalPositionalEncoding};
use layers::{
    checks, FeedForward, FeedForwardConfig, FeedForwardLayer, LayerNorm, NormConfig,
    NormalizationLayer, PrecisionPolicy,
};
use serde::{Deserialize, Serialize};

use crate::features::GraphFeatures;
use crate::gat_layer::{GraphAttentionConfig, GraphAttentionLayer, DEFAULT_LEAKY_SLOPE};

/// Residual wiring between consecutive blocks. The first block never has one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShortcutPolicy {
    None,
    /// Block `i >= 1` adds its own input to its output.
    #[default]
    Previous,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphEncoderConfig {
    pub hidden_size: usize,
    pub filter_size: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub dropout_p: Option<f32>,
    pub leaky_slope: f64,
    pub shortcut: ShortcutPolicy,
    /// Add sinusoidal slot positions to the node features.
    pub node_positions: bool,
}

impl GraphEncoderConfig {
    pub fn new(hidden_size: usize, filter_size: usize, num_layers: usize, num_heads: usize) -> Self {
        Self {
            hidden_size,
            filter_size,
            num_layers,
            num_heads,
            dropout_p: None,
            leaky_slope: DEFAULT_LEAKY_SLOPE,
            shortcut: ShortcutPolicy::default(),
            node_positions: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_layers == 0 {
            bail!("graph encoder requires at least one layer");
        }
        if self.hidden_size == 0 || self.filter_size == 0 {
            bail!("graph encoder sizes must be non-zero");
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Block {
    attention: GraphAttentionLayer,
    feed_forward: FeedForward,
}

#[derive(Debug)]
pub struct GraphEncoderStack {
    config: GraphEncoderConfig,
    blocks: Vec<Block>,
    positions: Option<SinusoidalPositionalEncoding>,
    output_norm: LayerNorm,
    policy: PrecisionPolicy,
}

impl GraphEncoderStack {
    pub fn new(config: GraphEncoderConfig, device: &Device, dtype: DType, seed: u64) -> Result<Self> {
        config.validate()?;
        let hidden = config.hidden_size;
        let blocks = (0..config.num_layers)
            .map(|index| {
                let mut attention = GraphAttentionConfig::new(hidden, hidden, config.num_heads);
                attention.dropout_p = config.dropout_p;
                attention.leaky_slope = config.leaky_slope;
                let mut feed_forward = FeedForwardConfig::new(hidden, config.filter_size);
                feed_forward.dropout_p = config.dropout_p;
                let block_seed = seed.wrapping_add(16 * index as u64);
                Ok(Block {
                    attention: GraphAttentionLayer::new(attention, device, dtype, block_seed)?,
                    feed_forward: FeedForward::new(feed_forward, device, dtype, block_seed.wrapping_add(8))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let positions = if config.node_positions {
            Some(SinusoidalPositionalEncoding::new(SinusoidalConfig::new(hidden))?)
        } else {
            None
        };
        log::info!(
            "graph encoder: {} layers, {} heads, hidden {}, shortcut {:?}",
            config.num_layers,
            config.num_heads,
            hidden,
            config.shortcut
        );
        Ok(Self {
            blocks,
            positions,
            output_norm: LayerNorm::identity(NormConfig::new(hidden), dtype, device)?,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
            config,
        })
    }

    pub fn config(&self) -> &GraphEncoderConfig {
        &self.config
    }

    /// Encodes embedded graph features into `[batch, nodes, hidden]` memory.
    pub fn forward(&self, features: &GraphFeatures, training: bool) -> Result<Tensor> {
        let hidden = self.config.hidden_size;
        checks::expect_batch_seq_hidden("graph_encoder.nodes", &features.nodes, hidden)?;
        let scale = (hidden as f64).sqrt();

        let mut x = features.nodes.affine(scale, 0.0)?;
        if let Some(positions) = &self.positions {
            x = positions.add_to(&x, 0)?;
        }
        let edges = features.edges.affine(scale, 0.0)?;

        for (index, block) in self.blocks.iter().enumerate() {
            let attended = block.attention.forward(
                &x,
                &edges,
                features.labels.as_ref(),
                &features.adjacency,
                training,
            )?;
            let mut out = block.feed_forward.forward(&attended, &self.policy, training)?;
            if index > 0 && self.config.shortcut == ShortcutPolicy::Previous {
                out = (out + &x)?;
            }
            x = out;
        }
        self.output_norm.forward(&x, &self.policy)
    }

    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = Vec::new();
        for (index, block) in self.blocks.iter().enumerate() {
            let layer = format!("{scope}.layer_{index}");
            params.extend(block.attention.named_parameters(&format!("{layer}.gat")));
            params.extend(block.feed_forward.named_parameters(&format!("{layer}.ffn")));
        }
        params.extend(self.output_norm.named_parameters(&format!("{scope}.output_norm")));
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::identity_adjacency;

    fn features(batch: usize, slots: usize, hidden: usize) -> Result<GraphFeatures> {
        let device = Device::Cpu;
        Ok(GraphFeatures {
            nodes: Tensor::randn(0f32, 1.0, (batch, slots, hidden), &device)?,
            edges: Tensor::randn(0f32, 1.0, (batch, slots, hidden), &device)?,
            labels: None,
            adjacency: Tensor::ones((batch, slots, slots), DType::F32, &device)?,
        })
    }

    #[test]
    fn output_is_normalised_memory() -> Result<()> {
        let stack = GraphEncoderStack::new(GraphEncoderConfig::new(8, 16, 2, 2), &Device::Cpu, DType::F32, 0)?;
        let out = stack.forward(&features(2, 5, 8)?, false)?;
        assert_eq!(out.dims(), &[2, 5, 8]);

        let means = out.mean_keepdim(2)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(means < 1e-4);
        Ok(())
    }

    #[test]
    fn inference_is_deterministic() -> Result<()> {
        let mut config = GraphEncoderConfig::new(8, 16, 2, 2);
        config.dropout_p = Some(0.3);
        config.node_positions = true;
        let stack = GraphEncoderStack::new(config, &Device::Cpu, DType::F32, 5)?;
        let input = features(1, 4, 8)?;
        let first = stack.forward(&input, false)?;
        let second = stack.forward(&input, false)?;
        let diff = (first - second)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn identity_adjacency_isolates_nodes_through_the_stack() -> Result<()> {
        let device = Device::Cpu;
        let stack = GraphEncoderStack::new(GraphEncoderConfig::new(8, 16, 3, 2), &device, DType::F32, 1)?;
        let mut input = features(1, 4, 8)?;
        input.adjacency = identity_adjacency(1, 4, &device)?;
        let baseline = stack.forward(&input, false)?;

        let tail = Tensor::randn(0f32, 2.0, (1, 3, 8), &device)?;
        input.nodes = Tensor::cat(&[input.nodes.narrow(1, 0, 1)?, tail], 1)?;
        let changed = stack.forward(&input, false)?;
        let diff = (baseline.narrow(1, 0, 1)? - changed.narrow(1, 0, 1)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }

    #[test]
    fn zero_layers_are_rejected() {
        let config = GraphEncoderConfig::new(8, 16, 0, 2);
        assert!(GraphEncoderStack::new(config, &Device::Cpu, DType::F32, 0).is_err());
    }

    #[test]
    fn parameters_are_scoped_per_layer() -> Result<()> {
        let stack = GraphEncoderStack::new(GraphEncoderConfig::new(8, 16, 2, 1), &Device::Cpu, DType::F32, 0)?;
        let names: Vec<String> = stack.named_parameters("encoder").into_iter().map(|(n, _)| n).collect();
        assert!(names.iter().any(|n| n == "encoder.layer_1.gat.head_0.kernel.weight"));
        assert!(names.iter().any(|n| n == "encoder.output_norm.scale"));
        Ok(())
    }
}
