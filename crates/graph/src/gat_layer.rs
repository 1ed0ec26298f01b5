//! Multi-head graph attention restricted to adjacency neighbours.
//!
//! For every head `h`:
//!
//! ```text
//! f      = x W_h + b_h                          [batch, nodes, out]
//! logits = leaky_relu((f a_self) (f a_neigh)^T) [batch, nodes, nodes]
//! w      = softmax(logits + NEG_INF * (1 - adjacency))
//! out_h  = w (f + edge_layer(edges + labels))
//! ```
//!
//! Heads are averaged and passed through ReLU.

use attention::masks::NEG_INF;
use candle_core::{bail, DType, Device, Result, Tensor, Var};
use layers::{
    activations::leaky_relu,
    checks,
    linear::{Linear, LinearConfig, LinearInit, LinearLayer},
    Dropout, PrecisionPolicy,
};

/// Slope of the LeakyReLU applied to pairwise logits.
pub const DEFAULT_LEAKY_SLOPE: f64 = 0.3;

#[derive(Debug, Clone, PartialEq)]
pub struct GraphAttentionConfig {
    pub input_dim: usize,
    pub output_dim: usize,
    pub num_heads: usize,
    /// Dropout on attention weights and projected features during training.
    pub dropout_p: Option<f32>,
    pub leaky_slope: f64,
}

impl GraphAttentionConfig {
    pub fn new(input_dim: usize, output_dim: usize, num_heads: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            num_heads,
            dropout_p: None,
            leaky_slope: DEFAULT_LEAKY_SLOPE,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_dim == 0 || self.output_dim == 0 {
            bail!("graph attention dimensions must be non-zero");
        }
        if self.num_heads == 0 {
            bail!("graph attention requires at least one head");
        }
        if !self.leaky_slope.is_finite() || self.leaky_slope < 0.0 {
            bail!("leaky slope must be finite and non-negative, got {}", self.leaky_slope);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Head {
    kernel: Linear,
    attn_self: Linear,
    attn_neigh: Linear,
}

#[derive(Debug, Clone)]
pub struct GraphAttentionLayer {
    config: GraphAttentionConfig,
    heads: Vec<Head>,
    edge_layer: Linear,
    weight_dropout: Dropout,
    feature_dropout: Dropout,
    policy: PrecisionPolicy,
}

impl GraphAttentionLayer {
    pub fn new(config: GraphAttentionConfig, device: &Device, dtype: DType, seed: u64) -> Result<Self> {
        config.validate()?;
        let dense = |input: usize, output: usize, bias: bool| {
            let linear = if bias {
                LinearConfig::new(input, output)
            } else {
                LinearConfig::without_bias(input, output)
            };
            Linear::with_init(linear, LinearInit::XavierUniform, device, dtype)
        };
        let heads = (0..config.num_heads)
            .map(|_| {
                Ok(Head {
                    kernel: dense(config.input_dim, config.output_dim, true)?,
                    attn_self: dense(config.output_dim, 1, false)?,
                    attn_neigh: dense(config.output_dim, 1, false)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            heads,
            edge_layer: dense(config.input_dim, config.output_dim, true)?,
            weight_dropout: Dropout::new(config.dropout_p, seed)?,
            feature_dropout: Dropout::new(config.dropout_p, seed.wrapping_add(1))?,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
            config,
        })
    }

    pub fn config(&self) -> &GraphAttentionConfig {
        &self.config
    }

    /// Runs the layer.
    ///
    /// `nodes`, `edges` and `labels` are `[batch, nodes, input_dim]`;
    /// `adjacency` is `[batch, nodes, nodes]` and must include self-loops for
    /// every row that should produce a meaningful output.
    pub fn forward(
        &self,
        nodes: &Tensor,
        edges: &Tensor,
        labels: Option<&Tensor>,
        adjacency: &Tensor,
        training: bool,
    ) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("gat.nodes", nodes, self.config.input_dim)?;
        let (batch, slots, _) = nodes.dims3()?;
        checks::expect_shape("gat.edges", edges, nodes.dims())?;
        if let Some(labels) = labels {
            checks::expect_shape("gat.labels", labels, nodes.dims())?;
        }
        checks::expect_shape("gat.adjacency", adjacency, &[batch, slots, slots])?;

        let edge_input = match labels {
            Some(labels) => (edges + labels)?,
            None => edges.clone(),
        };
        let edge_repr = self.edge_layer.forward(&edge_input, &self.policy)?;
        let bias = adjacency
            .to_dtype(DType::F32)?
            .affine(-NEG_INF, NEG_INF)?;

        let mut outputs = Vec::with_capacity(self.heads.len());
        for head in &self.heads {
            outputs.push(self.head_forward(head, nodes, &edge_repr, &bias, training)?);
        }
        let stacked = Tensor::stack(&outputs, 0)?;
        let averaged = stacked.mean(0)?;
        self.policy.cast_to_storage(&averaged.relu()?)
    }

    /// Attention weights `[batch, heads, nodes, nodes]` without dropout.
    pub fn attention_weights(&self, nodes: &Tensor, adjacency: &Tensor) -> Result<Tensor> {
        let bias = adjacency
            .to_dtype(DType::F32)?
            .affine(-NEG_INF, NEG_INF)?;
        let weights = self
            .heads
            .iter()
            .map(|head| {
                let features = head.kernel.forward(nodes, &self.policy)?;
                self.head_weights(head, &features, &bias)
            })
            .collect::<Result<Vec<_>>>()?;
        Tensor::stack(&weights, 1)
    }

    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = self.edge_layer.named_parameters(&format!("{scope}.edge_layer"));
        for (index, head) in self.heads.iter().enumerate() {
            let head_scope = format!("{scope}.head_{index}");
            params.extend(head.kernel.named_parameters(&format!("{head_scope}.kernel")));
            params.extend(head.attn_self.named_parameters(&format!("{head_scope}.attn_self")));
            params.extend(head.attn_neigh.named_parameters(&format!("{head_scope}.attn_neigh")));
        }
        params
    }

    fn head_weights(&self, head: &Head, features: &Tensor, bias: &Tensor) -> Result<Tensor> {
        let for_self = head.attn_self.forward(features, &self.policy)?.to_dtype(DType::F32)?;
        let for_neigh = head.attn_neigh.forward(features, &self.policy)?.to_dtype(DType::F32)?;
        let logits = for_self.matmul(&for_neigh.transpose(1, 2)?.contiguous()?)?;
        let logits = leaky_relu(&logits, self.config.leaky_slope)?;
        candle_nn::ops::softmax_last_dim(&(logits + bias)?)
    }

    fn head_forward(
        &self,
        head: &Head,
        nodes: &Tensor,
        edge_repr: &Tensor,
        bias: &Tensor,
        training: bool,
    ) -> Result<Tensor> {
        let features = head.kernel.forward(nodes, &self.policy)?;
        let weights = self.head_weights(head, &features, bias)?;
        let weights = self.weight_dropout.forward(&weights, training, &self.policy)?;
        let values = (features + edge_repr)?.to_dtype(DType::F32)?;
        let values = self.feature_dropout.forward(&values, training, &self.policy)?;
        weights.matmul(&values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::identity_adjacency;

    fn layer(heads: usize) -> Result<GraphAttentionLayer> {
        GraphAttentionLayer::new(GraphAttentionConfig::new(6, 4, heads), &Device::Cpu, DType::F32, 3)
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        (a - b)?.abs()?.max_all()?.to_vec0::<f32>()
    }

    #[test]
    fn default_slope_matches_keras_leaky_relu() {
        assert_eq!(GraphAttentionConfig::new(6, 4, 2).leaky_slope, 0.3);
    }

    #[test]
    fn output_shape_and_non_negativity() -> Result<()> {
        let device = Device::Cpu;
        let gat = layer(2)?;
        let nodes = Tensor::randn(0f32, 1.0, (2, 5, 6), &device)?;
        let edges = Tensor::randn(0f32, 1.0, (2, 5, 6), &device)?;
        let adjacency = Tensor::ones((2, 5, 5), DType::F32, &device)?;
        let out = gat.forward(&nodes, &edges, None, &adjacency, false)?;
        assert_eq!(out.dims(), &[2, 5, 4]);
        assert!(out.min_all()?.to_vec0::<f32>()? >= 0.0);
        assert_eq!(gat.named_parameters("gat").len(), 2 + 2 * 4);
        Ok(())
    }

    #[test]
    fn identity_adjacency_keeps_nodes_independent() -> Result<()> {
        let device = Device::Cpu;
        let gat = layer(3)?;
        let nodes = Tensor::randn(0f32, 1.0, (1, 4, 6), &device)?;
        let edges = Tensor::randn(0f32, 1.0, (1, 4, 6), &device)?;
        let adjacency = identity_adjacency(1, 4, &device)?;
        let baseline = gat.forward(&nodes, &edges, None, &adjacency, false)?;

        // Perturb every node except the first; its output must not move.
        let noise = Tensor::randn(0f32, 3.0, (1, 3, 6), &device)?;
        let perturbed = Tensor::cat(&[nodes.narrow(1, 0, 1)?, (nodes.narrow(1, 1, 3)? + noise)?], 1)?;
        let edge_noise = Tensor::randn(0f32, 3.0, (1, 3, 6), &device)?;
        let perturbed_edges =
            Tensor::cat(&[edges.narrow(1, 0, 1)?, (edges.narrow(1, 1, 3)? + edge_noise)?], 1)?;
        let changed = gat.forward(&perturbed, &perturbed_edges, None, &adjacency, false)?;

        assert!(max_diff(&baseline.narrow(1, 0, 1)?, &changed.narrow(1, 0, 1)?)? < 1e-5);
        Ok(())
    }

    #[test]
    fn weights_vanish_outside_the_neighbourhood() -> Result<()> {
        let device = Device::Cpu;
        let gat = layer(2)?;
        let nodes = Tensor::randn(0f32, 1.0, (1, 3, 6), &device)?;
        let adjacency = Tensor::new(&[[[1f32, 1., 0.], [1., 1., 0.], [0., 0., 1.]]], &device)?;
        let weights = gat.attention_weights(&nodes, &adjacency)?;
        assert_eq!(weights.dims(), &[1, 2, 3, 3]);

        let values = weights.flatten_all()?.to_vec1::<f32>()?;
        for head in 0..2 {
            let at = |i: usize, j: usize| values[head * 9 + i * 3 + j];
            assert!(at(0, 2) < 1e-6);
            assert!(at(2, 0) < 1e-6);
            assert!((at(2, 2) - 1.0).abs() < 1e-6);
            assert!((at(0, 0) + at(0, 1) - 1.0).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn labels_must_match_node_layout() -> Result<()> {
        let device = Device::Cpu;
        let gat = layer(1)?;
        let nodes = Tensor::zeros((1, 3, 6), DType::F32, &device)?;
        let labels = Tensor::zeros((1, 2, 6), DType::F32, &device)?;
        let adjacency = identity_adjacency(1, 3, &device)?;
        assert!(gat.forward(&nodes, &nodes, Some(&labels), &adjacency, false).is_err());
        Ok(())
    }

    #[test]
    fn zero_heads_fail_validation() {
        let config = GraphAttentionConfig::new(6, 4, 0);
        assert!(GraphAttentionLayer::new(config, &Device::Cpu, DType::F32, 0).is_err());
    }
}
