use attention::{KvEntry, LayerCache, MultiHeadAttention, MultiHeadConfig};
use candle_core::{bail, DType, Device, Result, Tensor, Var};
use layers::{
    FeedForward, FeedForwardConfig, FeedForwardLayer, PrecisionPolicy, Residual, ResidualConfig,
};

use crate::config::ModelConfig;

/// Masked self-attention, cross-attention and feed-forward, each wrapped in a
/// residual + layer-norm sublayer.
#[derive(Debug)]
pub(crate) struct DecoderLayer {
    self_attention: MultiHeadAttention,
    self_residual: Residual,
    cross_attention: MultiHeadAttention,
    cross_residual: Residual,
    feed_forward: FeedForward,
    feed_forward_residual: Residual,
    policy: PrecisionPolicy,
}

impl DecoderLayer {
    pub(crate) fn new(config: &ModelConfig, seed: u64) -> Result<Self> {
        let device: &Device = &config.device;
        let dtype: DType = config.dtype;
        let hidden = config.hidden_size;

        let mut attention = MultiHeadConfig::new(hidden, config.num_heads);
        attention.dropout_p = config.attention_dropout_p;
        let mut residual = ResidualConfig::new(hidden, config.norm_placement);
        residual.dropout_p = config.dropout_p;
        let mut feed_forward = FeedForwardConfig::new(hidden, config.filter_size);
        feed_forward.dropout_p = config.dropout_p;

        Ok(Self {
            self_attention: MultiHeadAttention::new(attention.clone(), device, dtype)?,
            self_residual: Residual::new(residual.clone(), device, dtype, seed)?,
            cross_attention: MultiHeadAttention::new(attention, device, dtype)?,
            cross_residual: Residual::new(residual.clone(), device, dtype, seed.wrapping_add(1))?,
            feed_forward: FeedForward::new(feed_forward, device, dtype, seed.wrapping_add(2))?,
            feed_forward_residual: Residual::new(residual, device, dtype, seed.wrapping_add(3))?,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
        })
    }

    /// `hidden [batch, len, hidden]` attends causally to itself and to `memory`.
    ///
    /// With a cache, `hidden` holds only the newest positions, `self_bias` is
    /// normally `None`, and the projected memory is computed once and reused.
    pub(crate) fn forward(
        &self,
        hidden: &Tensor,
        memory: &Tensor,
        self_bias: Option<&Tensor>,
        memory_bias: &Tensor,
        cache: Option<&mut LayerCache>,
        training: bool,
    ) -> Result<Tensor> {
        let (self_entry, cross_entry) = match cache {
            Some(record) => (
                Some(&mut record.self_attention),
                Some(&mut record.cross_attention),
            ),
            None => (None, None),
        };

        let hidden = self.self_residual.forward(hidden, &self.policy, training, |x| {
            Ok(self
                .self_attention
                .self_attention(x, self_bias, self_entry, training)?)
        })?;
        let hidden = self.cross_residual.forward(&hidden, &self.policy, training, |x| {
            self.cross_attend(x, memory, memory_bias, cross_entry, training)
        })?;
        self.feed_forward_residual
            .forward(&hidden, &self.policy, training, |x| {
                self.feed_forward.forward(x, &self.policy, training)
            })
    }

    fn cross_attend(
        &self,
        query: &Tensor,
        memory: &Tensor,
        memory_bias: &Tensor,
        entry: Option<&mut KvEntry>,
        training: bool,
    ) -> Result<Tensor> {
        let Some(entry) = entry else {
            return Ok(self
                .cross_attention
                .forward(query, memory, Some(memory_bias), None, training)?);
        };
        if entry.is_empty() {
            let (k, v) = self.cross_attention.project_memory(memory)?;
            entry.set(k, v);
        }
        match (entry.keys(), entry.values()) {
            (Some(k), Some(v)) => Ok(self
                .cross_attention
                .attend_projected(query, k, v, Some(memory_bias), training)?),
            _ => bail!("cross-attention cache holds keys without values"),
        }
    }

    pub(crate) fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = self
            .self_attention
            .named_parameters(&format!("{scope}.self_attention"));
        params.extend(self.self_residual.named_parameters(&format!("{scope}.self_attention")));
        params.extend(
            self.cross_attention
                .named_parameters(&format!("{scope}.encdec_attention")),
        );
        params.extend(self.cross_residual.named_parameters(&format!("{scope}.encdec_attention")));
        params.extend(self.feed_forward.named_parameters(&format!("{scope}.ffn")));
        params.extend(self.feed_forward_residual.named_parameters(&format!("{scope}.ffn")));
        params
    }
}
