//! Multi-head attention over `(batch, seq, hidden)` tensors.
//!
//! Queries, keys and values get independent bias-free projections. The hidden
//! dimension is split into `num_heads` slices of `hidden_size / num_heads`,
//! each slice attends independently through [`ExactAttention`], and the heads
//! are merged and projected back to `hidden_size`.

use candle_core::{DType, Device, Tensor, Var};
use layers::{
    linear::{Linear, LinearConfig, LinearInit, LinearLayer},
    PrecisionPolicy,
};

use crate::core::{Attention, AttentionError, Config};
use crate::kv_cache::KvEntry;
use crate::reference::ExactAttention;

/// Shape and regularisation settings for [`MultiHeadAttention`].
#[derive(Debug, Clone, PartialEq)]
pub struct MultiHeadConfig {
    pub hidden_size: usize,
    pub num_heads: usize,
    /// Dropout on attention weights during training.
    pub dropout_p: Option<f32>,
}

impl MultiHeadConfig {
    pub fn new(hidden_size: usize, num_heads: usize) -> Self {
        Self {
            hidden_size,
            num_heads,
            dropout_p: None,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    /// Rejects configurations whose hidden size does not split evenly.
    pub fn validate(&self) -> Result<(), AttentionError> {
        if self.hidden_size == 0 || self.num_heads == 0 {
            return Err(AttentionError::config(
                "hidden_size and num_heads must be greater than zero",
            ));
        }
        if self.hidden_size % self.num_heads != 0 {
            return Err(AttentionError::config(format!(
                "hidden_size ({}) must be divisible by num_heads ({})",
                self.hidden_size, self.num_heads
            )));
        }
        if let Some(p) = self.dropout_p {
            if !(0.0..1.0).contains(&p) {
                return Err(AttentionError::config(format!(
                    "attention dropout must be in [0, 1), got {p}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct MultiHeadAttention {
    config: MultiHeadConfig,
    policy: PrecisionPolicy,
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    kernel: ExactAttention,
}

impl MultiHeadAttention {
    /// Builds the module; fails before allocating anything if the config is invalid.
    pub fn new(config: MultiHeadConfig, device: &Device, dtype: DType) -> Result<Self, AttentionError> {
        config.validate()?;
        let hidden = config.hidden_size;
        let projection = || {
            Linear::with_init(
                LinearConfig::without_bias(hidden, hidden),
                LinearInit::XavierUniform,
                device,
                dtype,
            )
        };
        Ok(Self {
            query: projection()?,
            key: projection()?,
            value: projection()?,
            output: projection()?,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
            kernel: ExactAttention::new(),
            config,
        })
    }

    pub fn config(&self) -> &MultiHeadConfig {
        &self.config
    }

    /// Attends from `query_input` to `memory`.
    ///
    /// With a cache, the keys/values projected from `memory` are appended to
    /// the cached history first, so incremental self-attention passes only the
    /// newest position as both `query_input` and `memory`.
    pub fn forward(
        &self,
        query_input: &Tensor,
        memory: &Tensor,
        bias: Option<&Tensor>,
        cache: Option<&mut KvEntry>,
        training: bool,
    ) -> Result<Tensor, AttentionError> {
        let (k, v) = self.project_memory(memory)?;
        let (k, v) = match cache {
            Some(entry) => entry.append(&k, &v)?,
            None => (k, v),
        };
        self.attend_projected(query_input, &k, &v, bias, training)
    }

    /// Self-attention, the `query_input == memory` case.
    pub fn self_attention(
        &self,
        input: &Tensor,
        bias: Option<&Tensor>,
        cache: Option<&mut KvEntry>,
        training: bool,
    ) -> Result<Tensor, AttentionError> {
        self.forward(input, input, bias, cache, training)
    }

    /// Projects `memory` into split-head keys and values `[batch, heads, len, head_dim]`.
    pub fn project_memory(&self, memory: &Tensor) -> Result<(Tensor, Tensor), AttentionError> {
        let k = self.split_heads(&self.key.forward(memory, &self.policy)?)?;
        let v = self.split_heads(&self.value.forward(memory, &self.policy)?)?;
        Ok((k, v))
    }

    /// Attends with keys and values that were already projected and split.
    pub fn attend_projected(
        &self,
        query_input: &Tensor,
        k: &Tensor,
        v: &Tensor,
        bias: Option<&Tensor>,
        training: bool,
    ) -> Result<Tensor, AttentionError> {
        let q = self.split_heads(&self.query.forward(query_input, &self.policy)?)?;
        let config = Config::for_mode(self.config.dropout_p, training);
        let context = self.kernel.attend(&q, k, v, bias, &config)?;
        let merged = self.merge_heads(&context)?;
        Ok(self.output.forward(&merged, &self.policy)?)
    }

    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = self.query.named_parameters(&format!("{scope}.q"));
        params.extend(self.key.named_parameters(&format!("{scope}.k")));
        params.extend(self.value.named_parameters(&format!("{scope}.v")));
        params.extend(self.output.named_parameters(&format!("{scope}.output_transform")));
        params
    }

    fn split_heads(&self, tensor: &Tensor) -> Result<Tensor, AttentionError> {
        let (batch, seq, hidden) = tensor.dims3().map_err(|_| {
            AttentionError::shape(format!(
                "attention input must be [batch, seq, {}], got {:?}",
                self.config.hidden_size,
                tensor.dims()
            ))
        })?;
        if hidden != self.config.hidden_size {
            return Err(AttentionError::shape(format!(
                "attention input hidden size {hidden} != {}",
                self.config.hidden_size
            )));
        }
        Ok(tensor
            .reshape((batch, seq, self.config.num_heads, self.config.head_dim()))?
            .permute((0, 2, 1, 3))?
            .contiguous()?)
    }

    fn merge_heads(&self, tensor: &Tensor) -> Result<Tensor, AttentionError> {
        let (batch, _, seq, _) = tensor.dims4()?;
        Ok(tensor
            .permute((0, 2, 1, 3))?
            .contiguous()?
            .reshape((batch, seq, self.config.hidden_size))?)
    }
}
