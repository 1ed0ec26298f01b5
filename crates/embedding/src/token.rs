//! Token embedding table with a tied logit projection.
//!
//! One `[vocab, hidden]` matrix serves both directions: `forward` gathers rows
//! for ids, `linear_out` multiplies hidden states by its transpose to produce
//! logits. Padding id 0 can be forced to the zero vector and lookups can be
//! scaled by `sqrt(hidden)`.

use candle_core::{bail, DType, Device, Error, Result, Tensor, Var};
use layers::{checks, PrecisionPolicy};

/// Configuration for building a token embedding table.
#[derive(Debug, Clone)]
pub struct TokenEmbeddingConfig {
    pub vocab_size: usize,
    pub hidden_dim: usize,
    /// Multiply looked-up vectors by `sqrt(hidden_dim)`.
    pub scale_by_sqrt_dim: bool,
    /// Map padding id 0 to the zero vector regardless of the table row.
    pub zero_padding: bool,
    pub dtype: DType,
    pub device: Device,
}

impl TokenEmbeddingConfig {
    /// Scaled lookups with zeroed padding, as used by the decoder and encoders.
    pub fn new(vocab_size: usize, hidden_dim: usize, dtype: DType, device: &Device) -> Self {
        Self {
            vocab_size,
            hidden_dim,
            scale_by_sqrt_dim: true,
            zero_padding: true,
            dtype,
            device: device.clone(),
        }
    }

    fn policy(&self) -> PrecisionPolicy {
        PrecisionPolicy::from_parameter_dtype(self.dtype)
    }
}

/// Learnable token embedding table.
#[derive(Debug, Clone)]
pub struct TokenEmbedding {
    config: TokenEmbeddingConfig,
    weight: Var,
    policy: PrecisionPolicy,
}

impl TokenEmbedding {
    /// Samples the table from `N(0, hidden^-0.5)`.
    pub fn new(config: TokenEmbeddingConfig) -> Result<Self> {
        if config.vocab_size == 0 {
            bail!("token embedding requires vocab_size > 0");
        }
        if config.hidden_dim == 0 {
            bail!("token embedding requires hidden_dim > 0");
        }
        let std = (config.hidden_dim as f32).powf(-0.5);
        let initial = Tensor::randn(0f32, std, (config.vocab_size, config.hidden_dim), &config.device)?
            .to_dtype(config.dtype)?;
        Self::from_weight(config, initial)
    }

    /// Wraps an existing `[vocab, hidden]` table.
    pub fn from_weight(config: TokenEmbeddingConfig, weight: Tensor) -> Result<Self> {
        checks::expect_shape(
            "embedding.weight",
            &weight,
            &[config.vocab_size, config.hidden_dim],
        )?;
        Ok(Self {
            policy: config.policy(),
            weight: Var::from_tensor(&weight.to_dtype(config.dtype)?)?,
            config,
        })
    }

    pub fn config(&self) -> &TokenEmbeddingConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    /// Looks up embeddings for ids of any shape, appending a hidden axis.
    pub fn forward(&self, token_ids: &Tensor) -> Result<Tensor> {
        checks::expect_index_dtype("token_ids", token_ids)?;
        if token_ids.elem_count() == 0 {
            bail!("token_ids must not be empty, got {:?}", token_ids.dims());
        }
        let flat = token_ids.flatten_all()?;
        self.ensure_id_range(&flat)?;
        let flat = flat.to_dtype(DType::U32)?;

        let mut gathered = self.weight.as_tensor().index_select(&flat, 0)?;
        if self.config.zero_padding {
            let keep = flat.ne(0u32)?.to_dtype(gathered.dtype())?.unsqueeze(1)?;
            gathered = gathered.broadcast_mul(&keep)?;
        }
        if self.config.scale_by_sqrt_dim {
            gathered = gathered.affine((self.config.hidden_dim as f64).sqrt(), 0.0)?;
        }

        let mut output_dims = token_ids.dims().to_vec();
        output_dims.push(self.config.hidden_dim);
        gathered.reshape(output_dims)
    }

    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        vec![(format!("{scope}.weights"), self.weight.clone())]
    }

    /// Projects `[..., hidden]` states onto the vocabulary with the transposed table.
    pub fn linear_out(&self, hidden: &Tensor) -> Result<Tensor> {
        checks::expect_last_dim("linear_out.input", hidden, self.config.hidden_dim)?;
        let dims = hidden.dims();
        let rows: usize = dims[..dims.len() - 1].iter().product();

        let input = self
            .policy
            .cast_for_matmul(hidden)?
            .reshape((rows, self.config.hidden_dim))?;
        let weight = self.policy.cast_for_matmul(self.weight.as_tensor())?;
        let logits = input.matmul(&weight.t()?)?;

        let mut out_dims = dims[..dims.len() - 1].to_vec();
        out_dims.push(self.config.vocab_size);
        self.policy.cast_to_storage(&logits.reshape(out_dims)?)
    }

    fn ensure_id_range(&self, flat_ids: &Tensor) -> Result<()> {
        let as_i64 = flat_ids.to_dtype(DType::I64)?;
        let min_id = as_i64.min_all()?.to_scalar::<i64>()?;
        if min_id < 0 {
            return Err(Error::Msg(format!("encountered negative token id {min_id}")));
        }
        let max_id = as_i64.max_all()?.to_scalar::<i64>()?;
        if max_id >= self.config.vocab_size as i64 {
            return Err(Error::Msg(format!(
                "token id {} exceeds vocab size {}",
                max_id, self.config.vocab_size
            )));
        }
        Ok(())
    }
}
