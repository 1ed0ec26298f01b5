//! Layer normalisation over the trailing axis.
//!
//! Statistics are computed in [`PrecisionPolicy::reduction`] and the output is
//! cast back to storage. Scale and bias are trainable [`Var`]s initialised to
//! ones and zeros.

use candle_core::{DType, Device, Result, Tensor, Var, D};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration for [`LayerNorm`].
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    pub hidden_size: usize,
    /// Numeric stabiliser added to the variance.
    pub epsilon: f64,
}

impl NormConfig {
    pub fn new(hidden_size: usize) -> Self {
        Self {
            hidden_size,
            epsilon: 1e-6,
        }
    }
}

/// Shared interface for normalisation layers.
pub trait NormalizationLayer: Send + Sync {
    fn config(&self) -> &NormConfig;

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// LayerNorm with learnable scale and bias.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    config: NormConfig,
    weight: Var,
    bias: Var,
}

impl LayerNorm {
    /// Constructs a LayerNorm from explicit parameters.
    pub fn new(weight: Tensor, bias: Tensor, config: NormConfig) -> Result<Self> {
        checks::expect_shape("norm.weight", &weight, &[config.hidden_size])?;
        checks::expect_shape("norm.bias", &bias, &[config.hidden_size])?;
        checks::expect_same_dtype("norm.weight", &weight, "norm.bias", &bias)?;
        Ok(Self {
            config,
            weight: Var::from_tensor(&weight)?,
            bias: Var::from_tensor(&bias)?,
        })
    }

    /// Unit scale and zero bias.
    pub fn identity(config: NormConfig, dtype: DType, device: &Device) -> Result<Self> {
        let weight = Tensor::ones(config.hidden_size, dtype, device)?;
        let bias = Tensor::zeros(config.hidden_size, dtype, device)?;
        Self::new(weight, bias, config)
    }

    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        vec![
            (format!("{scope}.scale"), self.weight.clone()),
            (format!("{scope}.bias"), self.bias.clone()),
        ]
    }
}

impl NormalizationLayer for LayerNorm {
    fn config(&self) -> &NormConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_last_dim("norm.input", hidden, self.config.hidden_size)?;

        let compute = policy.cast_for_reduction(hidden)?;
        let mean = compute.mean_keepdim(D::Minus1)?;
        let centered = compute.broadcast_sub(&mean)?;
        let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let denom = (variance + self.config.epsilon)?.sqrt()?;
        let normalized = centered.broadcast_div(&denom)?.to_dtype(policy.compute())?;

        let weight = self.weight.to_dtype(normalized.dtype())?;
        let bias = self.bias.to_dtype(normalized.dtype())?;
        let output = normalized.broadcast_mul(&weight)?.broadcast_add(&bias)?;
        policy.cast_to_storage(&output)
    }
}
