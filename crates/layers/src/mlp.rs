//! Position-wise feed-forward network.
//!
//! Two dense layers with a non-linearity (ReLU by default) in between, applied
//! identically at every position: `output(dropout(act(filter(x))))`. The
//! filter layer widens `hidden_size` to `filter_size`; the output layer maps
//! back.

use candle_core::{DType, Device, Result, Tensor, Var};

use crate::{
    activations::{builtin, Activation, ActivationKind},
    dropout::Dropout,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit, LinearLayer},
};

/// Configuration shared by feed-forward networks.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedForwardConfig {
    pub hidden_size: usize,
    /// Width of the inner activation space.
    pub filter_size: usize,
    pub activation: ActivationKind,
    /// Dropout applied to the activations during training.
    pub dropout_p: Option<f32>,
}

impl FeedForwardConfig {
    /// ReLU network without inner dropout.
    pub fn new(hidden_size: usize, filter_size: usize) -> Self {
        Self {
            hidden_size,
            filter_size,
            activation: ActivationKind::Relu,
            dropout_p: None,
        }
    }
}

/// Shared interface for feed-forward stacks.
pub trait FeedForwardLayer: Send + Sync {
    fn config(&self) -> &FeedForwardConfig;

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy, training: bool) -> Result<Tensor>;
}

pub struct FeedForward {
    config: FeedForwardConfig,
    filter: Linear,
    output: Linear,
    activation: std::sync::Arc<dyn Activation>,
    dropout: Dropout,
}

impl std::fmt::Debug for FeedForward {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedForward")
            .field("config", &self.config)
            .finish()
    }
}

impl FeedForward {
    pub fn new(
        config: FeedForwardConfig,
        device: &Device,
        dtype: DType,
        seed: u64,
    ) -> Result<Self> {
        let filter = Linear::with_init(
            LinearConfig::new(config.hidden_size, config.filter_size),
            LinearInit::XavierUniform,
            device,
            dtype,
        )?;
        let output = Linear::with_init(
            LinearConfig::new(config.filter_size, config.hidden_size),
            LinearInit::XavierUniform,
            device,
            dtype,
        )?;
        Ok(Self {
            activation: builtin(config.activation),
            dropout: Dropout::new(config.dropout_p, seed)?,
            config,
            filter,
            output,
        })
    }

    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = self.filter.named_parameters(&format!("{scope}.filter"));
        params.extend(self.output.named_parameters(&format!("{scope}.output")));
        params
    }
}

impl FeedForwardLayer for FeedForward {
    fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy, training: bool) -> Result<Tensor> {
        let inner = self.filter.forward(hidden, policy)?;
        let inner = self.activation.forward(&inner, policy)?;
        let inner = self.dropout.forward(&inner, training, policy)?;
        self.output.forward(&inner, policy)
    }
}
