//! Residual + layer-normalisation wrapper around a sublayer.
//!
//! * `Pre`: `x + dropout(f(norm(x)))`, the layout used by the decoder stacks.
//! * `Post`: `norm(x + dropout(f(x)))`.
//!
//! Pre-norm stacks finish with an extra output normalisation owned by the stack.

use candle_core::{DType, Device, Result, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{
    checks,
    dropout::Dropout,
    dtypes::PrecisionPolicy,
    norm::{LayerNorm, NormConfig, NormalizationLayer},
};

/// Where the normalisation sits relative to the residual addition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormPlacement {
    #[default]
    Pre,
    Post,
}

/// Configuration describing how residual blocks are wired.
#[derive(Debug, Clone, PartialEq)]
pub struct ResidualConfig {
    pub hidden_size: usize,
    pub placement: NormPlacement,
    /// Dropout on the sublayer output during training.
    pub dropout_p: Option<f32>,
}

impl ResidualConfig {
    pub fn new(hidden_size: usize, placement: NormPlacement) -> Self {
        Self {
            hidden_size,
            placement,
            dropout_p: None,
        }
    }
}

/// Wraps one sublayer with normalisation, dropout and a residual connection.
#[derive(Debug, Clone)]
pub struct Residual {
    config: ResidualConfig,
    norm: LayerNorm,
    dropout: Dropout,
}

impl Residual {
    pub fn new(config: ResidualConfig, device: &Device, dtype: DType, seed: u64) -> Result<Self> {
        let norm = LayerNorm::identity(NormConfig::new(config.hidden_size), dtype, device)?;
        let dropout = Dropout::new(config.dropout_p, seed)?;
        Ok(Self {
            config,
            norm,
            dropout,
        })
    }

    pub fn config(&self) -> &ResidualConfig {
        &self.config
    }

    /// Adds two tensors of identical shape in the compute dtype.
    pub fn add(&self, branch: &Tensor, residual: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_shape("residual.branch", branch, residual.dims())?;
        checks::expect_same_dtype("residual.branch", branch, "residual.input", residual)?;
        let added = (policy.cast_for_matmul(branch)? + policy.cast_for_matmul(residual)?)?;
        policy.cast_to_storage(&added)
    }

    /// Runs `sublayer` inside the configured wrapper.
    pub fn forward<F>(
        &self,
        input: &Tensor,
        policy: &PrecisionPolicy,
        training: bool,
        sublayer: F,
    ) -> Result<Tensor>
    where
        F: FnOnce(&Tensor) -> Result<Tensor>,
    {
        match self.config.placement {
            NormPlacement::Pre => {
                let normed = self.norm.forward(input, policy)?;
                let branch = sublayer(&normed)?;
                let branch = self.dropout.forward(&branch, training, policy)?;
                self.add(&branch, input, policy)
            }
            NormPlacement::Post => {
                let branch = sublayer(input)?;
                let branch = self.dropout.forward(&branch, training, policy)?;
                let added = self.add(&branch, input, policy)?;
                self.norm.forward(&added, policy)
            }
        }
    }

    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        self.norm.named_parameters(&format!("{scope}.layer_norm"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> PrecisionPolicy {
        PrecisionPolicy::from_parameter_dtype(DType::F32)
    }

    #[test]
    fn prenorm_adds_branch_to_raw_input() -> Result<()> {
        let device = Device::Cpu;
        let residual = Residual::new(ResidualConfig::new(3, NormPlacement::Pre), &device, DType::F32, 0)?;
        let input = Tensor::new(&[[[1f32, 2., 3.]]], &device)?;
        let out = residual.forward(&input, &policy(), false, |normed| {
            let mean = normed.mean_all()?.to_vec0::<f32>()?;
            assert!(mean.abs() < 1e-6);
            Tensor::full(0.5f32, (1, 1, 3), &device)
        })?;
        assert_eq!(out.flatten_all()?.to_vec1::<f32>()?, vec![1.5, 2.5, 3.5]);
        Ok(())
    }

    #[test]
    fn postnorm_normalises_the_sum() -> Result<()> {
        let device = Device::Cpu;
        let residual = Residual::new(ResidualConfig::new(4, NormPlacement::Post), &device, DType::F32, 0)?;
        let input = Tensor::new(&[[[1f32, 2., 3., 4.]]], &device)?;
        let out = residual.forward(&input, &policy(), false, |x| x.affine(1.0, 0.0))?;
        let mean = out.mean_all()?.to_vec0::<f32>()?;
        assert!(mean.abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn mismatched_branch_is_rejected() -> Result<()> {
        let device = Device::Cpu;
        let residual = Residual::new(ResidualConfig::new(4, NormPlacement::Pre), &device, DType::F32, 0)?;
        let input = Tensor::zeros((1, 2, 4), DType::F32, &device)?;
        let result = residual.forward(&input, &policy(), false, |x| x.narrow(1, 0, 1));
        assert!(result.is_err());
        Ok(())
    }
}
