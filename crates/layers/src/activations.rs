//! Activation catalogue.
//!
//! Every activation promotes its input to [`PrecisionPolicy::compute`], applies
//! the non-linearity and casts back to storage. Shapes are preserved.
//!
//! * **ReLU** is the feed-forward non-linearity and the graph-attention head
//!   aggregation.
//! * **LeakyReLU** computes `max(x, slope * x)` for `0 <= slope < 1` and scores
//!   graph-attention edges.
//! * **GELU** uses the erf form `0.5 * x * (1 + erf(x / sqrt(2)))`.

use std::sync::Arc;

use candle_core::{Error, Result, Tensor};
use serde::{Deserialize, Serialize};

use crate::dtypes::PrecisionPolicy;

/// Identifies which non-linearity an [`Activation`] implements.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivationKind {
    Identity,
    Relu,
    LeakyRelu { slope: f64 },
    Gelu,
    Silu,
}

impl ActivationKind {
    /// LeakyReLU with the Keras default slope of 0.3, as used for graph
    /// attention scores.
    pub fn leaky_relu_default() -> Self {
        ActivationKind::LeakyRelu { slope: 0.3 }
    }
}

/// Common interface shared by activation functions.
pub trait Activation: Send + Sync {
    fn kind(&self) -> ActivationKind;

    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

struct BuiltinActivation {
    kind: ActivationKind,
}

impl Activation for BuiltinActivation {
    fn kind(&self) -> ActivationKind {
        self.kind
    }

    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let compute = policy.cast_for_matmul(input)?;
        let output = match self.kind {
            ActivationKind::Identity => compute,
            ActivationKind::Relu => compute.relu()?,
            ActivationKind::LeakyRelu { slope } => leaky_relu(&compute, slope)?,
            ActivationKind::Gelu => compute.gelu_erf()?,
            ActivationKind::Silu => compute.silu()?,
        };
        policy.cast_to_storage(&output)
    }
}

/// `max(x, slope * x)`, valid for slopes in `[0, 1)`.
pub fn leaky_relu(input: &Tensor, slope: f64) -> Result<Tensor> {
    if !(0.0..1.0).contains(&slope) {
        return Err(Error::Msg(format!(
            "leaky relu slope must be in [0, 1), got {slope}"
        )));
    }
    input.maximum(&input.affine(slope, 0.0)?)
}

/// Returns a shared built-in activation implementation.
pub fn builtin(kind: ActivationKind) -> Arc<dyn Activation> {
    Arc::new(BuiltinActivation { kind })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use std::f64::consts::SQRT_2;

    fn policy() -> PrecisionPolicy {
        PrecisionPolicy::from_parameter_dtype(DType::F32)
    }

    #[test]
    fn gelu_matches_reference_formula() -> Result<()> {
        let input = Tensor::new(&[-2.5f32, -0.5, 0.0, 1.0, 3.0], &Device::Cpu)?;
        let output = builtin(ActivationKind::Gelu).forward(&input, &policy())?;
        let inner = (input.affine(1.0 / SQRT_2, 0.0)?.erf()? + 1.0)?;
        let reference = (input.affine(0.5, 0.0)? * inner)?;
        let diff = (output - reference)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 5e-6);
        Ok(())
    }

    #[test]
    fn leaky_relu_scales_negative_side() -> Result<()> {
        let input = Tensor::new(&[-2.0f32, -0.5, 0.0, 1.5], &Device::Cpu)?;
        let output = builtin(ActivationKind::leaky_relu_default())
            .forward(&input, &policy())?
            .to_vec1::<f32>()?;
        let expected = [-0.6f32, -0.15, 0.0, 1.5];
        for (got, want) in output.iter().zip(expected) {
            assert!((got - want).abs() < 1e-6);
        }
        assert!(leaky_relu(&input, 1.5).is_err());
        Ok(())
    }

    #[test]
    fn relu_zeroes_negatives() -> Result<()> {
        let input = Tensor::new(&[-1.0f32, 2.0], &Device::Cpu)?;
        let out = builtin(ActivationKind::Relu).forward(&input, &policy())?;
        assert_eq!(out.to_vec1::<f32>()?, vec![0.0, 2.0]);
        Ok(())
    }
}
