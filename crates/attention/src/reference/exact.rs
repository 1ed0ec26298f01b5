//! Reference scaled dot-product attention.
//!
//! `weights = softmax(q kᵀ / sqrt(depth) + bias)` and `output = weights v`.
//! Scores, softmax and the weighted sum run in `f32` whatever the input dtype;
//! the output is cast back to the dtype of `q`.

use std::sync::OnceLock;

use candle_core::{DType, Tensor};
use candle_nn::ops::{dropout, softmax_last_dim};

use crate::core::{Attention, AttentionError, Config};

/// Numerically stable, portable attention kernel.
#[derive(Debug, Default)]
pub struct ExactAttention {
    first_call: OnceLock<()>,
}

struct Geometry {
    leading: Vec<usize>,
    q_len: usize,
    k_len: usize,
    depth: usize,
}

impl ExactAttention {
    pub fn new() -> Self {
        Self::default()
    }

    /// Softmax-normalised attention weights shaped `[..., q_len, k_len]` in `f32`.
    ///
    /// No dropout is applied, so every unmasked row sums to one.
    pub fn attention_weights(
        &self,
        q: &Tensor,
        k: &Tensor,
        bias: Option<&Tensor>,
    ) -> Result<Tensor, AttentionError> {
        let geometry = validate_qk(q, k)?;
        let q = q.to_dtype(DType::F32)?;
        let k = k.to_dtype(DType::F32)?;
        let scale = 1.0 / (geometry.depth as f64).sqrt();
        let mut scores = q.matmul(&k.t()?.contiguous()?)?.affine(scale, 0.0)?;

        if let Some(bias) = bias {
            validate_bias(bias, &geometry)?;
            scores = scores.broadcast_add(&bias.to_dtype(DType::F32)?)?;
        }
        Ok(softmax_last_dim(&scores)?)
    }
}

impl Attention for ExactAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        bias: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError> {
        if self.first_call.set(()).is_ok() {
            log::debug!(
                "attention::reference init dtype={:?} dropout={:?}",
                q.dtype(),
                config.dropout_p
            );
        }

        let device = q.device();
        if !device.same_device(k.device()) || !device.same_device(v.device()) {
            return Err(AttentionError::shape("q, k, v must reside on the same device"));
        }
        let dtype = q.dtype();
        if dtype != k.dtype() || dtype != v.dtype() {
            return Err(AttentionError::shape("q, k, v must share the same dtype"));
        }
        if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16 | DType::F64) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{dtype:?}"),
            });
        }

        let geometry = validate_qk(q, k)?;
        let v_dims = v.dims();
        if v_dims.len() != q.rank()
            || v_dims[..geometry.leading.len()] != geometry.leading[..]
            || v_dims[geometry.leading.len()] != geometry.k_len
        {
            return Err(AttentionError::shape(format!(
                "v shape mismatch: expected {:?} + [{}, _], got {:?}",
                geometry.leading, geometry.k_len, v_dims
            )));
        }

        let mut weights = self.attention_weights(q, k, bias)?;
        if let Some(p) = config.dropout_p {
            if !(0.0..1.0).contains(&p) {
                return Err(AttentionError::config(format!(
                    "dropout probability must be in [0, 1), got {p}"
                )));
            }
            if p > 0.0 {
                weights = dropout(&weights, p)?;
            }
        }

        let output = weights.matmul(&v.to_dtype(DType::F32)?.contiguous()?)?;
        Ok(output.to_dtype(dtype)?)
    }
}

fn validate_qk(q: &Tensor, k: &Tensor) -> Result<Geometry, AttentionError> {
    let q_dims = q.dims();
    let k_dims = k.dims();
    if q_dims.len() < 2 {
        return Err(AttentionError::shape(format!(
            "q must be shaped [..., q_len, depth], got {:?}",
            q_dims
        )));
    }
    let rank = q_dims.len();
    if k_dims.len() != rank || k_dims[..rank - 2] != q_dims[..rank - 2] || k_dims[rank - 1] != q_dims[rank - 1] {
        return Err(AttentionError::shape(format!(
            "k shape mismatch: q is {:?}, k is {:?}",
            q_dims, k_dims
        )));
    }
    if q_dims[rank - 1] == 0 {
        return Err(AttentionError::shape("attention depth must be non-zero"));
    }
    Ok(Geometry {
        leading: q_dims[..rank - 2].to_vec(),
        q_len: q_dims[rank - 2],
        k_len: k_dims[rank - 2],
        depth: q_dims[rank - 1],
    })
}

fn validate_bias(bias: &Tensor, geometry: &Geometry) -> Result<(), AttentionError> {
    let mut target = geometry.leading.clone();
    target.push(geometry.q_len);
    target.push(geometry.k_len);
    let dims = bias.dims();
    let compatible = dims.len() <= target.len()
        && dims
            .iter()
            .rev()
            .zip(target.iter().rev())
            .all(|(have, want)| *have == 1 || have == want);
    if compatible {
        Ok(())
    } else {
        Err(AttentionError::shape(format!(
            "bias {:?} does not broadcast to scores {:?}",
            dims, target
        )))
    }
}
