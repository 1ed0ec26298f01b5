//! Additive attention biases.
//!
//! Masks are first built as `{0, 1}` indicators (1 = excluded) so that several
//! of them can be combined with an elementwise max, then turned into additive
//! biases by multiplying with [`NEG_INF`]. Biases use dtype [`MASK_DTYPE`] and
//! broadcast against `[batch, heads, q_len, k_len]`.

pub mod causal;
pub mod padding;

use candle_core::{DType, Result, Tensor};

/// Dtype shared by all additive masks.
pub const MASK_DTYPE: DType = DType::F32;

/// Bias assigned to excluded positions. Finite so fully masked rows stay NaN-free.
pub const NEG_INF: f64 = -1e9;

/// Id reserved for padding in every token and node sequence.
pub const PAD_ID: u32 = 0;

pub use causal::{causal_bias, causal_indicator, decoder_self_attention_bias};
pub use padding::{padding_bias, padding_indicator};

/// Turns a `{0, 1}` exclusion indicator into an additive bias.
pub fn bias_from_indicator(indicator: &Tensor) -> Result<Tensor> {
    indicator.to_dtype(MASK_DTYPE)?.affine(NEG_INF, 0.0)
}

/// Combines two exclusion indicators; a position is excluded if either excludes it.
pub fn combine_indicators(left: &Tensor, right: &Tensor) -> Result<Tensor> {
    left.broadcast_maximum(right)
}

#[cfg(test)]
mod tests;
