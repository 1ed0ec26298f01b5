//! Core traits and types shared across attention implementations.
//!
//! Queries, keys and values share the layout `[..., seq_len, depth]` where the
//! leading dimensions (typically `[batch, heads]`) must agree across all three.
//! Additive biases broadcast against `[..., q_len, k_len]`.

pub mod config;
pub mod errors;

use candle_core::Tensor;

pub use config::Config;
pub use errors::AttentionError;

/// Unified interface for attention kernels.
///
/// * The returned tensor mirrors the layout and dtype of `q`, with the value
///   depth as its last dimension.
/// * `bias` holds `0.0` for visible positions and a large negative number for
///   excluded ones.
/// * Dropout is controlled via [`Config::dropout_p`].
pub trait Attention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        bias: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError>;
}
