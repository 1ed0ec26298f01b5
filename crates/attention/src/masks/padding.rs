//! Padding masks derived from id tensors.

use candle_core::{Result, Tensor};

use super::{bias_from_indicator, MASK_DTYPE, PAD_ID};

/// `[batch, len]` indicator that is `1.0` where the id equals the padding id.
pub fn padding_indicator(ids: &Tensor) -> Result<Tensor> {
    ids.eq(PAD_ID)?.to_dtype(MASK_DTYPE)
}

/// `[batch, 1, 1, len]` additive bias hiding padded keys from every query.
pub fn padding_bias(ids: &Tensor) -> Result<Tensor> {
    let (batch, len) = ids.dims2()?;
    bias_from_indicator(&padding_indicator(ids)?)?.reshape((batch, 1, 1, len))
}
