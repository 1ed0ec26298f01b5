//! Causal (look-ahead) masks.

use candle_core::{Device, Result, Tensor};

use super::{bias_from_indicator, combine_indicators, padding::padding_indicator, MASK_DTYPE};

/// `[len, len]` indicator that is `1.0` above the diagonal (future positions).
pub fn causal_indicator(len: usize, device: &Device) -> Result<Tensor> {
    let data: Vec<f32> = (0..len)
        .flat_map(|i| (0..len).map(move |j| if j > i { 1.0 } else { 0.0 }))
        .collect();
    Tensor::from_vec(data, (len, len), device)?.to_dtype(MASK_DTYPE)
}

/// `[1, 1, len, len]` additive bias so position `i` only attends to `j <= i`.
pub fn causal_bias(len: usize, device: &Device) -> Result<Tensor> {
    bias_from_indicator(&causal_indicator(len, device)?)?.reshape((1, 1, len, len))
}

/// Decoder self-attention bias `[batch, 1, len, len]`: the causal mask merged
/// with the padding mask of the decoder input ids by elementwise max.
pub fn decoder_self_attention_bias(input_ids: &Tensor) -> Result<Tensor> {
    let (batch, len) = input_ids.dims2()?;
    let causal = causal_indicator(len, input_ids.device())?.reshape((1, len, len))?;
    let padding = padding_indicator(input_ids)?.reshape((batch, 1, len))?;
    let combined = combine_indicators(&causal, &padding)?;
    bias_from_indicator(&combined)?.reshape((batch, 1, len, len))
}
