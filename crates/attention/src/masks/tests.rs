use super::*;
use candle_core::{Device, Result};

#[test]
fn causal_bias_hides_future_positions() -> Result<()> {
    let device = Device::Cpu;
    let bias = causal_bias(3, &device)?;
    assert_eq!(bias.dims(), &[1, 1, 3, 3]);
    let rows = bias.squeeze(0)?.squeeze(0)?.to_vec2::<f32>()?;
    for (i, row) in rows.iter().enumerate() {
        for (j, value) in row.iter().enumerate() {
            if j > i {
                assert_eq!(*value as f64, NEG_INF);
            } else {
                assert_eq!(*value, 0.0);
            }
        }
    }
    Ok(())
}

#[test]
fn padding_bias_marks_zero_ids() -> Result<()> {
    let device = Device::Cpu;
    let ids = Tensor::new(&[[5u32, 7, 0], [1, 0, 0]], &device)?;
    let indicator = padding_indicator(&ids)?.to_vec2::<f32>()?;
    assert_eq!(indicator, vec![vec![0., 0., 1.], vec![0., 1., 1.]]);
    let bias = padding_bias(&ids)?;
    assert_eq!(bias.dims(), &[2, 1, 1, 3]);
    Ok(())
}

#[test]
fn padding_accepts_i64_ids() -> Result<()> {
    let ids = Tensor::new(&[[3i64, 0]], &Device::Cpu)?;
    assert_eq!(padding_indicator(&ids)?.to_vec2::<f32>()?, vec![vec![0., 1.]]);
    Ok(())
}

#[test]
fn decoder_bias_combines_causal_and_padding_with_max() -> Result<()> {
    let device = Device::Cpu;
    let ids = Tensor::new(&[[1u32, 4, 0]], &device)?;
    let bias = decoder_self_attention_bias(&ids)?;
    assert_eq!(bias.dims(), &[1, 1, 3, 3]);
    let rows = bias.flatten_to(1)?.squeeze(0)?.to_vec2::<f32>()?;
    let neg = NEG_INF as f32;
    assert_eq!(rows[0], vec![0.0, neg, neg]);
    assert_eq!(rows[1], vec![0.0, 0.0, neg]);
    // the padded key stays excluded even where causality would allow it
    assert_eq!(rows[2], vec![0.0, 0.0, neg]);
    Ok(())
}
