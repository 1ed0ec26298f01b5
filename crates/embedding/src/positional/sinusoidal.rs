//! Fixed sinusoidal position signal.
//!
//! For `hidden` channels there are `hidden / 2` timescales spaced
//! geometrically between `min_timescale` and `max_timescale`. Position `p`
//! maps to `[sin(p / t_0), .., sin(p / t_{n-1}), cos(p / t_0), .., cos(p / t_{n-1})]`.

use candle_core::{bail, DType, Device, Result, Tensor};
use layers::checks;

#[derive(Debug, Clone, PartialEq)]
pub struct SinusoidalConfig {
    pub hidden_size: usize,
    pub min_timescale: f64,
    pub max_timescale: f64,
}

impl SinusoidalConfig {
    pub fn new(hidden_size: usize) -> Self {
        Self {
            hidden_size,
            min_timescale: 1.0,
            max_timescale: 1.0e4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SinusoidalPositionalEncoding {
    config: SinusoidalConfig,
    inv_timescales: Vec<f64>,
}

impl SinusoidalPositionalEncoding {
    pub fn new(config: SinusoidalConfig) -> Result<Self> {
        if config.hidden_size == 0 || config.hidden_size % 2 != 0 {
            bail!(
                "sinusoidal encoding needs an even, non-zero hidden size, got {}",
                config.hidden_size
            );
        }
        if config.min_timescale <= 0.0 || config.max_timescale < config.min_timescale {
            bail!(
                "invalid timescales min={} max={}",
                config.min_timescale,
                config.max_timescale
            );
        }
        let num_timescales = config.hidden_size / 2;
        let log_increment = (config.max_timescale / config.min_timescale).ln()
            / (num_timescales.saturating_sub(1).max(1)) as f64;
        let inv_timescales = (0..num_timescales)
            .map(|i| config.min_timescale * (-(i as f64) * log_increment).exp())
            .collect();
        Ok(Self {
            config,
            inv_timescales,
        })
    }

    pub fn config(&self) -> &SinusoidalConfig {
        &self.config
    }

    /// Signal for positions `offset..offset + length`, shaped `[length, hidden]`.
    pub fn encode(&self, offset: usize, length: usize, device: &Device, dtype: DType) -> Result<Tensor> {
        let hidden = self.config.hidden_size;
        let half = hidden / 2;
        let mut data = vec![0f32; length * hidden];
        for (row, position) in (offset..offset + length).enumerate() {
            for (i, inv) in self.inv_timescales.iter().enumerate() {
                let angle = position as f64 * inv;
                data[row * hidden + i] = angle.sin() as f32;
                data[row * hidden + half + i] = angle.cos() as f32;
            }
        }
        Tensor::from_vec(data, (length, hidden), device)?.to_dtype(dtype)
    }

    /// Adds the signal for positions starting at `offset` to `[batch, len, hidden]`.
    pub fn add_to(&self, hidden: &Tensor, offset: usize) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("positional.input", hidden, self.config.hidden_size)?;
        let (_, len, _) = hidden.dims3()?;
        let signal = self.encode(offset, len, hidden.device(), hidden.dtype())?;
        hidden.broadcast_add(&signal.unsqueeze(0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_position_is_sin_zero_cos_one() -> Result<()> {
        let pe = SinusoidalPositionalEncoding::new(SinusoidalConfig::new(8))?;
        let row = pe.encode(0, 1, &Device::Cpu, DType::F32)?.to_vec2::<f32>()?;
        assert_eq!(row[0], vec![0., 0., 0., 0., 1., 1., 1., 1.]);
        Ok(())
    }

    #[test]
    fn fastest_channel_matches_closed_form() -> Result<()> {
        let pe = SinusoidalPositionalEncoding::new(SinusoidalConfig::new(6))?;
        let rows = pe.encode(0, 4, &Device::Cpu, DType::F32)?.to_vec2::<f32>()?;
        for (p, row) in rows.iter().enumerate() {
            assert!((row[0] - (p as f32).sin()).abs() < 1e-6);
            assert!((row[3] - (p as f32).cos()).abs() < 1e-6);
            // slowest channel uses the max timescale
            assert!((row[2] - (p as f32 / 1.0e4).sin()).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn offset_matches_slice_of_longer_signal() -> Result<()> {
        let pe = SinusoidalPositionalEncoding::new(SinusoidalConfig::new(16))?;
        let long = pe.encode(0, 10, &Device::Cpu, DType::F32)?;
        let tail = pe.encode(7, 3, &Device::Cpu, DType::F32)?;
        let diff = (long.narrow(0, 7, 3)? - tail)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn odd_hidden_size_is_rejected() {
        assert!(SinusoidalPositionalEncoding::new(SinusoidalConfig::new(7)).is_err());
    }
}
