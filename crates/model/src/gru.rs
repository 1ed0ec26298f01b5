//! Gated recurrent unit used by the recurrent encoder and decoder.
//!
//! Reset gate applied after the recurrent projection:
//!
//! ```text
//! r  = sigmoid(x_r + h_r)
//! z  = sigmoid(x_z + h_z)
//! n  = tanh(x_n + r * h_n)
//! h' = (1 - z) * n + z * h
//! ```

use candle_core::{DType, Device, Result, Tensor, Var};
use layers::{
    checks,
    linear::{Linear, LinearConfig, LinearInit, LinearLayer},
    PrecisionPolicy,
};

#[derive(Debug, Clone)]
pub struct GruCell {
    input_dim: usize,
    hidden_dim: usize,
    input_proj: Linear,
    recurrent_proj: Linear,
    policy: PrecisionPolicy,
}

impl GruCell {
    pub fn new(input_dim: usize, hidden_dim: usize, device: &Device, dtype: DType) -> Result<Self> {
        let projection = |input: usize| {
            Linear::with_init(
                LinearConfig::new(input, 3 * hidden_dim),
                LinearInit::XavierUniform,
                device,
                dtype,
            )
        };
        Ok(Self {
            input_dim,
            hidden_dim,
            input_proj: projection(input_dim)?,
            recurrent_proj: projection(hidden_dim)?,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
        })
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    /// One step: `input [batch, input_dim]`, `hidden [batch, hidden_dim]`.
    pub fn step(&self, input: &Tensor, hidden: &Tensor) -> Result<Tensor> {
        checks::expect_last_dim("gru.input", input, self.input_dim)?;
        checks::expect_last_dim("gru.hidden", hidden, self.hidden_dim)?;
        let h = self.hidden_dim;
        let x = self.input_proj.forward(input, &self.policy)?;
        let r_h = self.recurrent_proj.forward(hidden, &self.policy)?;

        let reset = candle_nn::ops::sigmoid(&(x.narrow(1, 0, h)? + r_h.narrow(1, 0, h)?)?)?;
        let update = candle_nn::ops::sigmoid(&(x.narrow(1, h, h)? + r_h.narrow(1, h, h)?)?)?;
        let candidate = (x.narrow(1, 2 * h, h)? + (reset * r_h.narrow(1, 2 * h, h)?)?)?.tanh()?;

        let keep = (update.ones_like()? - &update)?;
        (keep * candidate)? + (update * hidden)?
    }

    /// Runs over `[batch, len, input_dim]`, returning every hidden state
    /// `[batch, len, hidden_dim]` (in input order) and the last one.
    pub fn run(&self, sequence: &Tensor, initial: &Tensor, reverse: bool) -> Result<(Tensor, Tensor)> {
        let (_, len, _) = sequence.dims3()?;
        let mut hidden = initial.clone();
        let mut states = Vec::with_capacity(len);
        let order: Box<dyn Iterator<Item = usize>> = if reverse {
            Box::new((0..len).rev())
        } else {
            Box::new(0..len)
        };
        for t in order {
            let input = sequence.narrow(1, t, 1)?.squeeze(1)?;
            hidden = self.step(&input, &hidden)?;
            states.push(hidden.clone());
        }
        if reverse {
            states.reverse();
        }
        Ok((Tensor::stack(&states, 1)?, hidden))
    }

    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = self.input_proj.named_parameters(&format!("{scope}.input"));
        params.extend(self.recurrent_proj.named_parameters(&format!("{scope}.recurrent")));
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hidden_state_stays_bounded() -> Result<()> {
        let device = Device::Cpu;
        let cell = GruCell::new(5, 4, &device, DType::F32)?;
        let sequence = Tensor::randn(0f32, 3.0, (2, 6, 5), &device)?;
        let initial = Tensor::zeros((2, 4), DType::F32, &device)?;
        let (states, last) = cell.run(&sequence, &initial, false)?;
        assert_eq!(states.dims(), &[2, 6, 4]);
        assert_eq!(last.dims(), &[2, 4]);
        assert!(states.abs()?.max_all()?.to_vec0::<f32>()? <= 1.0);
        Ok(())
    }

    #[test]
    fn reverse_run_ends_on_the_first_position() -> Result<()> {
        let device = Device::Cpu;
        let cell = GruCell::new(3, 3, &device, DType::F32)?;
        let sequence = Tensor::randn(0f32, 1.0, (1, 4, 3), &device)?;
        let initial = Tensor::zeros((1, 3), DType::F32, &device)?;
        let (states, last) = cell.run(&sequence, &initial, true)?;
        let first = states.narrow(1, 0, 1)?.squeeze(1)?;
        let diff = (first - last)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }
}
