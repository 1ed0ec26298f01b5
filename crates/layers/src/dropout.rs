//! Seeded inverted dropout.
//!
//! Masks are sampled from a small deterministic generator so two runs with the
//! same seed drop the same units. Dropout is a no-op whenever `training` is
//! false or the probability is zero.

use std::{fmt, sync::Mutex};

use candle_core::{Error, Result, Tensor};

use crate::dtypes::PrecisionPolicy;

/// Inverted dropout with a per-layer seeded generator.
pub struct Dropout {
    probability: f32,
    rng: Mutex<Lcg64>,
}

impl fmt::Debug for Dropout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dropout")
            .field("probability", &self.probability)
            .finish()
    }
}

impl Clone for Dropout {
    fn clone(&self) -> Self {
        let state = match self.rng.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        Self {
            probability: self.probability,
            rng: Mutex::new(state),
        }
    }
}

impl Dropout {
    /// Builds a dropout layer; `None` disables it.
    pub fn new(probability: Option<f32>, seed: u64) -> Result<Self> {
        let probability = probability.unwrap_or(0.0);
        if !(0.0..1.0).contains(&probability) {
            return Err(Error::Msg(format!(
                "dropout probability must be in [0, 1), got {probability}"
            )));
        }
        Ok(Self {
            probability,
            rng: Mutex::new(Lcg64::new(seed)),
        })
    }

    /// A dropout layer that never drops anything.
    pub fn disabled() -> Self {
        Self {
            probability: 0.0,
            rng: Mutex::new(Lcg64::new(0)),
        }
    }

    pub fn probability(&self) -> f32 {
        self.probability
    }

    /// Zeroes units with the configured probability and rescales the survivors.
    pub fn forward(&self, input: &Tensor, training: bool, policy: &PrecisionPolicy) -> Result<Tensor> {
        if !training || self.probability == 0.0 {
            return Ok(input.clone());
        }
        let keep = 1.0 - self.probability;
        let total = input.elem_count();
        let mask: Vec<f32> = {
            let mut rng = self
                .rng
                .lock()
                .map_err(|_| Error::Msg("dropout RNG mutex poisoned".into()))?;
            (0..total)
                .map(|_| if rng.next_f32() < keep { 1.0 / keep } else { 0.0 })
                .collect()
        };
        let compute = policy.cast_for_matmul(input)?;
        let mask = Tensor::from_vec(mask, input.dims(), input.device())?.to_dtype(compute.dtype())?;
        policy.cast_to_storage(&(compute * mask)?)
    }
}

/// 64-bit linear congruential generator (Knuth MMIX constants).
#[derive(Debug, Clone)]
struct Lcg64 {
    state: u64,
}

impl Lcg64 {
    fn new(seed: u64) -> Self {
        Self {
            state: seed ^ 0x9E37_79B9_7F4A_7C15,
        }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.state
    }

    fn next_f32(&mut self) -> f32 {
        const SCALE: f64 = 1.0 / ((1u64 << 53) as f64);
        ((self.next_u64() >> 11) as f64 * SCALE) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn policy() -> PrecisionPolicy {
        PrecisionPolicy::from_parameter_dtype(DType::F32)
    }

    #[test]
    fn preserves_expectation() -> Result<()> {
        let dropout = Dropout::new(Some(0.25), 123)?;
        let input = Tensor::ones((4, 8, 16), DType::F32, &Device::Cpu)?;
        let values = dropout
            .forward(&input, true, &policy())?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        assert!((mean - 1.0).abs() < 0.1);
        assert!(values.iter().any(|v| *v == 0.0));
        Ok(())
    }

    #[test]
    fn identity_outside_training() -> Result<()> {
        let dropout = Dropout::new(Some(0.5), 0)?;
        let input = Tensor::randn(0f32, 1.0, (2, 3, 3, 4), &Device::Cpu)?;
        let out = dropout.forward(&input, false, &policy())?;
        let diff = (input - out)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn same_seed_same_mask() -> Result<()> {
        let input = Tensor::ones((3, 5), DType::F32, &Device::Cpu)?;
        let a = Dropout::new(Some(0.5), 7)?.forward(&input, true, &policy())?;
        let b = Dropout::new(Some(0.5), 7)?.forward(&input, true, &policy())?;
        assert_eq!(a.to_vec2::<f32>()?, b.to_vec2::<f32>()?);
        assert!(Dropout::new(Some(1.0), 0).is_err());
        Ok(())
    }
}
