use attention::masks::PAD_ID;
use serde::{Deserialize, Serialize};

use crate::errors::GenerationError;

/// Beam-search settings. `alpha` and `eos_id` have no defaults and must be
/// supplied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BeamSearchConfig {
    pub beam_size: usize,
    /// Length-penalty exponent in `((5 + len) / 6)^alpha`.
    pub alpha: f64,
    pub max_decode_length: usize,
    pub eos_id: u32,
}

impl BeamSearchConfig {
    pub fn new(beam_size: usize, alpha: f64, max_decode_length: usize, eos_id: u32) -> Self {
        Self {
            beam_size,
            alpha,
            max_decode_length,
            eos_id,
        }
    }

    /// Greedy decoding expressed as a one-beam search.
    pub fn greedy(max_decode_length: usize, eos_id: u32) -> Self {
        Self::new(1, 0.0, max_decode_length, eos_id)
    }

    pub fn validate(&self, vocab_size: usize) -> Result<(), GenerationError> {
        if self.beam_size == 0 {
            return Err(GenerationError::config("beam_size must be at least 1"));
        }
        if self.max_decode_length == 0 {
            return Err(GenerationError::config("max_decode_length must be at least 1"));
        }
        if !self.alpha.is_finite() || self.alpha < 0.0 {
            return Err(GenerationError::config(format!(
                "alpha must be finite and non-negative, got {}",
                self.alpha
            )));
        }
        if self.eos_id == PAD_ID {
            return Err(GenerationError::config(format!(
                "eos_id must differ from the padding id {PAD_ID}"
            )));
        }
        if self.eos_id as usize >= vocab_size {
            return Err(GenerationError::config(format!(
                "eos_id {} outside vocabulary of {vocab_size}",
                self.eos_id
            )));
        }
        Ok(())
    }
}

/// `((5 + length) / 6)^alpha`
pub fn length_penalty(length: usize, alpha: f64) -> f64 {
    ((5.0 + length as f64) / 6.0).powf(alpha)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn penalty_is_one_without_alpha() {
        assert_eq!(length_penalty(7, 0.0), 1.0);
        assert!((length_penalty(1, 0.6) - 1.0).abs() < 1e-12);
        assert!(length_penalty(10, 0.6) > length_penalty(2, 0.6));
    }

    #[test]
    fn validation_rejects_bad_values() {
        assert!(BeamSearchConfig::new(0, 0.6, 5, 2).validate(10).is_err());
        assert!(BeamSearchConfig::new(4, -1.0, 5, 2).validate(10).is_err());
        assert!(BeamSearchConfig::new(4, 0.6, 0, 2).validate(10).is_err());
        assert!(BeamSearchConfig::new(4, 0.6, 5, 10).validate(10).is_err());
        assert!(BeamSearchConfig::new(4, 0.6, 5, 9).validate(10).is_ok());
    }

    #[test]
    fn eos_cannot_be_the_padding_id() {
        let err = BeamSearchConfig::new(4, 0.6, 5, PAD_ID).validate(10).unwrap_err();
        assert!(err.to_string().contains("padding"));
    }

    #[test]
    fn alpha_and_eos_are_required_when_deserialising() {
        let missing: Result<BeamSearchConfig, _> =
            serde_json::from_str(r#"{"beam_size": 4, "max_decode_length": 20}"#);
        assert!(missing.is_err());
        let full: BeamSearchConfig = serde_json::from_str(
            r#"{"beam_size": 4, "alpha": 0.6, "max_decode_length": 20, "eos_id": 2}"#,
        )
        .unwrap();
        assert_eq!(full, BeamSearchConfig::new(4, 0.6, 20, 2));
    }
}
