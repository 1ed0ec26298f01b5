//! Run-time knobs shared by attention implementations.

/// Configuration driving attention behaviour for one call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    /// Dropout on attention weights. `None` keeps the computation deterministic;
    /// callers pass `None` outside training.
    pub dropout_p: Option<f32>,
}

impl Config {
    /// Enables `dropout_p` only when `training` is set.
    pub fn for_mode(dropout_p: Option<f32>, training: bool) -> Self {
        Self {
            dropout_p: if training { dropout_p } else { None },
        }
    }
}
