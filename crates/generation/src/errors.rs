use thiserror::Error;

/// Failures raised while configuring or running a decode.
///
/// Running out of steps is not an error: sequences that never emit eos are
/// returned truncated at `max_decode_length`.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("invalid decoding configuration: {0}")]
    InvalidConfig(String),

    #[error("logits have shape {actual:?}, expected [{rows}, {vocab_size}]")]
    LogitsShape {
        rows: usize,
        vocab_size: usize,
        actual: Vec<usize>,
    },

    #[error("tensor backend error: {0}")]
    Backend(#[from] candle_core::Error),
}

impl GenerationError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}

impl From<GenerationError> for candle_core::Error {
    fn from(value: GenerationError) -> Self {
        match value {
            GenerationError::Backend(inner) => inner,
            other => candle_core::Error::Msg(other.to_string()),
        }
    }
}
