//! Error types emitted by attention implementations.

/// Attention-specific error category.
#[derive(Debug)]
pub enum AttentionError {
    /// The supplied tensor shapes do not align with the documented contract.
    InvalidShape { context: String },
    /// The kernel does not support the requested data type.
    UnsupportedDType { requested: String },
    /// A module was configured with inconsistent sizes.
    InvalidConfig { context: String },
    /// A backend-specific failure propagated to the caller.
    Backend { message: String },
}

impl AttentionError {
    pub(crate) fn shape(context: impl Into<String>) -> Self {
        AttentionError::InvalidShape {
            context: context.into(),
        }
    }

    pub(crate) fn config(context: impl Into<String>) -> Self {
        AttentionError::InvalidConfig {
            context: context.into(),
        }
    }
}

impl std::fmt::Display for AttentionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttentionError::InvalidShape { context } => {
                write!(f, "invalid tensor shape: {context}")
            }
            AttentionError::UnsupportedDType { requested } => {
                write!(f, "unsupported dtype {requested}")
            }
            AttentionError::InvalidConfig { context } => {
                write!(f, "invalid attention configuration: {context}")
            }
            AttentionError::Backend { message } => f.write_str(message),
        }
    }
}

impl std::error::Error for AttentionError {}

impl From<candle_core::Error> for AttentionError {
    fn from(err: candle_core::Error) -> Self {
        AttentionError::Backend {
            message: err.to_string(),
        }
    }
}

impl From<AttentionError> for candle_core::Error {
    fn from(err: AttentionError) -> Self {
        candle_core::Error::Msg(err.to_string())
    }
}
