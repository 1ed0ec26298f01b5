//! Building blocks shared by the encoder and decoder stacks.
//!
//! Everything here operates on candle tensors and returns
//! `candle_core::Result`. Layers that use dropout take an explicit `training`
//! flag instead of carrying mutable mode state.

pub mod activations;
pub mod checks;
pub mod dropout;
pub mod dtypes;
pub mod linear;
pub mod mlp;
pub mod norm;
pub mod residual;

pub use activations::{builtin, Activation, ActivationKind};
pub use dropout::Dropout;
pub use dtypes::PrecisionPolicy;
pub use linear::{Linear, LinearConfig, LinearInit, LinearLayer};
pub use mlp::{FeedForward, FeedForwardConfig, FeedForwardLayer};
pub use norm::{LayerNorm, NormConfig, NormalizationLayer};
pub use residual::{NormPlacement, Residual, ResidualConfig};
