//! Positional information added to embeddings before the first layer.

pub mod sinusoidal;

pub use sinusoidal::{SinusoidalConfig, SinusoidalPositionalEncoding};
