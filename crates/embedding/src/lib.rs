//! Embedding crate
//!
//! Token embedding tables (shared with the output projection) and the
//! sinusoidal position signal.

pub mod positional;
pub mod token;

pub use positional::{SinusoidalConfig, SinusoidalPositionalEncoding};
pub use token::{TokenEmbedding, TokenEmbeddingConfig};
