//! Autoregressive decoding drivers.
//!
//! [`beam_search`] and [`greedy_search`] drive a symbols-to-logits closure
//! and keep the decoder state aligned with the surviving hypotheses through
//! [`ReorderState`].

pub mod beam;
pub mod config;
pub mod errors;
pub mod greedy;
pub mod state;

pub use beam::{beam_search, BeamSearchOutput, DecodeRequest};
pub use config::{length_penalty, BeamSearchConfig};
pub use errors::GenerationError;
pub use greedy::greedy_search;
pub use state::ReorderState;
