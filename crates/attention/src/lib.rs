//! Attention primitives for the graph-to-text model.
//!
//! * [`reference::ExactAttention`] implements scaled dot-product attention
//!   behind the [`Attention`] trait.
//! * [`multi_head::MultiHeadAttention`] adds learned projections, head
//!   splitting and an optional incremental cache.
//! * [`masks`] builds padding and causal biases.
//! * [`kv_cache`] holds the per-layer cache records owned by one decode call.

pub mod core;
pub mod kv_cache;
pub mod masks;
pub mod multi_head;
pub mod reference;

pub use core::{Attention, AttentionError, Config};
pub use kv_cache::{DecoderCache, KeyValueCache, KvEntry, LayerCache};
pub use multi_head::{MultiHeadAttention, MultiHeadConfig};
pub use reference::ExactAttention;
