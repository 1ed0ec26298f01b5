//! Per-call key/value caches for incremental decoding.
//!
//! A [`DecoderCache`] is an indexed array of [`LayerCache`] records, one per
//! decoder layer. It is created at the start of one decode call, mutated in
//! place by every step and dropped when the call returns. Cached projections
//! use the layout `[rows, heads, seq_len, head_dim]` where `rows` is
//! `batch * beam_size` during beam search.

pub mod api;
pub mod layer;

pub use api::KeyValueCache;
pub use layer::{DecoderCache, KvEntry, LayerCache};
