//! Graph encoder for linearised RDF graphs.
//!
//! [`GraphInput`] carries the id tensors, [`GraphEmbedder`] turns them into
//! dense [`GraphFeatures`], and [`GraphEncoderStack`] runs the stack of
//! [`GraphAttentionLayer`] blocks over them.

pub mod encoder;
pub mod features;
pub mod gat_layer;
pub mod input;

pub use encoder::{GraphEncoderConfig, GraphEncoderStack, ShortcutPolicy};
pub use features::{GraphEmbedder, GraphFeatures};
pub use gat_layer::{GraphAttentionConfig, GraphAttentionLayer, DEFAULT_LEAKY_SLOPE};
pub use input::{identity_adjacency, GraphInput, GraphLayout, MAX_NODES};
