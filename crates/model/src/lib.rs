//! Encoder/decoder variants and the [`Graph2Text`] orchestrator.

pub mod config;
pub mod decoder;
pub mod encoder;
pub mod gru;
pub mod model;

pub use config::{DecoderKind, EncoderKind, ModelConfig};
pub use decoder::{
    build_decoder, shift_right, DecodeCache, Decoder, DecoderOutput, RecurrentDecoder,
    TransformerDecoderStack,
};
pub use encoder::{
    build_encoder, Encoder, EncoderOutput, GraphAttentionEncoder, RecurrentEncoder,
    TransformerEncoder,
};
pub use model::{Graph2Text, Prediction, TrainOutput};
