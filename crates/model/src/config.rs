use candle_core::{DType, Device, Error, Result};
use graph::{GraphLayout, ShortcutPolicy, DEFAULT_LEAKY_SLOPE};
use layers::NormPlacement;
use serde::{Deserialize, Serialize};

fn default_leaky_slope() -> f64 {
    DEFAULT_LEAKY_SLOPE
}

fn default_true() -> bool {
    true
}

/// Encoder variant, resolved once when the model is built.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EncoderKind {
    Graph {
        #[serde(default)]
        shortcut: ShortcutPolicy,
        #[serde(default = "default_leaky_slope")]
        leaky_slope: f64,
        #[serde(default)]
        node_positions: bool,
        /// Input layout the embedder is built for.
        #[serde(default)]
        layout: GraphLayout,
    },
    Transformer,
    Recurrent,
}

impl EncoderKind {
    /// Graph attention encoder with shortcuts after the first layer.
    pub fn graph() -> Self {
        Self::Graph {
            shortcut: ShortcutPolicy::Previous,
            leaky_slope: DEFAULT_LEAKY_SLOPE,
            node_positions: false,
            layout: GraphLayout::Reified,
        }
    }

    /// Graph attention encoder fed role/adjacency inputs.
    pub fn graph_with_roles() -> Self {
        Self::Graph {
            shortcut: ShortcutPolicy::Previous,
            leaky_slope: DEFAULT_LEAKY_SLOPE,
            node_positions: false,
            layout: GraphLayout::Roles,
        }
    }
}

/// Decoder variant, resolved once when the model is built.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecoderKind {
    Transformer {
        /// Reuse the target embedding table as the output projection.
        #[serde(default = "default_true")]
        tie_embeddings: bool,
    },
    Recurrent,
}

impl DecoderKind {
    pub fn transformer() -> Self {
        Self::Transformer {
            tie_embeddings: true,
        }
    }
}

/// Runtime configuration for [`crate::Graph2Text`] and its components.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub encoder: EncoderKind,
    pub decoder: DecoderKind,
    pub src_vocab_size: usize,
    pub tgt_vocab_size: usize,
    /// Structural roles of the role/adjacency input layout; unused by
    /// reified inputs.
    pub role_vocab_size: usize,
    pub hidden_size: usize,
    pub filter_size: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    /// Dropout on embeddings, sublayer outputs and graph attention.
    pub dropout_p: Option<f32>,
    pub attention_dropout_p: Option<f32>,
    pub norm_placement: NormPlacement,
    /// First decoder input token; never the padding id.
    pub start_id: u32,
    /// Training logits are divided by this value.
    pub temperature: f64,
    pub seed: u64,
    pub dtype: DType,
    pub device: Device,
}

impl ModelConfig {
    pub fn new(
        encoder: EncoderKind,
        decoder: DecoderKind,
        src_vocab_size: usize,
        tgt_vocab_size: usize,
    ) -> Self {
        Self {
            encoder,
            decoder,
            src_vocab_size,
            tgt_vocab_size,
            role_vocab_size: 8,
            hidden_size: 128,
            filter_size: 512,
            num_layers: 2,
            num_heads: 4,
            dropout_p: None,
            attention_dropout_p: None,
            norm_placement: NormPlacement::Pre,
            start_id: 1,
            temperature: 1.0,
            seed: 0,
            dtype: DType::F32,
            device: Device::Cpu,
        }
    }

    /// Validate structural invariants before any parameter is allocated.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("src_vocab_size", self.src_vocab_size),
            ("tgt_vocab_size", self.tgt_vocab_size),
            ("role_vocab_size", self.role_vocab_size),
            ("hidden_size", self.hidden_size),
            ("filter_size", self.filter_size),
            ("num_layers", self.num_layers),
            ("num_heads", self.num_heads),
        ] {
            if value == 0 {
                return Err(Error::Msg(format!("{name} must be greater than zero")));
            }
        }
        if self.hidden_size % self.num_heads != 0 {
            return Err(Error::Msg(format!(
                "hidden_size ({}) must be divisible by num_heads ({})",
                self.hidden_size, self.num_heads
            )));
        }
        for (name, p) in [
            ("dropout_p", self.dropout_p),
            ("attention_dropout_p", self.attention_dropout_p),
        ] {
            if let Some(p) = p {
                if !(0.0..1.0).contains(&p) {
                    return Err(Error::Msg(format!("{name} must be in [0, 1)")));
                }
            }
        }
        if self.start_id == 0 {
            return Err(Error::Msg("start_id must not be the padding id 0".into()));
        }
        if self.start_id as usize >= self.tgt_vocab_size {
            return Err(Error::Msg(format!(
                "start_id {} outside target vocabulary of {}",
                self.start_id, self.tgt_vocab_size
            )));
        }
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(Error::Msg("temperature must be positive".into()));
        }
        if let EncoderKind::Graph { leaky_slope, .. } = self.encoder {
            if !(leaky_slope.is_finite() && leaky_slope >= 0.0) {
                return Err(Error::Msg("leaky_slope must be non-negative".into()));
            }
        }
        Ok(())
    }

    pub(crate) fn seed_for(&self, component: u64) -> u64 {
        self.seed.wrapping_mul(1_000).wrapping_add(component)
    }
}
