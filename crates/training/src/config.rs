use candle_core::{DType, Device};
use generation::BeamSearchConfig;
use graph::{GraphLayout, ShortcutPolicy, DEFAULT_LEAKY_SLOPE};
use layers::NormPlacement;
use model::{DecoderKind, EncoderKind, ModelConfig};
use serde::Deserialize;
use std::{fmt, fs, path::Path};

/// Experiment file: model shape, decoding, optimizer, schedule and loss.
#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentConfig {
    pub model: ModelSection,
    pub decoding: BeamSearchConfig,
    #[serde(default)]
    pub optimizer: OptimizerSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub loss: LossSection,
}

impl ExperimentConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: ExperimentConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };
        config.validate()?;
        log::info!(
            "loaded experiment config from {}: {:?} encoder, {:?} decoder",
            path.display(),
            config.model.encoder,
            config.model.decoder
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();
        let model = &self.model;

        for (name, value) in [
            ("model.src_vocab_size", model.src_vocab_size),
            ("model.tgt_vocab_size", model.tgt_vocab_size),
            ("model.role_vocab_size", model.role_vocab_size),
            ("model.hidden_size", model.hidden_size),
            ("model.filter_size", model.filter_size),
            ("model.num_layers", model.num_layers),
            ("model.num_heads", model.num_heads),
        ] {
            if value == 0 {
                errors.push(format!("{name} must be greater than 0"));
            }
        }

        if model.num_heads > 0 && model.hidden_size % model.num_heads != 0 {
            errors.push(format!(
                "model.hidden_size ({}) must be divisible by model.num_heads ({})",
                model.hidden_size, model.num_heads
            ));
        }

        for (name, value) in [
            ("model.dropout", model.dropout),
            ("model.attention_dropout", model.attention_dropout),
        ] {
            if let Some(p) = value {
                if !(0.0..1.0).contains(&p) {
                    errors.push(format!("{name} must be in [0, 1) (got {p})"));
                }
            }
        }

        if model.start_id == 0 {
            errors.push("model.start_id must not be the padding id 0".to_string());
        } else if model.start_id as usize >= model.tgt_vocab_size {
            errors.push(format!(
                "model.start_id {} outside target vocabulary of {}",
                model.start_id, model.tgt_vocab_size
            ));
        }

        if !(model.temperature.is_finite() && model.temperature > 0.0) {
            errors.push("model.temperature must be greater than 0".to_string());
        }

        if let Err(err) = self.decoding.validate(model.tgt_vocab_size) {
            errors.push(format!("decoding: {err}"));
        }

        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }
        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }
        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }
        if self.optimizer.epsilon <= 0.0 {
            errors.push("optimizer.epsilon must be greater than 0".to_string());
        }
        if let Some(norm) = self.optimizer.clip_global_norm {
            if norm <= 0.0 {
                errors.push("optimizer.clip_global_norm must be greater than 0".to_string());
            }
        }

        match self.scheduler {
            SchedulerSection::Noam {
                warmup_steps,
                factor,
            } => {
                if warmup_steps == 0 {
                    errors.push("scheduler.warmup_steps must be greater than 0".to_string());
                }
                if factor <= 0.0 {
                    errors.push("scheduler.factor must be greater than 0".to_string());
                }
            }
            SchedulerSection::Constant { learning_rate } => {
                if learning_rate <= 0.0 {
                    errors.push("scheduler.learning_rate must be greater than 0".to_string());
                }
            }
        }

        if !(0.0..1.0).contains(&self.loss.label_smoothing) {
            errors.push(format!(
                "loss.label_smoothing must be in [0, 1) (got {})",
                self.loss.label_smoothing
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(TrainingError::validation(errors))
        }
    }

    /// Runtime model configuration placed on `device`.
    pub fn resolve_model_config(&self, device: &Device) -> Result<ModelConfig, TrainingError> {
        let section = &self.model;
        let mut config = ModelConfig::new(
            section.encoder,
            section.decoder,
            section.src_vocab_size,
            section.tgt_vocab_size,
        );
        config.role_vocab_size = section.role_vocab_size;
        config.hidden_size = section.hidden_size;
        config.filter_size = section.filter_size;
        config.num_layers = section.num_layers;
        config.num_heads = section.num_heads;
        config.dropout_p = normalize_dropout(section.dropout);
        config.attention_dropout_p = normalize_dropout(section.attention_dropout);
        config.norm_placement = section.norm_placement;
        config.start_id = section.start_id;
        config.temperature = section.temperature;
        config.seed = section.seed;
        config.dtype = section.precision.dtype();
        config.device = device.clone();
        config
            .validate()
            .map_err(|err| TrainingError::initialization(err.to_string()))?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelSection {
    #[serde(default = "default_encoder")]
    pub encoder: EncoderKind,
    #[serde(default = "default_decoder")]
    pub decoder: DecoderKind,
    pub src_vocab_size: usize,
    pub tgt_vocab_size: usize,
    #[serde(default = "default_role_vocab_size")]
    pub role_vocab_size: usize,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_filter_size")]
    pub filter_size: usize,
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,
    #[serde(default)]
    pub dropout: Option<f32>,
    #[serde(default)]
    pub attention_dropout: Option<f32>,
    #[serde(default)]
    pub norm_placement: NormPlacement,
    #[serde(default = "default_start_id")]
    pub start_id: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub precision: Precision,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Fp32,
    Fp16,
    Bf16,
}

impl Precision {
    pub fn dtype(self) -> DType {
        match self {
            Precision::Fp32 => DType::F32,
            Precision::Fp16 => DType::F16,
            Precision::Bf16 => DType::BF16,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OptimizerSection {
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default)]
    pub clip_global_norm: Option<f64>,
}

impl Default for OptimizerSection {
    fn default() -> Self {
        Self {
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            weight_decay: 0.0,
            clip_global_norm: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum SchedulerSection {
    /// Inverse square root decay after a linear warm-up, scaled by `hidden_size^-0.5`.
    Noam {
        #[serde(default = "default_warmup_steps")]
        warmup_steps: usize,
        #[serde(default = "default_noam_factor")]
        factor: f64,
    },
    Constant { learning_rate: f64 },
}

impl Default for SchedulerSection {
    fn default() -> Self {
        SchedulerSection::Noam {
            warmup_steps: default_warmup_steps(),
            factor: default_noam_factor(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LossSection {
    #[serde(default = "default_label_smoothing")]
    pub label_smoothing: f32,
}

impl Default for LossSection {
    fn default() -> Self {
        Self {
            label_smoothing: default_label_smoothing(),
        }
    }
}

fn default_encoder() -> EncoderKind {
    EncoderKind::Graph {
        shortcut: ShortcutPolicy::Previous,
        leaky_slope: DEFAULT_LEAKY_SLOPE,
        node_positions: false,
        layout: GraphLayout::Reified,
    }
}

fn default_decoder() -> DecoderKind {
    DecoderKind::transformer()
}

fn default_role_vocab_size() -> usize {
    8
}

fn default_hidden_size() -> usize {
    128
}

fn default_filter_size() -> usize {
    512
}

fn default_num_layers() -> usize {
    2
}

fn default_num_heads() -> usize {
    4
}

fn default_start_id() -> u32 {
    1
}

fn default_temperature() -> f64 {
    1.0
}

fn default_seed() -> u64 {
    42
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.98
}

fn default_adam_eps() -> f64 {
    1e-9
}

fn default_warmup_steps() -> usize {
    4_000
}

fn default_noam_factor() -> f64 {
    1.0
}

fn default_label_smoothing() -> f32 {
    0.1
}

fn normalize_dropout(value: Option<f32>) -> Option<f32> {
    value.filter(|p| *p > 0.0)
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "failed to read config: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<candle_core::Error> for TrainingError {
    fn from(value: candle_core::Error) -> Self {
        TrainingError::Runtime(value.to_string())
    }
}
