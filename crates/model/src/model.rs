use candle_core::{Result, Tensor, Var};
use generation::{beam_search, greedy_search, BeamSearchConfig, DecodeRequest};
use graph::GraphInput;

use crate::{
    config::ModelConfig,
    decoder::{build_decoder, shift_right, Decoder},
    encoder::{build_encoder, Encoder, EncoderOutput},
};

/// Output of the training entry point.
#[derive(Debug, Clone)]
pub struct TrainOutput {
    /// `[batch, len, tgt_vocab]`, divided by the configured temperature.
    pub logits: Tensor,
    /// Present for decoders that accumulate their own loss.
    pub loss: Option<Tensor>,
}

/// Output of the inference entry point.
#[derive(Debug, Clone)]
pub struct Prediction {
    /// `[batch, out_len]` token ids, zero padded after each sequence.
    pub outputs: Tensor,
    /// `[batch]` length-normalised log-probabilities.
    pub scores: Tensor,
    pub sequences: Vec<Vec<u32>>,
}

/// Graph-to-text model: one encoder and one decoder resolved from the config.
pub struct Graph2Text {
    config: ModelConfig,
    encoder: Box<dyn Encoder>,
    decoder: Box<dyn Decoder>,
}

impl std::fmt::Debug for Graph2Text {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph2Text")
            .field("encoder", &self.encoder.kind())
            .field("decoder", &self.decoder.kind())
            .finish()
    }
}

impl Graph2Text {
    /// Builds the model; configuration errors surface before any allocation.
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let encoder = build_encoder(&config)?;
        let decoder = build_decoder(&config)?;
        log::info!(
            "graph2text: hidden {}, {} layers, {} heads, vocab {}/{}",
            config.hidden_size,
            config.num_layers,
            config.num_heads,
            config.src_vocab_size,
            config.tgt_vocab_size
        );
        Ok(Self {
            config,
            encoder,
            decoder,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn encoder(&self) -> &dyn Encoder {
        self.encoder.as_ref()
    }

    pub fn decoder(&self) -> &dyn Decoder {
        self.decoder.as_ref()
    }

    pub fn encode(&self, input: &GraphInput, training: bool) -> Result<EncoderOutput> {
        self.encoder.encode(input, training)
    }

    /// Teacher-forced pass over `targets [batch, len]`.
    pub fn train_forward(&self, input: &GraphInput, targets: &Tensor, training: bool) -> Result<TrainOutput> {
        let encoded = self.encoder.encode(input, training)?;
        let decoder_input = shift_right(targets, self.config.start_id)?;
        let output = self
            .decoder
            .forward_teacher_forced(&decoder_input, targets, &encoded, training)?;
        let logits = if self.config.temperature == 1.0 {
            output.logits
        } else {
            output.logits.affine(1.0 / self.config.temperature, 0.0)?
        };
        Ok(TrainOutput {
            logits,
            loss: output.loss,
        })
    }

    /// Beam-search decoding of every graph in the batch.
    pub fn predict(&self, input: &GraphInput, search: &BeamSearchConfig) -> Result<Prediction> {
        search.validate(self.decoder.vocab_size())?;
        let encoded = self.encoder.encode(input, false)?;
        let batch = encoded.batch_size()?;
        let tiled = encoded.tile(search.beam_size)?;
        let mut cache = self.decoder.start_incremental(&tiled)?;
        let request = self.request(batch, input);

        let output = beam_search(
            |tokens, step, cache| self.decoder.step(tokens, step, &tiled, cache),
            &mut cache,
            &request,
            search,
        )?;
        let (outputs, scores) = output.to_tensors(input.device())?;
        Ok(Prediction {
            outputs,
            scores,
            sequences: output.sequences,
        })
    }

    /// Argmax decoding; scores are unnormalised log-probabilities.
    pub fn predict_greedy(&self, input: &GraphInput, max_decode_length: usize, eos_id: u32) -> Result<Prediction> {
        let encoded = self.encoder.encode(input, false)?;
        let batch = encoded.batch_size()?;
        let mut cache = self.decoder.start_incremental(&encoded)?;
        let request = self.request(batch, input);

        let output = greedy_search(
            |tokens, step, cache| self.decoder.step(tokens, step, &encoded, cache),
            &mut cache,
            &request,
            max_decode_length,
            eos_id,
        )?;
        let (outputs, scores) = output.to_tensors(input.device())?;
        Ok(Prediction {
            outputs,
            scores,
            sequences: output.sequences,
        })
    }

    pub fn named_parameters(&self) -> Vec<(String, Var)> {
        let mut params = self.encoder.named_parameters("encoder");
        params.extend(self.decoder.named_parameters("decoder"));
        params
    }

    fn request(&self, batch: usize, input: &GraphInput) -> DecodeRequest {
        DecodeRequest::new(
            self.config.start_id,
            batch,
            self.decoder.vocab_size(),
            input.device(),
        )
    }
}
