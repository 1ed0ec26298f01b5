use candle_core::{DType, Device, Tensor};
use generation::BeamSearchConfig;
use graph::GraphInput;
use model::{Graph2Text, Prediction};

use crate::{
    config::ExperimentConfig,
    loss::{CrossEntropyLoss, LossOutput, PAD_ID},
    metrics::{EvaluationMetrics, EvaluationSummary, StepSnapshot, TrainingMetrics},
    optimizer::{AdamW, AdamWConfig},
    scheduler::{build_scheduler, LRScheduler},
    TrainingError,
};

/// Single-step trainer: one call to [`Trainer::train_step`] runs one
/// teacher-forced forward pass, one backward pass and one optimizer update.
/// Epochs, data loading and checkpoint cadence belong to the caller.
pub struct Trainer {
    model: Graph2Text,
    optimizer: AdamW,
    scheduler: Box<dyn LRScheduler>,
    loss: CrossEntropyLoss,
    decoding: BeamSearchConfig,
    metrics: TrainingMetrics,
}

impl Trainer {
    pub fn new(config: &ExperimentConfig, device: &Device) -> Result<Self, TrainingError> {
        config.validate()?;
        let model_config = config.resolve_model_config(device)?;
        let model = Graph2Text::new(model_config)
            .map_err(|err| TrainingError::initialization(err.to_string()))?;
        let scheduler = build_scheduler(&config.scheduler, config.model.hidden_size)?;
        let loss = CrossEntropyLoss::new().with_label_smoothing(config.loss.label_smoothing)?;
        Self::from_parts(
            model,
            AdamWConfig::from(&config.optimizer),
            scheduler,
            loss,
            config.decoding.clone(),
        )
    }

    pub fn from_parts(
        model: Graph2Text,
        optimizer: AdamWConfig,
        scheduler: Box<dyn LRScheduler>,
        loss: CrossEntropyLoss,
        decoding: BeamSearchConfig,
    ) -> Result<Self, TrainingError> {
        decoding
            .validate(model.decoder().vocab_size())
            .map_err(|err| TrainingError::initialization(err.to_string()))?;
        let optimizer = AdamW::new(model.named_parameters(), optimizer)?;
        log::info!(
            "trainer ready: {} encoder, {} decoder, label smoothing {}",
            model.encoder().kind(),
            model.decoder().kind(),
            loss.label_smoothing()
        );
        Ok(Self {
            model,
            optimizer,
            scheduler,
            loss,
            decoding,
            metrics: TrainingMetrics::new(),
        })
    }

    pub fn model(&self) -> &Graph2Text {
        &self.model
    }

    pub fn learning_rate(&self) -> f64 {
        self.scheduler.learning_rate()
    }

    /// One optimizer update on `targets [batch, len]` (zero padded, ending in eos).
    ///
    /// Decoders that accumulate their own loss are optimised on it; the
    /// smoothed cross-entropy is still reported for comparability.
    pub fn train_step(&mut self, input: &GraphInput, targets: &Tensor) -> Result<StepSnapshot, TrainingError> {
        let targets = targets.to_dtype(DType::U32)?;
        let output = self.model.train_forward(input, &targets, true)?;
        let LossOutput { loss, metrics } = self.loss.compute(&output.logits, &targets)?;
        let objective = output.loss.unwrap_or(loss);

        let value = objective.to_dtype(DType::F32)?.to_vec0::<f32>()? as f64;
        if !value.is_finite() {
            return Err(TrainingError::runtime(format!(
                "non-finite training loss {value}"
            )));
        }

        let grads = objective.backward()?;
        let learning_rate = self.scheduler.step();
        let grad_norm = self.optimizer.step(&grads, learning_rate)?;

        let snapshot = self.metrics.record_step(
            metrics.total_tokens() as u64,
            value,
            grad_norm,
            learning_rate,
        );
        log::debug!(
            "step {:>6} | loss {:>8.4} | acc {:>6.3} | grad {:>7.4} | lr {:>9.3e}",
            snapshot.step,
            snapshot.step_loss,
            metrics.accuracy(),
            grad_norm,
            learning_rate
        );
        Ok(snapshot)
    }

    /// Token-weighted cross-entropy over `batches`, without dropout or updates.
    pub fn evaluate<'a, I>(&self, batches: I) -> Result<Option<EvaluationSummary>, TrainingError>
    where
        I: IntoIterator<Item = (&'a GraphInput, &'a Tensor)>,
    {
        let mut evaluation = EvaluationMetrics::default();
        for (input, targets) in batches {
            let targets = targets.to_dtype(DType::U32)?;
            if targets.ne(PAD_ID)?.to_dtype(DType::U32)?.sum_all()?.to_vec0::<u32>()? == 0 {
                continue;
            }
            let output = self.model.train_forward(input, &targets, false)?;
            let LossOutput { metrics, .. } = self.loss.compute(&output.logits, &targets)?;
            evaluation.update(&metrics);
        }
        let summary = evaluation.finalize();
        if let Some(summary) = &summary {
            log::info!(
                "evaluation: loss {:.4}, perplexity {:.2}, accuracy {:.3} over {} tokens",
                summary.average_loss,
                summary.perplexity,
                summary.accuracy,
                summary.tokens
            );
        }
        Ok(summary)
    }

    /// Beam-search decoding with the configured decoding settings.
    pub fn predict(&self, input: &GraphInput) -> Result<Prediction, TrainingError> {
        Ok(self.model.predict(input, &self.decoding)?)
    }
}

impl std::fmt::Debug for Trainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trainer")
            .field("model", &self.model)
            .field("optimizer_steps", &self.optimizer.num_steps())
            .field("learning_rate", &self.scheduler.learning_rate())
            .finish()
    }
}
