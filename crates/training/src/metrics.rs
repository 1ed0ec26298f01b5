use std::time::{Duration, Instant};

use crate::loss::LossMetrics;

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Smoothed loss and gradient norm across optimizer steps.
#[derive(Debug)]
pub struct TrainingMetrics {
    step_timer: Instant,
    steps: usize,
    target_tokens: u64,
    loss_ema: ExponentialMovingAverage,
    grad_norm_ema: ExponentialMovingAverage,
}

impl TrainingMetrics {
    pub fn new() -> Self {
        Self {
            step_timer: Instant::now(),
            steps: 0,
            target_tokens: 0,
            loss_ema: ExponentialMovingAverage::new(0.1),
            grad_norm_ema: ExponentialMovingAverage::new(0.1),
        }
    }

    pub fn record_step(&mut self, tokens: u64, loss: f64, grad_norm: f64, learning_rate: f64) -> StepSnapshot {
        let now = Instant::now();
        let step_duration = now.duration_since(self.step_timer);
        self.step_timer = now;
        self.steps += 1;
        self.target_tokens = self.target_tokens.saturating_add(tokens);

        StepSnapshot {
            step: self.steps,
            loss: self.loss_ema.update(loss),
            step_loss: loss,
            grad_norm: self.grad_norm_ema.update(grad_norm),
            raw_grad_norm: grad_norm,
            learning_rate,
            tokens,
            total_tokens: self.target_tokens,
            step_duration,
        }
    }

    pub fn steps(&self) -> usize {
        self.steps
    }
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct StepSnapshot {
    /// 1-based optimizer step.
    pub step: usize,
    pub loss: f64,
    pub step_loss: f64,
    pub grad_norm: f64,
    pub raw_grad_norm: f64,
    pub learning_rate: f64,
    pub tokens: u64,
    pub total_tokens: u64,
    pub step_duration: Duration,
}

/// Token-weighted loss and accuracy over several evaluation batches.
#[derive(Debug, Default)]
pub struct EvaluationMetrics {
    loss_sum: f64,
    token_count: u64,
    correct_tokens: u64,
}

impl EvaluationMetrics {
    pub fn update(&mut self, metrics: &LossMetrics) {
        let tokens = metrics.total_tokens() as u64;
        self.loss_sum += metrics.average_loss() as f64 * tokens as f64;
        self.token_count += tokens;
        self.correct_tokens += metrics.correct_tokens() as u64;
    }

    pub fn finalize(self) -> Option<EvaluationSummary> {
        if self.token_count == 0 {
            return None;
        }
        let average_loss = self.loss_sum / self.token_count as f64;
        Some(EvaluationSummary {
            average_loss,
            perplexity: average_loss.exp(),
            accuracy: self.correct_tokens as f64 / self.token_count as f64,
            tokens: self.token_count,
        })
    }
}

#[derive(Debug, Clone)]
pub struct EvaluationSummary {
    pub average_loss: f64,
    pub perplexity: f64,
    pub accuracy: f64,
    pub tokens: u64,
}
