use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::TrainingError;

/// Target id excluded from the loss and from accuracy.
pub const PAD_ID: u32 = 0;

/// Cross entropy with label smoothing; padded targets are ignored.
#[derive(Debug, Clone)]
pub struct CrossEntropyLoss {
    label_smoothing: f32,
    ignore_index: Option<u32>,
}

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label_smoothing(mut self, smoothing: f32) -> Result<Self, TrainingError> {
        if !(0.0..1.0).contains(&smoothing) {
            return Err(TrainingError::initialization(
                "label smoothing must be in [0, 1) for cross entropy",
            ));
        }
        self.label_smoothing = smoothing;
        Ok(self)
    }

    pub fn with_ignore_index(mut self, ignore_index: Option<u32>) -> Self {
        self.ignore_index = ignore_index;
        self
    }

    pub fn label_smoothing(&self) -> f32 {
        self.label_smoothing
    }

    /// `logits [.., vocab]` against integer `targets [..]`.
    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<LossOutput, TrainingError> {
        let dims = logits.dims();
        if dims.len() < 2 {
            return Err(TrainingError::runtime(
                "cross entropy expects logits with at least two dimensions",
            ));
        }
        let vocab_size = dims[dims.len() - 1];
        if vocab_size == 0 {
            return Err(TrainingError::runtime(
                "logits vocabulary dimension must be greater than zero",
            ));
        }
        let token_dims = &dims[..dims.len() - 1];
        if targets.dims() != token_dims {
            return Err(TrainingError::runtime(format!(
                "targets {:?} do not match logits {:?}",
                targets.dims(),
                dims
            )));
        }
        let token_count: usize = token_dims.iter().product();
        if token_count == 0 {
            return Err(TrainingError::runtime(
                "no tokens available for loss computation",
            ));
        }

        let device = logits.device();
        let logits_flat = logits
            .reshape((token_count, vocab_size))?
            .to_dtype(DType::F32)?;
        let log_probs = ops::log_softmax(&logits_flat, D::Minus1)?;

        let targets_flat = targets.to_device(device)?.reshape((token_count,))?;
        let targets_flat = match targets_flat.dtype() {
            DType::U32 => targets_flat,
            DType::I64 | DType::U8 => targets_flat.to_dtype(DType::U32)?,
            dtype => {
                return Err(TrainingError::runtime(format!(
                    "unsupported target dtype {:?} for cross entropy",
                    dtype
                )))
            }
        };

        let valid_mask = match self.ignore_index {
            Some(ignore_index) => targets_flat.ne(ignore_index)?.to_dtype(DType::F32)?,
            None => Tensor::ones((token_count,), DType::F32, device)?,
        };
        let total_tokens = valid_mask.sum_all()?.to_vec0::<f32>()?.round() as usize;
        if total_tokens == 0 {
            return Err(TrainingError::runtime(
                "no valid tokens remain after masking padding",
            ));
        }

        let nll = log_probs
            .gather(&targets_flat.unsqueeze(1)?, 1)?
            .neg()?
            .squeeze(1)?;
        let per_token_loss = if self.label_smoothing > 0.0 {
            let smoothing = self.label_smoothing as f64;
            let uniform = log_probs.mean(1)?.neg()?;
            (nll.affine(1.0 - smoothing, 0.0)? + uniform.affine(smoothing, 0.0)?)?
        } else {
            nll
        };

        let loss = (&per_token_loss * &valid_mask)?
            .sum_all()?
            .affine(1f64 / total_tokens as f64, 0.0)?;
        let average_loss = loss.to_vec0::<f32>()?;

        let correct = logits_flat
            .argmax(D::Minus1)?
            .eq(&targets_flat)?
            .to_dtype(DType::F32)?;
        let correct_tokens = (&correct * &valid_mask)?
            .sum_all()?
            .to_vec0::<f32>()?
            .round() as usize;

        Ok(LossOutput {
            loss,
            metrics: LossMetrics {
                average_loss,
                total_tokens,
                correct_tokens,
            },
        })
    }
}

impl Default for CrossEntropyLoss {
    fn default() -> Self {
        Self {
            label_smoothing: 0.0,
            ignore_index: Some(PAD_ID),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: Tensor,
    pub metrics: LossMetrics,
}

#[derive(Debug, Clone)]
pub struct LossMetrics {
    average_loss: f32,
    total_tokens: usize,
    correct_tokens: usize,
}

impl LossMetrics {
    pub fn average_loss(&self) -> f32 {
        self.average_loss
    }

    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    pub fn correct_tokens(&self) -> usize {
        self.correct_tokens
    }

    pub fn accuracy(&self) -> f32 {
        if self.total_tokens == 0 {
            0.0
        } else {
            self.correct_tokens as f32 / self.total_tokens as f32
        }
    }

    pub fn perplexity(&self) -> f32 {
        self.average_loss.exp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn padding_is_ignored() -> Result<(), TrainingError> {
        let device = Device::Cpu;
        let logits = Tensor::new(
            &[[[4f32, 0.0, 0.0], [0.0, 4.0, 0.0], [9.0, -9.0, 0.0]]],
            &device,
        )?;
        let padded = Tensor::new(&[[1u32, 1, 0]], &device)?;
        let trimmed = Tensor::new(&[[1u32, 1]], &device)?;
        let loss = CrossEntropyLoss::new();
        let full = loss.compute(&logits, &padded)?;
        let short = loss.compute(&logits.narrow(1, 0, 2)?, &trimmed)?;
        assert_eq!(full.metrics.total_tokens(), 2);
        assert_eq!(full.metrics.correct_tokens(), 1);
        assert!((full.metrics.average_loss() - short.metrics.average_loss()).abs() < 1e-6);
        assert!((full.metrics.accuracy() - 0.5).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn smoothing_penalises_confident_predictions() -> Result<(), TrainingError> {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[[20f32, 0.0, 0.0, 0.0]]], &device)?;
        let targets = Tensor::new(&[[0u32]], &device)?;
        let plain = CrossEntropyLoss::new().with_ignore_index(None);
        let smoothed = plain.clone().with_label_smoothing(0.1)?;
        let plain = plain.compute(&logits, &targets)?.metrics.average_loss();
        let smoothed = smoothed.compute(&logits, &targets)?.metrics.average_loss();
        assert!(plain < 1e-6);
        assert!(smoothed > 1.0);
        Ok(())
    }

    #[test]
    fn all_padding_is_an_error() -> Result<(), TrainingError> {
        let device = Device::Cpu;
        let logits = Tensor::zeros((1, 2, 3), DType::F32, &device)?;
        let targets = Tensor::zeros((1, 2), DType::U32, &device)?;
        assert!(CrossEntropyLoss::new().compute(&logits, &targets).is_err());
        Ok(())
    }

    #[test]
    fn invalid_smoothing_is_rejected() {
        assert!(CrossEntropyLoss::new().with_label_smoothing(1.0).is_err());
    }
}
