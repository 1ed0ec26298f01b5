//! Argmax decoding, one row per batch element.

use attention::masks::PAD_ID;
use candle_core::Tensor;

use crate::beam::{log_probabilities, top_k, BeamSearchOutput, DecodeRequest};
use crate::errors::GenerationError;
use crate::state::ReorderState;

/// Feeds the most likely token back at every step until each row emits
/// `eos_id` or `max_decode_length` tokens were produced.
///
/// Scores are plain cumulative log-probabilities. The state is never
/// reordered; rows that finished keep receiving `eos_id`.
pub fn greedy_search<S, F>(
    mut symbols_to_logits: F,
    state: &mut S,
    request: &DecodeRequest,
    max_decode_length: usize,
    eos_id: u32,
) -> Result<BeamSearchOutput, GenerationError>
where
    S: ReorderState,
    F: FnMut(&Tensor, usize, &mut S) -> candle_core::Result<Tensor>,
{
    if max_decode_length == 0 {
        return Err(GenerationError::InvalidConfig(
            "max_decode_length must be at least 1".into(),
        ));
    }
    if eos_id == PAD_ID {
        return Err(GenerationError::InvalidConfig(format!(
            "eos_id must differ from the padding id {PAD_ID}"
        )));
    }
    if eos_id as usize >= request.vocab_size || request.start_id as usize >= request.vocab_size {
        return Err(GenerationError::InvalidConfig(format!(
            "start/eos ids must be below vocab size {}",
            request.vocab_size
        )));
    }
    let rows = request.batch_size;
    let mut sequences: Vec<Vec<u32>> = vec![Vec::new(); rows];
    let mut scores = vec![0f64; rows];
    let mut finished = vec![false; rows];

    for step in 0..max_decode_length {
        let tokens: Vec<u32> = sequences
            .iter()
            .zip(&finished)
            .map(|(sequence, done)| match (sequence.last(), done) {
                (_, true) => eos_id,
                (Some(last), false) => *last,
                (None, false) => request.start_id,
            })
            .collect();
        let input = Tensor::from_vec(tokens, (rows, 1), &request.device)?;
        let logits = symbols_to_logits(&input, step, state)?;
        let log_probs = log_probabilities(&logits, rows, request.vocab_size)?;

        for row in 0..rows {
            if finished[row] {
                continue;
            }
            if let Some(&(token, log_prob)) = top_k(&log_probs[row], 1).first() {
                sequences[row].push(token);
                scores[row] += log_prob as f64;
                finished[row] = token == eos_id;
            }
        }
        log::trace!("greedy step {step}: {} rows finished", finished.iter().filter(|f| **f).count());
        if finished.iter().all(|f| *f) {
            break;
        }
    }

    Ok(BeamSearchOutput {
        sequences,
        scores: scores.into_iter().map(|s| s as f32).collect(),
    })
}
