//! Batched beam search over a symbols-to-logits closure.
//!
//! The closure always sees `batch_size * beam_size` rows laid out beam-major
//! inside each batch element (`row = b * beam_size + j`). Bookkeeping lives on
//! the host; after every step the decoder state is reordered so that row `j`
//! holds the history of the `j`-th surviving beam. Slots without a live beam
//! duplicate slot 0 of the same element.

use attention::masks::PAD_ID;
use candle_core::{DType, Device, Tensor, D};

use crate::config::{length_penalty, BeamSearchConfig};
use crate::errors::GenerationError;
use crate::state::ReorderState;

/// What every decode needs besides the search settings.
#[derive(Debug, Clone)]
pub struct DecodeRequest {
    /// Token fed at step 0; never part of the returned sequences.
    pub start_id: u32,
    pub batch_size: usize,
    pub vocab_size: usize,
    pub device: Device,
}

impl DecodeRequest {
    pub fn new(start_id: u32, batch_size: usize, vocab_size: usize, device: &Device) -> Self {
        Self {
            start_id,
            batch_size,
            vocab_size,
            device: device.clone(),
        }
    }

    fn validate(&self) -> Result<(), GenerationError> {
        if self.batch_size == 0 {
            return Err(GenerationError::config("batch_size must be at least 1"));
        }
        if self.start_id as usize >= self.vocab_size {
            return Err(GenerationError::config(format!(
                "start_id {} outside vocabulary of {}",
                self.start_id, self.vocab_size
            )));
        }
        Ok(())
    }
}

/// Best sequence per batch element, without the start token and ending with
/// eos unless truncated at `max_decode_length`.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamSearchOutput {
    pub sequences: Vec<Vec<u32>>,
    /// Length-normalised log-probability of each sequence.
    pub scores: Vec<f32>,
}

impl BeamSearchOutput {
    /// `([batch, longest] u32 ids zero padded, [batch] f32 scores)`.
    pub fn to_tensors(&self, device: &Device) -> candle_core::Result<(Tensor, Tensor)> {
        let batch = self.sequences.len();
        let width = self.sequences.iter().map(Vec::len).max().unwrap_or(0).max(1);
        let mut ids = vec![0u32; batch * width];
        for (row, sequence) in self.sequences.iter().enumerate() {
            ids[row * width..row * width + sequence.len()].copy_from_slice(sequence);
        }
        let outputs = Tensor::from_vec(ids, (batch, width), device)?;
        let scores = Tensor::from_vec(self.scores.clone(), batch, device)?;
        Ok((outputs, scores))
    }
}

#[derive(Debug, Clone)]
struct Hypothesis {
    tokens: Vec<u32>,
    log_prob: f64,
    score: f64,
}

#[derive(Debug, Default)]
struct ElementBeams {
    live: Vec<Hypothesis>,
    finished: Vec<Hypothesis>,
    done: bool,
}

/// Runs beam search and returns the best hypothesis per batch element.
///
/// `symbols_to_logits(tokens, step, state)` receives the last token of every
/// row as a `[rows, 1]` `u32` tensor and must return `[rows, vocab]` (or
/// `[rows, 1, vocab]`) logits. `state` and whatever the closure captures must
/// already be tiled to `batch_size * beam_size` rows.
pub fn beam_search<S, F>(
    mut symbols_to_logits: F,
    state: &mut S,
    request: &DecodeRequest,
    config: &BeamSearchConfig,
) -> Result<BeamSearchOutput, GenerationError>
where
    S: ReorderState,
    F: FnMut(&Tensor, usize, &mut S) -> candle_core::Result<Tensor>,
{
    request.validate()?;
    config.validate(request.vocab_size)?;
    let beam = config.beam_size;
    let rows = request.batch_size * beam;
    let best_possible_penalty = length_penalty(config.max_decode_length, config.alpha);

    let mut elements: Vec<ElementBeams> = (0..request.batch_size)
        .map(|_| ElementBeams {
            live: vec![Hypothesis {
                tokens: Vec::new(),
                log_prob: 0.0,
                score: 0.0,
            }],
            ..ElementBeams::default()
        })
        .collect();

    for step in 0..config.max_decode_length {
        let tokens = last_tokens(&elements, beam, request.start_id);
        let input = Tensor::from_vec(tokens, (rows, 1), &request.device)?;
        let logits = symbols_to_logits(&input, step, state)?;
        let log_probs = log_probabilities(&logits, rows, request.vocab_size)?;

        let mut gather = Vec::with_capacity(rows);
        for (index, element) in elements.iter_mut().enumerate() {
            let base = index * beam;
            if element.done {
                gather.extend(std::iter::repeat(base as u32).take(beam));
                continue;
            }
            let parents = advance(element, &log_probs[base..base + beam], config);
            let fallback = parents.first().copied().unwrap_or(0);
            gather.extend((0..beam).map(|slot| (base + parents.get(slot).copied().unwrap_or(fallback)) as u32));

            if element.live.is_empty() {
                log::debug!("batch element {index}: every beam finished at step {step}");
                element.done = true;
            } else if let Some(worst) = worst_score(&element.finished) {
                let hopeless = element
                    .live
                    .iter()
                    .all(|hyp| hyp.log_prob / best_possible_penalty < worst);
                if hopeless {
                    log::debug!("batch element {index}: early stop at step {step}");
                    element.done = true;
                }
            }
        }

        let live: usize = elements.iter().map(|e| if e.done { 0 } else { e.live.len() }).sum();
        log::trace!("beam step {step}: {live} live beams");
        if live == 0 {
            break;
        }
        if step + 1 < config.max_decode_length {
            let indices = Tensor::from_vec(gather, rows, &request.device)?;
            state.reorder(&indices)?;
        } else {
            log::debug!("beam search reached max_decode_length {}", config.max_decode_length);
        }
    }

    let mut sequences = Vec::with_capacity(elements.len());
    let mut scores = Vec::with_capacity(elements.len());
    for element in elements {
        let pool = if element.finished.is_empty() {
            element.live
        } else {
            element.finished
        };
        let best = pool
            .into_iter()
            .reduce(|best, hyp| if hyp.score > best.score { hyp } else { best });
        let best = best.ok_or_else(|| GenerationError::config("no hypothesis survived decoding"))?;
        scores.push(best.score as f32);
        sequences.push(best.tokens);
    }
    Ok(BeamSearchOutput { sequences, scores })
}

/// Expands one batch element by a step and returns, for every new live beam,
/// the slot of the beam it continues.
///
/// The top `beam_size` expansions of the live beams are kept. Those ending in
/// eos join the finished set, which holds the best `beam_size` finished
/// hypotheses seen so far and is never displaced by live ones.
fn advance(element: &mut ElementBeams, log_probs: &[Vec<f32>], config: &BeamSearchConfig) -> Vec<usize> {
    let beam = config.beam_size;
    let mut expansions: Vec<(usize, Hypothesis)> = Vec::with_capacity(element.live.len() * beam);
    for (parent, hyp) in element.live.iter().enumerate() {
        let length = hyp.tokens.len() + 1;
        let penalty = length_penalty(length, config.alpha);
        for (token, log_prob) in top_k(&log_probs[parent], beam) {
            let cumulative = hyp.log_prob + log_prob as f64;
            let mut tokens = hyp.tokens.clone();
            tokens.push(token);
            expansions.push((
                parent,
                Hypothesis {
                    tokens,
                    log_prob: cumulative,
                    score: cumulative / penalty,
                },
            ));
        }
    }
    expansions.sort_by(|a, b| b.1.score.total_cmp(&a.1.score));
    expansions.truncate(beam);

    let mut live = Vec::with_capacity(beam);
    let mut parents = Vec::with_capacity(beam);
    for (parent, hyp) in expansions {
        if hyp.tokens.last() == Some(&config.eos_id) {
            element.finished.push(hyp);
        } else {
            live.push(hyp);
            parents.push(parent);
        }
    }
    element.finished.sort_by(|a, b| b.score.total_cmp(&a.score));
    element.finished.truncate(beam);
    element.live = live;
    parents
}

fn worst_score(finished: &[Hypothesis]) -> Option<f64> {
    finished.iter().map(|hyp| hyp.score).reduce(f64::min)
}

fn last_tokens(elements: &[ElementBeams], beam: usize, start_id: u32) -> Vec<u32> {
    let mut tokens = Vec::with_capacity(elements.len() * beam);
    for element in elements {
        let last = |hyp: &Hypothesis| hyp.tokens.last().copied().unwrap_or(start_id);
        let fallback = element.live.first().map(last).unwrap_or(start_id);
        tokens.extend((0..beam).map(|slot| element.live.get(slot).map(last).unwrap_or(fallback)));
    }
    tokens
}

/// Log-softmax of the closure output as host rows.
pub(crate) fn log_probabilities(
    logits: &Tensor,
    rows: usize,
    vocab_size: usize,
) -> Result<Vec<Vec<f32>>, GenerationError> {
    let shape_error = || GenerationError::LogitsShape {
        rows,
        vocab_size,
        actual: logits.dims().to_vec(),
    };
    let flat = match logits.dims() {
        [r, v] if *r == rows && *v == vocab_size => logits.clone(),
        [r, 1, v] if *r == rows && *v == vocab_size => logits.squeeze(1)?,
        _ => return Err(shape_error()),
    };
    let log_probs = candle_nn::ops::log_softmax(&flat.to_dtype(DType::F32)?, D::Minus1)?;
    Ok(log_probs.to_vec2::<f32>()?)
}

/// The `k` best `(token, log_prob)` pairs, highest first, lower id first on
/// ties. The padding id is never proposed.
pub(crate) fn top_k(row: &[f32], k: usize) -> Vec<(u32, f32)> {
    let mut ranked: Vec<(u32, f32)> = row
        .iter()
        .enumerate()
        .map(|(id, lp)| (id as u32, *lp))
        .filter(|(id, _)| *id != PAD_ID)
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.truncate(k);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_k_breaks_ties_by_id() {
        let picked = top_k(&[0.1, 0.5, 0.5, -1.0], 2);
        assert_eq!(picked, vec![(1, 0.5), (2, 0.5)]);
    }

    #[test]
    fn padding_id_is_never_proposed() {
        let picked = top_k(&[5.0, 0.5, -0.5, 0.1], 3);
        assert_eq!(picked, vec![(1, 0.5), (3, 0.1), (2, -0.5)]);
    }

    #[test]
    fn padded_tensors_zero_fill_short_rows() -> candle_core::Result<()> {
        let output = BeamSearchOutput {
            sequences: vec![vec![4, 2], vec![3, 3, 3]],
            scores: vec![-0.5, -1.5],
        };
        let (ids, scores) = output.to_tensors(&Device::Cpu)?;
        assert_eq!(ids.to_vec2::<u32>()?, vec![vec![4, 2, 0], vec![3, 3, 3]]);
        assert_eq!(scores.to_vec1::<f32>()?, vec![-0.5, -1.5]);
        Ok(())
    }

    #[test]
    fn wrong_logit_shape_is_reported() -> candle_core::Result<()> {
        let logits = Tensor::zeros((3, 5), DType::F32, &Device::Cpu)?;
        let err = log_probabilities(&logits, 2, 5).unwrap_err();
        assert!(matches!(err, GenerationError::LogitsShape { rows: 2, .. }));
        Ok(())
    }
}
