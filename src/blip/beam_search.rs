use ndarray::{Array2, ArrayView1};

use super::blip::GenerationParams;
use crate::error::CaptionError;

/// One decoder forward pass over a batch of same-length hypotheses.
///
/// Returns the logits of the last position for every row: `[batch, vocab]`.
pub trait DecoderStep {
    fn next_token_logits(&mut self, input_ids: &Array2<i64>) -> Result<Array2<f32>, CaptionError>;
}

#[derive(Debug, Clone)]
struct Hypothesis {
    tokens: Vec<i64>,
    score: f32,
}

impl Hypothesis {
    fn normalized_score(&self) -> f32 {
        self.score / self.tokens.len() as f32
    }
}

/// Beam search with early stopping.
///
/// Starts from `prefix`, keeps the `num_beams` best partial sequences by summed
/// log-probability and stops as soon as `num_beams` hypotheses have emitted
/// `eos_token_id`, or when sequences reach `max_length` tokens (prefix included).
/// Returns the tokens generated after the prefix, without the end token.
pub fn beam_search<D: DecoderStep>(
    decoder: &mut D,
    prefix: &[i64],
    eos_token_id: i64,
    params: &GenerationParams,
) -> Result<Vec<i64>, CaptionError> {
    params.validate()?;
    if prefix.is_empty() {
        return Err(CaptionError::generation("decoder prefix is empty"));
    }

    let num_beams = params.num_beams;
    let mut beams = vec![Hypothesis {
        tokens: prefix.to_vec(),
        score: 0.0,
    }];
    let mut finished: Vec<Hypothesis> = Vec::with_capacity(num_beams);

    while beams[0].tokens.len() < params.max_length {
        let seq_len = beams[0].tokens.len();
        let input_ids = Array2::from_shape_fn((beams.len(), seq_len), |(b, i)| beams[b].tokens[i]);

        let logits = decoder.next_token_logits(&input_ids)?;
        if logits.nrows() != beams.len() {
            return Err(CaptionError::Generation(format!(
                "decoder returned {} rows for {} beams",
                logits.nrows(),
                beams.len()
            )));
        }

        let mut candidates: Vec<(usize, i64, f32)> = Vec::with_capacity(beams.len() * 2 * num_beams);
        for (beam_idx, row) in logits.outer_iter().enumerate() {
            let log_probs = log_softmax(row);
            for (token, log_prob) in top_k(&log_probs, 2 * num_beams) {
                candidates.push((beam_idx, token as i64, beams[beam_idx].score + log_prob));
            }
        }
        candidates.sort_by(|a, b| b.2.total_cmp(&a.2));

        let mut next_beams = Vec::with_capacity(num_beams);
        for (rank, (beam_idx, token, score)) in candidates.into_iter().enumerate() {
            if token == eos_token_id {
                // an end token only counts when it ranks among the live beams
                if rank < num_beams {
                    finished.push(Hypothesis {
                        tokens: beams[beam_idx].tokens.clone(),
                        score,
                    });
                }
                continue;
            }

            let mut tokens = Vec::with_capacity(seq_len + 1);
            tokens.extend_from_slice(&beams[beam_idx].tokens);
            tokens.push(token);
            next_beams.push(Hypothesis { tokens, score });

            if next_beams.len() == num_beams {
                break;
            }
        }

        if finished.len() >= num_beams {
            tracing::debug!("All {} beams finished at length {}", num_beams, seq_len + 1);
            break;
        }
        if next_beams.is_empty() {
            break;
        }
        beams = next_beams;
    }

    // beams still alive at the length cap compete with the finished ones
    if finished.len() < num_beams {
        finished.extend(beams);
    }

    let best = finished
        .into_iter()
        .max_by(|a, b| a.normalized_score().total_cmp(&b.normalized_score()))
        .ok_or_else(|| CaptionError::generation("beam search produced no hypothesis"))?;

    tracing::debug!(
        "Best hypothesis: {} tokens, score {:.4}",
        best.tokens.len(),
        best.normalized_score()
    );

    Ok(best.tokens[prefix.len()..].to_vec())
}

fn log_softmax(logits: ArrayView1<f32>) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum_exp: f32 = logits.iter().map(|&x| (x - max).exp()).sum();
    let log_sum = sum_exp.ln();
    logits.iter().map(|&x| x - max - log_sum).collect()
}

fn top_k(values: &[f32], k: usize) -> Vec<(usize, f32)> {
    let mut indexed: Vec<(usize, f32)> = values.iter().copied().enumerate().collect();
    if k < indexed.len() {
        indexed.select_nth_unstable_by(k - 1, |a, b| b.1.total_cmp(&a.1));
        indexed.truncate(k);
    }
    indexed
}
