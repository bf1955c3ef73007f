//! Beam hypothesis pools and the scorer that turns top-2K candidates into
//! the next beam state.

use log::debug;

use crate::error::{LeitaError, LeitaResult};
use crate::params::SearchParams;
use crate::sequences::Sequences;

/// A finished candidate sequence with its length-normalized score.
#[derive(Clone, Debug)]
pub struct BeamHypothesis {
    pub tokens: Vec<u32>,
    pub score: f32,
}

/// Up to `num_beams` finished hypotheses for one batch row, ordered by
/// normalized score. Once full, a candidate is admitted only if it beats the
/// worst stored score; once `done`, nothing further is admitted.
pub struct BeamHypotheses {
    beams: Vec<BeamHypothesis>,
    num_beams: usize,
    length_penalty: f32,
    early_stopping: bool,
    done: bool,
    worst_score: f32,
}

impl BeamHypotheses {
    fn new(num_beams: usize, length_penalty: f32, early_stopping: bool) -> Self {
        Self {
            beams: Vec::with_capacity(num_beams + 1),
            num_beams,
            length_penalty,
            early_stopping,
            done: false,
            worst_score: f32::NEG_INFINITY,
        }
    }

    pub fn len(&self) -> usize {
        self.beams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beams.is_empty()
    }

    /// Normalizes `sum_logprobs` by `len^length_penalty` and inserts the
    /// hypothesis, evicting the worst when the pool is over capacity.
    /// Insertion is stable: an earlier hypothesis wins an equal score.
    fn add(&mut self, tokens: Vec<u32>, sum_logprobs: f32) {
        let score = sum_logprobs / (tokens.len() as f32).powf(self.length_penalty);
        if self.beams.len() == self.num_beams && score <= self.worst_score {
            return;
        }

        let pos = self
            .beams
            .iter()
            .position(|b| b.score < score)
            .unwrap_or(self.beams.len());
        self.beams.insert(pos, BeamHypothesis { tokens, score });
        if self.beams.len() > self.num_beams {
            self.beams.pop();
        }
        self.worst_score = self
            .beams
            .last()
            .map(|b| b.score)
            .unwrap_or(f32::NEG_INFINITY);
    }

    /// Whether this pool can stop: full and either early stopping is on, or
    /// no unfinished beam can beat the worst stored hypothesis even at
    /// `max_length` (the no-hope test).
    fn is_done(&self, best_sum_logprobs: f32, max_length: usize) -> bool {
        if self.beams.len() < self.num_beams {
            return false;
        }
        if self.early_stopping {
            return true;
        }
        let best_possible = best_sum_logprobs / (max_length as f32).powf(self.length_penalty);
        self.worst_score >= best_possible
    }
}

/// Per-batch hypothesis pools plus the working arrays describing the next
/// beam state. Fed top-2K candidates each step; produces the surviving
/// `num_beams` continuations and, at the end, the ranked output sequences.
pub struct BeamScorer {
    batch_size: usize,
    num_beams: usize,
    max_length: usize,
    pad_token_id: u32,
    eos_token_id: u32,
    pools: Vec<BeamHypotheses>,
    beam_scores: Vec<f32>,
    next_beam_tokens: Vec<u32>,
    next_beam_indices: Vec<u32>,
}

impl BeamScorer {
    pub fn new(params: &SearchParams) -> Self {
        let num_beams = params.num_beams;
        let batch_beam_size = params.batch_beam_size();

        // Canonical first-step trick: only beam 0 of each batch is live, so
        // the first expansion diverges instead of picking one token 4 times.
        let mut beam_scores = vec![f32::NEG_INFINITY; batch_beam_size];
        for batch in 0..params.batch_size {
            beam_scores[batch * num_beams] = 0.0;
        }

        Self {
            batch_size: params.batch_size,
            num_beams,
            max_length: params.max_length,
            pad_token_id: params.pad_token_id,
            eos_token_id: params.eos_token_id,
            pools: (0..params.batch_size)
                .map(|_| {
                    BeamHypotheses::new(num_beams, params.length_penalty, params.early_stopping)
                })
                .collect(),
            beam_scores,
            next_beam_tokens: vec![0; batch_beam_size],
            next_beam_indices: (0..batch_beam_size as u32).collect(),
        }
    }

    /// Cumulative log-probability per live beam.
    pub fn beam_scores(&self) -> &[f32] {
        &self.beam_scores
    }

    pub fn next_tokens(&self) -> &[u32] {
        &self.next_beam_tokens
    }

    /// Global parent row per next token.
    pub fn next_indices(&self) -> &[u32] {
        &self.next_beam_indices
    }

    pub fn is_done(&self) -> bool {
        self.pools.iter().all(|pool| pool.done)
    }

    pub fn hypothesis_count(&self, batch: usize) -> usize {
        self.pools[batch].len()
    }

    /// Consumes one step's top-2K candidates (`batch_size x 2*num_beams`,
    /// sorted descending per batch row; parent indices are local to the
    /// batch). EOS candidates ranked inside the beam budget finalize into
    /// the pool; the rest fill the next beam slots.
    pub fn process(
        &mut self,
        sequences: &Sequences,
        top_scores: &[f32],
        top_tokens: &[u32],
        top_indices: &[u32],
    ) {
        let k2 = 2 * self.num_beams;
        assert_eq!(top_scores.len(), self.batch_size * k2);
        assert_eq!(top_tokens.len(), self.batch_size * k2);
        assert_eq!(top_indices.len(), self.batch_size * k2);

        for batch in 0..self.batch_size {
            let pool = &mut self.pools[batch];
            let base = batch * self.num_beams;

            if pool.done {
                // Keep the shape rectangular for finished batches.
                for j in 0..self.num_beams {
                    self.beam_scores[base + j] = 0.0;
                    self.next_beam_tokens[base + j] = self.pad_token_id;
                    self.next_beam_indices[base + j] = base as u32;
                }
                continue;
            }

            let mut filled = 0;
            for rank in 0..k2 {
                let idx = batch * k2 + rank;
                let score = top_scores[idx];
                let token = top_tokens[idx];
                let parent_row = base + top_indices[idx] as usize;

                if token == self.eos_token_id {
                    // Only candidates that would have occupied a beam slot
                    // become hypotheses.
                    if rank >= self.num_beams {
                        continue;
                    }
                    pool.add(sequences.sequence(parent_row).to_vec(), score);
                } else {
                    let slot = base + filled;
                    self.beam_scores[slot] = score;
                    self.next_beam_tokens[slot] = token;
                    self.next_beam_indices[slot] = parent_row as u32;
                    filled += 1;
                    if filled == self.num_beams {
                        break;
                    }
                }
            }
            // 2*num_beams candidates minus at most num_beams EOS entries
            // always leave enough continuations.
            assert_eq!(filled, self.num_beams, "beam slots underfilled");

            let best_unfinished = self.beam_scores[base];
            if pool.is_done(best_unfinished, self.max_length) {
                pool.done = true;
                debug!("batch {} hypothesis pool done", batch);
            }
        }
    }

    /// Admits the live beams of unfinished batches, then writes the top
    /// `num_return` sequences per batch into `out_tokens` (padded to
    /// `max_length`) and their normalized scores into `out_scores`.
    pub fn finalize(
        &mut self,
        sequences: &Sequences,
        num_return: usize,
        out_tokens: &mut [u32],
        mut out_scores: Option<&mut [f32]>,
    ) -> LeitaResult<()> {
        if num_return == 0 || num_return > self.num_beams {
            return Err(LeitaError::InvalidParams(format!(
                "num_return ({}) must be in 1..=num_beams ({})",
                num_return, self.num_beams
            )));
        }
        let expected = self.batch_size * num_return * self.max_length;
        if out_tokens.len() != expected {
            return Err(LeitaError::ShapeMismatch {
                context: "finalize output",
                details: format!(
                    "expected batch_size * num_return * max_length = {} tokens, got {}",
                    expected,
                    out_tokens.len()
                ),
            });
        }
        if let Some(scores) = out_scores.as_deref() {
            if scores.len() != self.batch_size * num_return {
                return Err(LeitaError::ShapeMismatch {
                    context: "finalize scores",
                    details: format!(
                        "expected batch_size * num_return = {} scores, got {}",
                        self.batch_size * num_return,
                        scores.len()
                    ),
                });
            }
        }

        for batch in 0..self.batch_size {
            if !self.pools[batch].done {
                for j in 0..self.num_beams {
                    let row = batch * self.num_beams + j;
                    self.pools[batch]
                        .add(sequences.sequence(row).to_vec(), self.beam_scores[row]);
                }
            }
        }

        for batch in 0..self.batch_size {
            for r in 0..num_return {
                let hyp = &self.pools[batch].beams[r];
                let out =
                    &mut out_tokens[(batch * num_return + r) * self.max_length..][..self.max_length];
                out[..hyp.tokens.len()].copy_from_slice(&hyp.tokens);
                for slot in &mut out[hyp.tokens.len()..] {
                    *slot = self.pad_token_id;
                }
                if let Some(scores) = out_scores.as_deref_mut() {
                    scores[batch * num_return + r] = hyp.score;
                }
            }
        }
        Ok(())
    }
}
