//! Greedy and sampling selection over per-batch score rows.

use log::debug;
use ndarray::Array1;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::context::Device;
use crate::error::{LeitaError, LeitaResult};
use crate::params::SearchParams;
use crate::processors::{LogitsProcessor, LogitsProcessorList};
use crate::roaming::RoamingArray;
use crate::sampling::{
    argmax, sample_from_probs, softmax_1d_inplace, top_k_filter_inplace, top_p_filter_inplace,
};
use crate::search::SearchState;

/// Single-beam search: one row per batch entry, selection by argmax or by
/// top-k / top-p sampling. Rows that have produced EOS keep emitting the pad
/// token until every row is finished.
pub struct GreedySearch {
    state: SearchState,
    processors: LogitsProcessorList,
    next_tokens: Vec<u32>,
    eos_seen: Vec<bool>,
    not_done_count: usize,
    rng: StdRng,
}

impl GreedySearch {
    /// Builds a greedy search with an OS-seeded sampler.
    pub fn new(params: SearchParams, device: Device) -> LeitaResult<Self> {
        Self::build(params, device, StdRng::from_entropy())
    }

    /// Builds a greedy search with a fixed sampling seed, for reproducible
    /// top-k / top-p runs.
    pub fn with_seed(params: SearchParams, device: Device, seed: u64) -> LeitaResult<Self> {
        Self::build(params, device, StdRng::seed_from_u64(seed))
    }

    fn build(params: SearchParams, device: Device, rng: StdRng) -> LeitaResult<Self> {
        if params.num_beams != 1 {
            return Err(LeitaError::InvalidParams(format!(
                "greedy search requires num_beams == 1, got {}; use BeamSearch",
                params.num_beams
            )));
        }
        let batch_size = params.batch_size;
        let state = SearchState::new(params, device)?;

        debug!(
            "greedy search initialized: batch_size={}, vocab_size={}, max_length={}",
            batch_size,
            state.params.vocab_size,
            state.params.max_length
        );

        Ok(Self {
            state,
            processors: LogitsProcessorList::new(),
            next_tokens: vec![0; batch_size],
            eos_seen: vec![false; batch_size],
            not_done_count: batch_size,
            rng,
        })
    }

    /// Registers a processor; processors run in registration order after
    /// every `set_logits`.
    pub fn add_processor(&mut self, processor: Box<dyn LogitsProcessor>) {
        self.processors.push(processor);
    }

    pub fn set_logits(&mut self, logits: &mut RoamingArray<f32>) -> LeitaResult<()> {
        self.state.set_logits(logits)?;
        self.processors.apply(
            &self.state.sequences,
            &mut self.state.next_token_scores,
            &self.state.params,
        );
        Ok(())
    }

    /// Argmax selection. Ties break toward the lowest token id.
    pub fn select_top(&mut self) {
        if self.state.done {
            return;
        }
        for batch in 0..self.state.params.batch_size {
            if self.eos_seen[batch] {
                self.next_tokens[batch] = self.state.params.pad_token_id;
                continue;
            }
            let token = argmax(self.state.next_token_scores.row(batch)) as u32;
            self.next_tokens[batch] = token;
            self.note_token(batch, token);
        }
        self.append();
    }

    /// Temperature-scaled top-k sampling.
    pub fn sample_top_k(&mut self, k: usize, temperature: f32) {
        if self.state.done {
            return;
        }
        let temperature = Self::guard_temperature(temperature);
        for batch in 0..self.state.params.batch_size {
            if self.eos_seen[batch] {
                self.next_tokens[batch] = self.state.params.pad_token_id;
                continue;
            }
            let mut row: Array1<f32> = self.state.next_token_scores.row(batch).to_owned();
            row.mapv_inplace(|x| x / temperature);
            top_k_filter_inplace(&mut row, k);
            softmax_1d_inplace(&mut row);
            let token = sample_from_probs(&row, &mut self.rng);
            self.next_tokens[batch] = token;
            self.note_token(batch, token);
        }
        self.append();
    }

    /// Temperature-scaled nucleus sampling: keeps the smallest prefix of the
    /// sorted distribution whose cumulative probability reaches `p`.
    pub fn sample_top_p(&mut self, p: f32, temperature: f32) {
        if self.state.done {
            return;
        }
        let temperature = Self::guard_temperature(temperature);
        for batch in 0..self.state.params.batch_size {
            if self.eos_seen[batch] {
                self.next_tokens[batch] = self.state.params.pad_token_id;
                continue;
            }
            let mut row: Array1<f32> = self.state.next_token_scores.row(batch).to_owned();
            row.mapv_inplace(|x| x / temperature);
            softmax_1d_inplace(&mut row);
            top_p_filter_inplace(&mut row, p);

            let kept: f32 = row.iter().filter(|v| v.is_finite()).sum();
            row.mapv_inplace(|x| if x.is_finite() { x / kept } else { 0.0 });

            let token = sample_from_probs(&row, &mut self.rng);
            self.next_tokens[batch] = token;
            self.note_token(batch, token);
        }
        self.append();
    }

    fn guard_temperature(temperature: f32) -> f32 {
        if temperature < 1e-5 { 1.0 } else { temperature }
    }

    fn note_token(&mut self, batch: usize, token: u32) {
        if token == self.state.params.eos_token_id {
            self.eos_seen[batch] = true;
            self.not_done_count -= 1;
            if self.not_done_count == 0 {
                debug!("all {} batch rows saw eos", self.state.params.batch_size);
                self.state.done = true;
            }
        }
    }

    fn append(&mut self) {
        self.state.sequences.append(&self.next_tokens);
        if self.state.sequences.current_length() == self.state.params.max_length {
            self.state.done = true;
        }
    }

    pub fn next_tokens(&self) -> RoamingArray<u32> {
        self.state.roam(self.next_tokens.clone())
    }

    pub fn sequence(&self, index: usize) -> RoamingArray<u32> {
        self.state.sequence_roaming(index)
    }

    pub fn sequence_lengths(&self) -> RoamingArray<u32> {
        self.state.sequence_lengths_roaming()
    }

    /// Prompt-length slots the model adapter fills with per-row non-pad
    /// counts before the first step.
    pub fn sequence_lengths_mut(&mut self) -> &mut [u32] {
        &mut self.state.sequence_lengths
    }

    pub fn sequence_length(&self) -> usize {
        self.state.sequence_length()
    }

    /// Post-processing view of one score row.
    pub fn scores(&self, index: usize) -> ndarray::ArrayView1<'_, f32> {
        self.state.scores(index)
    }

    pub fn is_done(&self) -> bool {
        self.state.is_done()
    }

    pub fn device(&self) -> Device {
        self.state.device
    }

    pub fn params(&self) -> &SearchParams {
        &self.state.params
    }
}
