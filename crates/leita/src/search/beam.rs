//! Beam-search selection over beam-expanded score rows.

use log::debug;

use crate::beams::BeamScorer;
use crate::context::Device;
use crate::error::{LeitaError, LeitaResult};
use crate::params::SearchParams;
use crate::processors::{LogitsProcessor, LogitsProcessorList};
use crate::roaming::RoamingArray;
use crate::search::SearchState;

/// Multi-beam search. Each step adds the cumulative beam scores onto the
/// score rows, selects the top `2*num_beams` continuations per batch row,
/// feeds them through the scorer and appends the surviving beams with their
/// reindexed histories.
pub struct BeamSearch {
    state: SearchState,
    processors: LogitsProcessorList,
    scorer: BeamScorer,
}

impl BeamSearch {
    pub fn new(params: SearchParams, device: Device) -> LeitaResult<Self> {
        if params.num_beams < 2 {
            return Err(LeitaError::InvalidParams(
                "beam search requires num_beams > 1; route num_beams == 1 to GreedySearch"
                    .into(),
            ));
        }
        let scorer = BeamScorer::new(&params);
        let state = SearchState::new(params, device)?;

        debug!(
            "beam search initialized: batch_size={}, num_beams={}, vocab_size={}, max_length={}",
            state.params.batch_size,
            state.params.num_beams,
            state.params.vocab_size,
            state.params.max_length
        );

        Ok(Self {
            state,
            processors: LogitsProcessorList::new(),
            scorer,
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

    /// One beam step: broadcast-add beam scores, take the per-batch top-2K,
    /// let the scorer prune and finalize, then append reindexed tokens.
    pub fn select_top(&mut self) {
        if self.state.done {
            return;
        }
        let num_beams = self.state.params.num_beams;
        let vocab_size = self.state.params.vocab_size;
        let batch_size = self.state.params.batch_size;
        let k2 = 2 * num_beams;

        // next_token_scores += beam_scores[:, None], making every row carry
        // its beam's cumulative log-probability.
        for (slot, mut row) in self.state.next_token_scores.outer_iter_mut().enumerate() {
            let beam_score = self.scorer.beam_scores()[slot];
            row.mapv_inplace(|x| x + beam_score);
        }

        let mut top_scores = vec![0.0f32; batch_size * k2];
        let mut top_tokens = vec![0u32; batch_size * k2];
        let mut top_indices = vec![0u32; batch_size * k2];

        for batch in 0..batch_size {
            // Rank the flattened num_beams * vocab_size candidates of this
            // batch row; equal scores prefer the lower flat index.
            let mut candidates: Vec<(f32, usize)> = Vec::with_capacity(num_beams * vocab_size);
            for beam in 0..num_beams {
                let row = self.state.next_token_scores.row(batch * num_beams + beam);
                let base = beam * vocab_size;
                for (token, &score) in row.iter().enumerate() {
                    candidates.push((score, base + token));
                }
            }
            candidates.sort_unstable_by(|a, b| {
                b.0.partial_cmp(&a.0)
                    .expect("NaN score reached beam selection")
                    .then(a.1.cmp(&b.1))
            });

            for rank in 0..k2 {
                let (score, flat) = candidates[rank];
                let idx = batch * k2 + rank;
                top_scores[idx] = score;
                top_indices[idx] = (flat / vocab_size) as u32;
                top_tokens[idx] = (flat % vocab_size) as u32;
            }
        }

        self.scorer
            .process(&self.state.sequences, &top_scores, &top_tokens, &top_indices);
        self.state
            .sequences
            .append_reindexed(self.scorer.next_indices(), self.scorer.next_tokens());

        if self.state.sequences.current_length() == self.state.params.max_length
            || self.scorer.is_done()
        {
            self.state.done = true;
        }
    }

    /// Ranks hypotheses and writes the top `num_return` sequences per batch,
    /// padded to `max_length`, plus their normalized scores.
    pub fn finalize(
        &mut self,
        num_return: usize,
        out_tokens: &mut [u32],
        out_scores: Option<&mut [f32]>,
    ) -> LeitaResult<()> {
        self.scorer
            .finalize(&self.state.sequences, num_return, out_tokens, out_scores)
    }

    pub fn next_tokens(&self) -> RoamingArray<u32> {
        self.state.roam(self.scorer.next_tokens().to_vec())
    }

    /// Parent beam row per next token, for KV reindexing in the adapter.
    pub fn next_indices(&self) -> RoamingArray<u32> {
        self.state.roam(self.scorer.next_indices().to_vec())
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
