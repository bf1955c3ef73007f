//! Double-buffered per-beam token histories.

use ndarray::{Array2, s};
use rayon::prelude::*;

/// Token histories for every beam row, `batch_beam_size x max_length`.
///
/// Two physical buffers are held; every append writes the reindexed rows
/// into the inactive buffer and swaps, so beam reindexing never permutes in
/// place. Rows of the same batch start out as `num_beams` copies of that
/// batch's prompt.
pub struct Sequences {
    seqs: Array2<u32>,
    next_seqs: Array2<u32>,
    current_length: usize,
    max_length: usize,
}

impl Sequences {
    pub fn new(
        input_ids: &[u32],
        batch_size: usize,
        num_beams: usize,
        sequence_length: usize,
        max_length: usize,
    ) -> Self {
        assert_eq!(
            input_ids.len(),
            batch_size * sequence_length,
            "input_ids must be batch_size x sequence_length"
        );
        assert!(
            sequence_length < max_length,
            "prompt length {} must be below max_length {}",
            sequence_length,
            max_length
        );

        let batch_beam_size = batch_size * num_beams;
        let mut seqs = Array2::zeros((batch_beam_size, max_length));
        for batch in 0..batch_size {
            let prompt = &input_ids[batch * sequence_length..(batch + 1) * sequence_length];
            for beam in 0..num_beams {
                let row = batch * num_beams + beam;
                for (col, &token) in prompt.iter().enumerate() {
                    seqs[[row, col]] = token;
                }
            }
        }

        Self {
            next_seqs: seqs.clone(),
            seqs,
            current_length: sequence_length,
            max_length,
        }
    }

    pub fn batch_beam_size(&self) -> usize {
        self.seqs.nrows()
    }

    pub fn current_length(&self) -> usize {
        self.current_length
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Valid prefix of one beam row in the current buffer.
    pub fn sequence(&self, index: usize) -> &[u32] {
        let row = self.seqs.row(index);
        &row.to_slice().expect("sequence rows are contiguous")[..self.current_length]
    }

    /// Appends one token per row, keeping each row's own history (greedy
    /// path: the identity permutation of the beam path).
    pub fn append(&mut self, next_tokens: &[u32]) {
        assert_eq!(
            next_tokens.len(),
            self.batch_beam_size(),
            "one next token per beam row required"
        );
        self.write_and_swap(None, next_tokens);
    }

    /// Appends one token per row after re-permuting histories: row `i` of
    /// the new buffer receives the history of row `next_indices[i]`, then
    /// `next_tokens[i]`.
    pub fn append_reindexed(&mut self, next_indices: &[u32], next_tokens: &[u32]) {
        assert_eq!(
            next_indices.len(),
            self.batch_beam_size(),
            "one parent index per beam row required"
        );
        assert_eq!(
            next_tokens.len(),
            self.batch_beam_size(),
            "one next token per beam row required"
        );
        self.write_and_swap(Some(next_indices), next_tokens);
    }

    fn write_and_swap(&mut self, next_indices: Option<&[u32]>, next_tokens: &[u32]) {
        assert!(
            self.current_length < self.max_length,
            "sequence buffer full: current_length={} max_length={}",
            self.current_length,
            self.max_length
        );

        let valid = self.current_length;
        let src = &self.seqs;
        self.next_seqs
            .outer_iter_mut()
            .into_par_iter()
            .enumerate()
            .for_each(|(i, mut dst_row)| {
                let parent = match next_indices {
                    Some(indices) => indices[i] as usize,
                    None => i,
                };
                dst_row
                    .slice_mut(s![..valid])
                    .assign(&src.slice(s![parent, ..valid]));
                dst_row[valid] = next_tokens[i];
            });

        std::mem::swap(&mut self.seqs, &mut self.next_seqs);
        self.current_length += 1;
    }
}
