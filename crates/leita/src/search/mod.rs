//! Search state machines that turn a stream of logits into chosen tokens.

mod beam;
mod greedy;

pub use beam::BeamSearch;
pub use greedy::GreedySearch;

use std::sync::Arc;

use ndarray::{Array2, ArrayView1, aview1};
use rayon::prelude::*;

use crate::context::{Device, WgpuContext};
use crate::error::{LeitaError, LeitaResult};
use crate::params::SearchParams;
use crate::roaming::RoamingArray;
use crate::sampling::log_softmax_1d_inplace;
use crate::sequences::Sequences;

/// State shared by the greedy and beam variants: parameters, sequence
/// histories, the per-step score table and the done flag.
pub struct SearchState {
    params: SearchParams,
    sequences: Sequences,
    next_token_scores: Array2<f32>,
    sequence_lengths: Vec<u32>,
    done: bool,
    device: Device,
    context: Option<Arc<WgpuContext>>,
}

impl SearchState {
    fn new(params: SearchParams, device: Device) -> LeitaResult<Self> {
        params.validate()?;
        let (device, context) = device.resolve()?;

        let batch_beam_size = params.batch_beam_size();
        let sequences = Sequences::new(
            &params.input_ids,
            params.batch_size,
            params.num_beams,
            params.sequence_length,
            params.max_length,
        );

        Ok(Self {
            sequences,
            next_token_scores: Array2::zeros((batch_beam_size, params.vocab_size)),
            sequence_lengths: vec![params.sequence_length as u32; batch_beam_size],
            done: false,
            device,
            context,
            params,
        })
    }

    /// Copies the last-position logits of every beam row into the score
    /// table and replaces them with log-probabilities.
    ///
    /// `logits` has shape `(batch_beam_size, input_length, vocab_size)`;
    /// `input_length` is the prompt length on the first call and 1 after.
    /// Device-resident buffers are pulled host-side through the roaming
    /// array.
    fn set_logits(&mut self, logits: &mut RoamingArray<f32>) -> LeitaResult<()> {
        let batch_beam_size = self.params.batch_beam_size();
        let vocab_size = self.params.vocab_size;
        let stride = batch_beam_size * vocab_size;

        let host = logits.as_host()?;
        if host.is_empty() || host.len() % stride != 0 {
            return Err(LeitaError::ShapeMismatch {
                context: "logits",
                details: format!(
                    "buffer of {} values is not a non-zero multiple of \
                     batch_beam_size * vocab_size = {}",
                    host.len(),
                    stride
                ),
            });
        }
        let input_length = host.len() / stride;

        for i in 0..batch_beam_size {
            let offset = (i * input_length + (input_length - 1)) * vocab_size;
            let src = &host[offset..offset + vocab_size];
            if src.iter().any(|v| v.is_nan()) {
                return Err(LeitaError::NumericFault(format!(
                    "NaN in logits row {}",
                    i
                )));
            }
            self.next_token_scores.row_mut(i).assign(&aview1(src));
        }

        self.next_token_scores
            .outer_iter_mut()
            .into_par_iter()
            .for_each(|mut row| log_softmax_1d_inplace(&mut row));

        Ok(())
    }

    /// One row of the score table, used by processors and tests.
    pub fn scores(&self, beam_index: usize) -> ArrayView1<'_, f32> {
        self.next_token_scores.row(beam_index)
    }

    pub fn sequence_length(&self) -> usize {
        self.sequences.current_length()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    fn roam(&self, data: Vec<u32>) -> RoamingArray<u32> {
        let array = RoamingArray::from_host(data);
        match &self.context {
            Some(context) => array.with_context(context.clone()),
            None => array,
        }
    }

    fn sequence_roaming(&self, index: usize) -> RoamingArray<u32> {
        self.roam(self.sequences.sequence(index).to_vec())
    }

    fn sequence_lengths_roaming(&self) -> RoamingArray<u32> {
        self.roam(self.sequence_lengths.clone())
    }
}
