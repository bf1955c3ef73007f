//! Logits processors: in-place mutations of the score table applied after
//! log-softmax and before selection.

use ndarray::Array2;

use crate::params::SearchParams;
use crate::sampling::apply_repetition_penalty_inplace;
use crate::sequences::Sequences;

/// One score-table mutation. Processors run in registration order and must
/// not reallocate the table.
pub trait LogitsProcessor: Send {
    fn process(&self, sequences: &Sequences, scores: &mut Array2<f32>, params: &SearchParams);
}

/// Forces generation to continue until `min_length` by masking the EOS score.
pub struct MinLength {
    pub min_length: usize,
}

impl LogitsProcessor for MinLength {
    fn process(&self, sequences: &Sequences, scores: &mut Array2<f32>, params: &SearchParams) {
        if sequences.current_length() >= self.min_length {
            return;
        }
        let eos = params.eos_token_id as usize;
        for mut row in scores.outer_iter_mut() {
            row[eos] = f32::NEG_INFINITY;
        }
    }
}

/// Discourages tokens the row has already produced. Sign-aware: negative
/// scores are multiplied by the penalty, non-negative scores divided.
pub struct RepetitionPenalty {
    pub penalty: f32,
}

impl LogitsProcessor for RepetitionPenalty {
    fn process(&self, sequences: &Sequences, scores: &mut Array2<f32>, _params: &SearchParams) {
        if self.penalty == 1.0 {
            return;
        }
        for (i, mut row) in scores.outer_iter_mut().enumerate() {
            apply_repetition_penalty_inplace(&mut row, sequences.sequence(i), self.penalty);
        }
    }
}

/// Registered processors, applied in registration order.
#[derive(Default)]
pub struct LogitsProcessorList {
    processors: Vec<Box<dyn LogitsProcessor>>,
}

impl LogitsProcessorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, processor: Box<dyn LogitsProcessor>) {
        self.processors.push(processor);
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    pub fn apply(&self, sequences: &Sequences, scores: &mut Array2<f32>, params: &SearchParams) {
        for processor in &self.processors {
            processor.process(sequences, scores, params);
        }
    }
}
