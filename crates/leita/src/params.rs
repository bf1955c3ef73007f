//! Immutable per-generation search parameters.

use crate::error::{LeitaError, LeitaResult};

/// Parameters fixed for the lifetime of one search.
///
/// `input_ids` is the flat row-major prompt of shape
/// `batch_size x sequence_length`. Everything else describes the decode
/// shape and the termination/normalization policy.
#[derive(Clone, Debug)]
pub struct SearchParams {
    pub batch_size: usize,
    pub num_beams: usize,
    /// Prompt length; generation starts appending at this position.
    pub sequence_length: usize,
    pub max_length: usize,
    pub vocab_size: usize,
    pub pad_token_id: u32,
    pub eos_token_id: u32,
    pub length_penalty: f32,
    pub early_stopping: bool,
    pub input_ids: Vec<u32>,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            batch_size: 1,
            num_beams: 1,
            sequence_length: 0,
            max_length: 0,
            vocab_size: 0,
            pad_token_id: 0,
            eos_token_id: 0,
            length_penalty: 1.0,
            early_stopping: false,
            input_ids: Vec::new(),
        }
    }
}

impl SearchParams {
    /// Leading dimension of score and sequence buffers during beam search.
    pub fn batch_beam_size(&self) -> usize {
        self.batch_size * self.num_beams
    }

    /// Checks internal consistency. Called by the search constructors.
    pub fn validate(&self) -> LeitaResult<()> {
        if self.batch_size == 0 {
            return Err(LeitaError::InvalidParams("batch_size must be >= 1".into()));
        }
        if self.num_beams == 0 {
            return Err(LeitaError::InvalidParams("num_beams must be >= 1".into()));
        }
        if self.vocab_size == 0 {
            return Err(LeitaError::InvalidParams("vocab_size must be >= 1".into()));
        }
        if self.sequence_length == 0 {
            return Err(LeitaError::InvalidParams(
                "sequence_length must be >= 1 (empty prompts are not supported)".into(),
            ));
        }
        if self.max_length <= self.sequence_length {
            return Err(LeitaError::InvalidParams(format!(
                "max_length ({}) must exceed sequence_length ({})",
                self.max_length, self.sequence_length
            )));
        }
        let expected = self.batch_size * self.sequence_length;
        if self.input_ids.len() != expected {
            return Err(LeitaError::ShapeMismatch {
                context: "input_ids",
                details: format!(
                    "expected batch_size * sequence_length = {} tokens, got {}",
                    expected,
                    self.input_ids.len()
                ),
            });
        }
        if (self.eos_token_id as usize) >= self.vocab_size {
            return Err(LeitaError::InvalidParams(format!(
                "eos_token_id ({}) outside vocab of size {}",
                self.eos_token_id, self.vocab_size
            )));
        }
        Ok(())
    }
}
