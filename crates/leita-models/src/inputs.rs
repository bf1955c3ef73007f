//! Prompt-derived model inputs: position ids, attention mask and the
//! beam-expanded views the first decoding step feeds to the session.

use leita::SearchParams;
use ndarray::Array2;

/// First-step inputs plus the per-row position counters later steps
/// continue from.
pub struct PromptInputs {
    /// Prompt tokens expanded to `(batch_beam_size, sequence_length)`.
    pub input_ids: Array2<u32>,
    /// Cumulative non-pad position per token, 0 at pad positions.
    pub position_ids: Array2<u32>,
    /// 1 at non-pad positions, 0 at pads.
    pub attention_mask: Array2<u32>,
    /// Per beam row, the position the next generated token will take.
    pub next_positions: Vec<u32>,
}

/// Derives mask and positions from the prompt, fills `sequence_lengths`
/// with each row's non-pad count and expands everything to
/// `batch_beam_size` rows by repetition.
pub fn build_prompt_inputs(params: &SearchParams, sequence_lengths: &mut [u32]) -> PromptInputs {
    let batch_size = params.batch_size;
    let num_beams = params.num_beams;
    let seq_len = params.sequence_length;
    assert_eq!(
        sequence_lengths.len(),
        params.batch_beam_size(),
        "one sequence length slot per beam row required"
    );

    let mut position_ids = Array2::zeros((batch_size, seq_len));
    let mut attention_mask = Array2::zeros((batch_size, seq_len));
    let mut next_positions = Vec::with_capacity(params.batch_beam_size());

    for batch in 0..batch_size {
        let prompt = &params.input_ids[batch * seq_len..(batch + 1) * seq_len];
        let mut abs_position: u32 = 0;
        for (pos, &token) in prompt.iter().enumerate() {
            if token == params.pad_token_id {
                attention_mask[[batch, pos]] = 0;
                position_ids[[batch, pos]] = 0;
            } else {
                attention_mask[[batch, pos]] = 1;
                position_ids[[batch, pos]] = abs_position;
                abs_position += 1;
            }
        }
        for beam in 0..num_beams {
            sequence_lengths[batch * num_beams + beam] = abs_position;
            next_positions.push(abs_position);
        }
    }

    let input_ids = Array2::from_shape_fn((batch_size, seq_len), |(b, p)| {
        params.input_ids[b * seq_len + p]
    });

    PromptInputs {
        input_ids: expand_rows(&input_ids, num_beams),
        position_ids: expand_rows(&position_ids, num_beams),
        attention_mask: expand_rows(&attention_mask, num_beams),
        next_positions,
    }
}

/// Repeats each row `times` times: `(batch, cols)` -> `(batch * times, cols)`.
pub fn expand_rows<T: Clone>(array: &Array2<T>, times: usize) -> Array2<T> {
    let (rows, cols) = array.dim();
    Array2::from_shape_fn((rows * times, cols), |(r, c)| array[[r / times, c]].clone())
}
