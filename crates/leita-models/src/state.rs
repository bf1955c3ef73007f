//! Per-step glue between the decoding core and an inference session.

use anyhow::{Result, ensure};
use leita::{RoamingArray, SearchParams};
use log::{debug, trace};
use ndarray::{Array2, Array3, ArrayView2, Axis, concatenate};

use crate::config::DecoderConfig;
use crate::inputs::{PromptInputs, build_prompt_inputs};
use crate::kv::{BeamKvState, LayerKv};

/// Borrowed model inputs for one step. The first step carries the full
/// beam-expanded prompt; later steps carry a single token per beam row.
pub struct ModelInputs<'a> {
    pub input_ids: ArrayView2<'a, u32>,
    pub position_ids: ArrayView2<'a, u32>,
    pub attention_mask: ArrayView2<'a, u32>,
}

/// What the session hands back: logits for the submitted positions and the
/// fresh per-layer KV of exactly those positions.
pub struct SessionOutputs {
    /// `(batch_beam_size, step_length, vocab_size)`.
    pub logits: Array3<f32>,
    pub presents: Vec<LayerKv>,
}

/// The narrow interface the adapter drives each step. Graph execution,
/// weights and devices are the implementor's business.
pub trait DecoderSession: Send {
    fn config(&self) -> &DecoderConfig;

    fn forward(&mut self, inputs: ModelInputs<'_>, past: &BeamKvState) -> Result<SessionOutputs>;
}

/// Owns the evolving model inputs and past-KV state of one generation call.
///
/// Construction derives position ids and the attention mask from the prompt
/// (pads masked out, positions counting non-pad tokens) and fills the
/// search's per-beam sequence lengths. Each `run` submits the step inputs,
/// reindexes the KV rows after beam steps and hands the logits back as a
/// roaming buffer for `set_logits`.
pub struct DecoderState {
    session: Box<dyn DecoderSession>,
    prompt: PromptInputs,
    attention_mask: Array2<u32>,
    next_positions: Vec<u32>,
    kv: BeamKvState,
    batch_beam_size: usize,
    vocab_size: usize,
    step: usize,
}

impl DecoderState {
    pub fn new(
        session: Box<dyn DecoderSession>,
        params: &SearchParams,
        sequence_lengths: &mut [u32],
    ) -> Result<Self> {
        let config = session.config();
        ensure!(
            config.vocab_size == params.vocab_size,
            "session vocab size {} does not match search vocab size {}",
            config.vocab_size,
            params.vocab_size
        );
        ensure!(
            params.max_length <= config.n_ctx,
            "max_length {} exceeds model context {}",
            params.max_length,
            config.n_ctx
        );

        let kv = BeamKvState::new(
            config.n_layer,
            params.batch_beam_size(),
            params.max_length,
            config.n_embd,
        );
        let prompt = build_prompt_inputs(params, sequence_lengths);

        debug!(
            "decoder state ready: batch_beam_size={}, prompt_len={}, layers={}",
            params.batch_beam_size(),
            params.sequence_length,
            config.n_layer
        );

        Ok(Self {
            attention_mask: prompt.attention_mask.clone(),
            next_positions: prompt.next_positions.clone(),
            prompt,
            kv,
            batch_beam_size: params.batch_beam_size(),
            vocab_size: params.vocab_size,
            session,
            step: 0,
        })
    }

    pub fn kv(&self) -> &BeamKvState {
        &self.kv
    }

    /// Runs one model step. The first call submits the full prompt and
    /// ignores `next_tokens`; later calls submit one token per beam row.
    /// `next_indices` reorders the past KV after a beam step.
    pub fn run(
        &mut self,
        next_tokens: &[u32],
        next_indices: Option<&[u32]>,
    ) -> Result<RoamingArray<f32>> {
        let outputs = if self.step == 0 {
            let inputs = ModelInputs {
                input_ids: self.prompt.input_ids.view(),
                position_ids: self.prompt.position_ids.view(),
                attention_mask: self.attention_mask.view(),
            };
            self.session.forward(inputs, &self.kv)?
        } else {
            ensure!(
                next_tokens.len() == self.batch_beam_size,
                "expected {} next tokens, got {}",
                self.batch_beam_size,
                next_tokens.len()
            );
            if let Some(indices) = next_indices {
                trace!("reordering kv rows: {:?}", indices);
                self.kv.reorder(indices);
            }

            let input_ids =
                Array2::from_shape_vec((self.batch_beam_size, 1), next_tokens.to_vec())?;
            let position_ids =
                Array2::from_shape_vec((self.batch_beam_size, 1), self.next_positions.clone())?;
            // this step consumes the stored positions
            for position in &mut self.next_positions {
                *position += 1;
            }
            let ones = Array2::ones((self.batch_beam_size, 1));
            self.attention_mask = concatenate![Axis(1), self.attention_mask, ones];

            let inputs = ModelInputs {
                input_ids: input_ids.view(),
                position_ids: position_ids.view(),
                attention_mask: self.attention_mask.view(),
            };
            self.session.forward(inputs, &self.kv)?
        };

        let (rows, step_len, vocab) = outputs.logits.dim();
        ensure!(
            rows == self.batch_beam_size && vocab == self.vocab_size,
            "session returned logits of shape ({}, {}, {}), expected ({}, _, {})",
            rows,
            step_len,
            vocab,
            self.batch_beam_size,
            self.vocab_size
        );

        self.kv.append(&outputs.presents)?;
        self.step += 1;

        let flat: Vec<f32> = outputs.logits.into_iter().collect();
        Ok(RoamingArray::from_host(flat))
    }
}
