//! A deterministic scripted session used by the adapter tests.

use anyhow::Result;
use ndarray::Array3;

use crate::config::DecoderConfig;
use crate::kv::{BeamKvState, LayerKv};
use crate::state::{DecoderSession, ModelInputs, SessionOutputs};

/// Plays back a per-step script of favored tokens and checks the feed
/// shapes the adapter is contractually required to produce.
pub struct ScriptedSession {
    config: DecoderConfig,
    /// One entry per step, one favored token per beam row. Steps beyond the
    /// script replay the last entry.
    script: Vec<Vec<u32>>,
    expected_positions: Vec<u32>,
    prompt_len: usize,
    step: usize,
}

impl ScriptedSession {
    pub fn new(config: DecoderConfig, script: Vec<Vec<u32>>) -> Self {
        assert!(!script.is_empty(), "script needs at least one step");
        Self {
            config,
            script,
            expected_positions: Vec::new(),
            prompt_len: 0,
            step: 0,
        }
    }
}

impl DecoderSession for ScriptedSession {
    fn config(&self) -> &DecoderConfig {
        &self.config
    }

    fn forward(&mut self, inputs: ModelInputs<'_>, past: &BeamKvState) -> Result<SessionOutputs> {
        let (rows, input_len) = inputs.input_ids.dim();
        let vocab = self.config.vocab_size;

        if self.step == 0 {
            assert_eq!(past.seq_length(), 0, "no past before the first step");
            self.prompt_len = input_len;
            self.expected_positions = inputs
                .attention_mask
                .outer_iter()
                .map(|row| row.sum())
                .collect();
        } else {
            assert_eq!(input_len, 1, "later steps carry one token per row");
            assert_eq!(past.seq_length(), self.prompt_len + self.step - 1);
            for (row, expected) in self.expected_positions.iter_mut().enumerate() {
                assert_eq!(
                    inputs.position_ids[[row, 0]],
                    *expected,
                    "position id must continue the non-pad count of row {}",
                    row
                );
                *expected += 1;
            }
        }
        assert_eq!(
            inputs.attention_mask.ncols(),
            self.prompt_len + self.step,
            "attention mask grows by one column per step"
        );

        let favored = &self.script[self.step.min(self.script.len() - 1)];
        assert_eq!(favored.len(), rows, "script rows must match batch beam size");

        let mut logits = Array3::zeros((rows, input_len, vocab));
        for (row, &token) in favored.iter().enumerate() {
            logits[[row, input_len - 1, token as usize]] = 10.0;
        }

        let presents = (0..self.config.n_layer)
            .map(|_| LayerKv {
                k: Array3::from_elem((rows, input_len, self.config.n_embd), (self.step + 1) as f32),
                v: Array3::from_elem((rows, input_len, self.config.n_embd), (self.step + 1) as f32),
            })
            .collect();

        self.step += 1;
        Ok(SessionOutputs { logits, presents })
    }
}

pub fn tiny_config(vocab_size: usize) -> DecoderConfig {
    DecoderConfig::from_json(&format!(
        r#"{{
            "vocab_size": {},
            "n_ctx": 64,
            "n_embd": 8,
            "n_layer": 2,
            "n_head": 2,
            "model_type": "gpt2"
        }}"#,
        vocab_size
    ))
    .expect("tiny config parses")
}
