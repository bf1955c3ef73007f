//! Decoder model metadata in the shape of a HuggingFace `config.json`.

use serde::Deserialize;

/// Hyperparameters the adapter needs from a decoder-only checkpoint.
///
/// Field names follow GPT-2 configs; LLaMA-style keys are accepted through
/// aliases. File I/O stays with the driver; this type only parses.
#[derive(Debug, Clone, Deserialize)]
pub struct DecoderConfig {
    pub vocab_size: usize,

    /// Maximum context length.
    #[serde(alias = "max_position_embeddings")]
    pub n_ctx: usize,

    /// Hidden size.
    #[serde(alias = "hidden_size")]
    pub n_embd: usize,

    /// Number of decoder layers.
    #[serde(alias = "num_hidden_layers")]
    pub n_layer: usize,

    /// Number of attention heads.
    #[serde(alias = "num_attention_heads")]
    pub n_head: usize,

    #[serde(default)]
    pub eos_token_id: Option<u32>,

    #[serde(default)]
    pub pad_token_id: Option<u32>,

    #[serde(default = "default_model_type")]
    pub model_type: String,
}

fn default_model_type() -> String {
    "gpt2".to_string()
}

impl DecoderConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }
}
