//! Model-state adapter between the leita decoding core and an inference
//! session.
//!
//! The decoding core consumes per-step logits; this crate owns everything a
//! decoder-only session needs around that: prompt-derived position ids and
//! attention masks, beam expansion, the per-layer past-KV state with beam
//! reindexing, and the step loop that feeds a session and hands logits back
//! as roaming buffers.

pub mod config;
pub mod inputs;
pub mod kv;
pub mod state;

pub use config::DecoderConfig;
pub use inputs::{PromptInputs, build_prompt_inputs, expand_rows};
pub use kv::{BeamKvState, LayerKv};
pub use state::{DecoderSession, DecoderState, ModelInputs, SessionOutputs};

#[cfg(test)]
mod test_session;
