//! Decoding core for autoregressive sequence generation.
//!
//! This crate turns a stream of per-step model logits into chosen tokens and
//! final sequences. It provides greedy/sampling search and beam search with
//! hypothesis pooling, logits processors (minimum length, repetition
//! penalty), double-buffered per-beam sequence histories, and roaming arrays
//! that move results between host and device memory.
//!
//! Model execution, tokenization and front-ends live elsewhere; the driver
//! loop is "run model, `set_logits`, select, repeat until `is_done`".

pub mod beams;
pub mod context;
pub mod error;
pub mod params;
pub mod processors;
pub mod roaming;
pub mod sampling;
pub mod search;
pub mod sequences;

pub use beams::{BeamHypothesis, BeamHypotheses, BeamScorer};
pub use context::{Device, WgpuContext};
pub use error::{LeitaError, LeitaResult};
pub use params::SearchParams;
pub use processors::{LogitsProcessor, LogitsProcessorList, MinLength, RepetitionPenalty};
pub use roaming::{DeviceElem, GpuArray, RoamingArray};
pub use search::{BeamSearch, GreedySearch};
pub use sequences::Sequences;

// Prelude for easy imports
pub mod prelude {
    pub use crate::context::{Device, WgpuContext};
    pub use crate::error::{LeitaError, LeitaResult};
    pub use crate::params::SearchParams;
    pub use crate::roaming::RoamingArray;
    pub use crate::search::{BeamSearch, GreedySearch};
}

#[cfg(test)]
pub mod tests;
