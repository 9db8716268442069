//! # Dispatch
//!
//! Everything between a finished transcript and a playable reply: the answer
//! and synthesis engine clients, spoken-text normalization and the WAV
//! artifact store, tied together by [`DispatchPipeline`].

pub mod answer;
pub mod artifact;
pub mod normalize;
pub mod pipeline;
pub mod synthesis;

pub use answer::HttpAnswerEngine;
pub use pipeline::{DispatchPipeline, Reply, DIRECT_SLOT};
pub use synthesis::HttpSynthesisEngine;
