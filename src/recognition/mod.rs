//! # Speech Recognition
//!
//! Turns a session's decoded PCM into two kinds of events: "wake phrase
//! heard" and "utterance transcribed".
//!
//! ## Key Components:
//! - **vad**: energy-based segmentation of the PCM stream into utterances
//! - **wake**: fuzzy wake phrase matching on transcripts
//! - **adapter**: the per-session capture loop tying the two to the recognizer
//! - **whisper**: the production recognizer (Whisper on Candle)
//!
//! ## Tenancy:
//! The recognizer itself is one process-wide instance (loading Whisper per
//! connection would cost seconds and hundreds of MB each). Everything with
//! stream state (PCM queue, segmenter, wake gate) lives in a per-session
//! [`RecognitionAdapter`], so sessions never see each other's audio.

pub mod adapter;
pub mod vad;
pub mod wake;
pub mod whisper;

pub use adapter::{RecognitionAdapter, RecognitionEvent};
pub use whisper::{ModelSize, WhisperRecognizer};

/// A blocking speech-to-text engine over 16 kHz mono `f32` samples.
///
/// Implementations may take seconds per call; callers run them on the
/// blocking thread pool.
pub trait SpeechRecognizer: Send + Sync {
    fn transcribe(&self, samples: &[f32]) -> anyhow::Result<String>;

    /// Identity reported by the health endpoint
    fn name(&self) -> String;
}
