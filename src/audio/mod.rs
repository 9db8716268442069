//! # Audio Ingestion
//!
//! Everything between a client's raw audio frames and the recognizer's PCM.
//!
//! ## Key Components:
//! - **chunk**: tagged inbound frames (encoded container audio or raw PCM)
//! - **buffer**: sample alignment and i16 → f32 conversion
//! - **decoder**: the per-session decode subprocess bridge
//!
//! ## PCM Format (decoder output / recognizer input):
//! - **Sample Rate**: 16 kHz
//! - **Bit Depth**: 16-bit signed, little-endian
//! - **Channels**: Mono

pub mod buffer;
pub mod chunk;
pub mod decoder;

pub use chunk::{AudioChunk, InputMode};
pub use decoder::{DecoderBridge, PcmSink};
