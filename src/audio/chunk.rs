//! # Audio Chunks
//!
//! A chunk is one inbound frame of client audio, tagged with the
//! representation it carries. Chunks are consumed exactly once: encoded
//! chunks go to the session's decoder, PCM chunks straight to recognition.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How a client's audio frames are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    /// Container/codec audio (webm, ogg, mp3, ...) that needs the decoder
    #[default]
    Encoded,
    /// Mono 16 kHz signed 16-bit little-endian PCM
    Pcm,
}

impl fmt::Display for InputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputMode::Encoded => write!(f, "encoded"),
            InputMode::Pcm => write!(f, "pcm"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub mode: InputMode,
    pub bytes: Vec<u8>,
}

impl AudioChunk {
    pub fn new(mode: InputMode, bytes: Vec<u8>) -> Self {
        Self { mode, bytes }
    }

    #[cfg(test)]
    pub fn encoded(bytes: Vec<u8>) -> Self {
        Self::new(InputMode::Encoded, bytes)
    }

    #[cfg(test)]
    pub fn pcm(bytes: Vec<u8>) -> Self {
        Self::new(InputMode::Pcm, bytes)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_mode_wire_names() {
        assert_eq!(serde_json::to_string(&InputMode::Pcm).unwrap(), "\"pcm\"");
        let mode: InputMode = serde_json::from_str("\"encoded\"").unwrap();
        assert_eq!(mode, InputMode::Encoded);
        assert_eq!(InputMode::default(), InputMode::Encoded);
    }

    #[test]
    fn test_chunk_constructors_tag_representation() {
        let chunk = AudioChunk::pcm(vec![0, 1]);
        assert_eq!(chunk.mode, InputMode::Pcm);
        assert_eq!(chunk.len(), 2);
        assert_eq!(AudioChunk::encoded(Vec::new()).mode, InputMode::Encoded);
    }
}
