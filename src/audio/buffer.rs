//! # PCM Framing
//!
//! The decoder writes a byte stream, and reads from its stdout land on
//! arbitrary boundaries: a 4096-byte read may end in the middle of a 16-bit
//! sample. `PcmFrameBuffer` carries the odd trailing byte over to the next
//! read so every forwarded chunk contains whole samples.
//!
//! ## Sample Format:
//! - **Input**: signed 16-bit little-endian, mono, 16 kHz
//! - **Output**: `f32` normalized to [-1.0, 1.0], the format Whisper expects

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

pub const PCM_SAMPLE_RATE: u32 = 16_000;
pub const BYTES_PER_SAMPLE: usize = 2;

/// Reassembles whole 16-bit samples from arbitrarily split byte reads.
#[derive(Debug, Default)]
pub struct PcmFrameBuffer {
    /// Leftover byte from the previous read (at most one)
    carry: Option<u8>,
}

impl PcmFrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes and return every complete sample.
    pub fn push(&mut self, data: &[u8]) -> Vec<f32> {
        let mut joined;
        let mut bytes = data;

        if let Some(low) = self.carry.take() {
            joined = Vec::with_capacity(data.len() + 1);
            joined.push(low);
            joined.extend_from_slice(data);
            bytes = &joined;
        }

        let whole = bytes.len() - bytes.len() % BYTES_PER_SAMPLE;
        if whole < bytes.len() {
            self.carry = Some(bytes[whole]);
        }

        decode_samples(&bytes[..whole])
    }
}

fn decode_samples(data: &[u8]) -> Vec<f32> {
    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / BYTES_PER_SAMPLE);

    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample as f32 / 32768.0);
    }

    samples
}
