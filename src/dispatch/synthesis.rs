//! Speech synthesis engine client.
//!
//! The synthesis engine turns text into a waveform using a fixed voice. The
//! voice parameters come from configuration and are sent unchanged with every
//! request. Its output sample rate is a deployment constant; a response at
//! any other rate is rejected rather than resampled.

use crate::config::VoiceParams;
use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use serde::Serialize;
use std::io::Cursor;
use std::time::Duration;

/// Mono audio in [-1.0, 1.0].
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

#[async_trait]
pub trait SynthesisEngine: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &VoiceParams) -> PipelineResult<Waveform>;
}

/// `POST {url}` with the text and voice parameters, expecting a WAV body.
pub struct HttpSynthesisEngine {
    client: reqwest::Client,
    url: String,
}

#[derive(Serialize)]
struct SynthesisRequest<'a> {
    text: &'a str,
    #[serde(flatten)]
    voice: &'a VoiceParams,
}

impl HttpSynthesisEngine {
    pub fn new(url: String, timeout: Duration) -> PipelineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Synthesis(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl SynthesisEngine for HttpSynthesisEngine {
    async fn synthesize(&self, text: &str, voice: &VoiceParams) -> PipelineResult<Waveform> {
        let response = self
            .client
            .post(&self.url)
            .json(&SynthesisRequest { text, voice })
            .send()
            .await
            .map_err(|e| PipelineError::Synthesis(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Synthesis(format!("{status}: {body}")));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| PipelineError::Synthesis(e.to_string()))?;
        decode_wav(&bytes)
    }
}

/// Decode a WAV body into a mono waveform, averaging channels.
pub fn decode_wav(bytes: &[u8]) -> PipelineResult<Waveform> {
    let invalid = |e: hound::Error| PipelineError::Synthesis(format!("invalid WAV from synthesis engine: {}", e));
    let mut reader = hound::WavReader::new(Cursor::new(bytes)).map_err(invalid)?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let max = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max).map_err(invalid))
                .collect::<PipelineResult<_>>()?
        }
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map_err(invalid))
            .collect::<PipelineResult<_>>()?,
    };

    let channels = spec.channels.max(1) as usize;
    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };

    Ok(Waveform {
        samples,
        sample_rate: spec.sample_rate,
    })
}
