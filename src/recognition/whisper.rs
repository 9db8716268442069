//! # Whisper Recognizer
//!
//! Speech-to-text with OpenAI Whisper running on Candle. The model is
//! downloaded from the HuggingFace Hub once at startup (cached locally after
//! the first run) and shared by every session.
//!
//! ## Loading Process:
//! 1. Resolve the repository for the configured size ("base" → `openai/whisper-base`)
//! 2. Download `config.json`, `tokenizer.json` and `model.safetensors`
//! 3. Build the Slaney mel filterbank for the model's mel bin count
//! 4. Memory-map the weights onto the selected device
//!
//! ## Inference:
//! Greedy decoding over one ≤30 s window with Whisper's suppress-token mask.
//! Calls are serialized behind a mutex; the adapter runs them on tokio's
//! blocking pool so they never stall the async runtime.

use crate::recognition::SpeechRecognizer;
use anyhow::{anyhow, Result};
use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, audio, Config};
use std::sync::Mutex;
use tokenizers::Tokenizer;

/// Available Whisper model sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl ModelSize {
    pub fn repo_name(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "openai/whisper-tiny",
            ModelSize::Base => "openai/whisper-base",
            ModelSize::Small => "openai/whisper-small",
            ModelSize::Medium => "openai/whisper-medium",
            ModelSize::Large => "openai/whisper-large-v2",
        }
    }
}

impl std::str::FromStr for ModelSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tiny" => Ok(ModelSize::Tiny),
            "base" => Ok(ModelSize::Base),
            "small" => Ok(ModelSize::Small),
            "medium" => Ok(ModelSize::Medium),
            "large" => Ok(ModelSize::Large),
            _ => Err(anyhow!("Unknown model size: {}", s)),
        }
    }
}

impl std::fmt::Display for ModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::Large => "large",
        };
        write!(f, "{}", name)
    }
}

pub struct WhisperRecognizer {
    size: ModelSize,
    inner: Mutex<WhisperModel>,
}

struct WhisperModel {
    model: m::model::Whisper,
    config: Config,
    device: Device,
    tokenizer: Tokenizer,
    mel_filters: Vec<f32>,
    suppress_mask: Tensor,
    prompt: Vec<u32>,
    eot_token: u32,
}

impl WhisperRecognizer {
    /// Download (or reuse the cached copy of) a Whisper model and load it.
    pub async fn load(size: ModelSize, language: Option<&str>) -> Result<Self> {
        tracing::info!("Loading Whisper {} model...", size);
        let start_time = std::time::Instant::now();

        let api = {
            use hf_hub::api::tokio::ApiBuilder;

            let mut builder = ApiBuilder::new()
                .with_progress(false)
                .with_token(std::env::var("HF_TOKEN").ok());
            if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
                tracing::debug!("Using custom cache dir: {}", cache_dir);
                builder = builder.with_cache_dir(cache_dir.into());
            }
            builder
                .build()
                .map_err(|e| anyhow!("Failed to create HuggingFace API client: {}", e))?
        };

        let repo = api.model(size.repo_name().to_string());
        let config_filename = repo
            .get("config.json")
            .await
            .map_err(|e| anyhow!("Failed to download config.json from {}: {}", size.repo_name(), e))?;
        let tokenizer_filename = repo
            .get("tokenizer.json")
            .await
            .map_err(|e| anyhow!("Failed to download tokenizer.json from {}: {}", size.repo_name(), e))?;
        let model_filename = repo
            .get("model.safetensors")
            .await
            .map_err(|e| anyhow!("Failed to download model weights from {}: {}", size.repo_name(), e))?;

        let config: Config = serde_json::from_reader(std::fs::File::open(config_filename)?)?;
        let tokenizer = Tokenizer::from_file(tokenizer_filename)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;

        let device = Device::cuda_if_available(0)?;
        tracing::debug!("Loading model weights on {:?}", device);
        // SAFETY: the safetensors file is owned by the hf-hub cache and not modified while mapped.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[model_filename], m::DTYPE, &device)? };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        let token = |name: &str| {
            tokenizer
                .token_to_id(name)
                .ok_or_else(|| anyhow!("Tokenizer has no {} token", name))
        };

        let mut prompt = vec![token(m::SOT_TOKEN)?];
        if let Some(lang) = language {
            match token(&format!("<|{}|>", lang)) {
                Ok(id) => prompt.push(id),
                Err(_) => tracing::warn!("Language '{}' not supported by tokenizer, auto-detecting", lang),
            }
        }
        prompt.push(token(m::TRANSCRIBE_TOKEN)?);
        prompt.push(token(m::NO_TIMESTAMPS_TOKEN)?);
        let eot_token = token(m::EOT_TOKEN)?;

        let suppress: Vec<f32> = (0..config.vocab_size as u32)
            .map(|id| {
                if config.suppress_tokens.contains(&id) {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
            .collect();
        let suppress_mask = Tensor::new(suppress.as_slice(), &device)?;

        let mel_filters = mel_filterbank(config.num_mel_bins, m::N_FFT, m::SAMPLE_RATE);

        tracing::info!(
            "Whisper {} model loaded in {:.2}s",
            size,
            start_time.elapsed().as_secs_f64()
        );

        Ok(Self {
            size,
            inner: Mutex::new(WhisperModel {
                model,
                config,
                device,
                tokenizer,
                mel_filters,
                suppress_mask,
                prompt,
                eot_token,
            }),
        })
    }
}

impl SpeechRecognizer for WhisperRecognizer {
    fn transcribe(&self, samples: &[f32]) -> Result<String> {
        let mut model = self
            .inner
            .lock()
            .map_err(|_| anyhow!("Whisper model lock poisoned"))?;
        model.transcribe(samples)
    }

    fn name(&self) -> String {
        format!("whisper-{}", self.size)
    }
}

impl WhisperModel {
    fn transcribe(&mut self, samples: &[f32]) -> Result<String> {
        if samples.is_empty() {
            return Ok(String::new());
        }
        let start_time = std::time::Instant::now();

        let mel = audio::pcm_to_mel(&self.config, samples, &self.mel_filters);
        let n_mels = self.config.num_mel_bins;
        let n_frames = mel.len() / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, n_frames), &self.device)?;
        let mel = mel.narrow(2, 0, n_frames.min(m::N_FRAMES))?;

        let audio_features = self.model.encoder.forward(&mel, true)?;

        let mut tokens = self.prompt.clone();
        let mut output = Vec::new();
        let sample_len = self.config.max_target_positions / 2;

        for i in 0..sample_len {
            let tokens_t = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = self.model.decoder.forward(&tokens_t, &audio_features, i == 0)?;
            let (_, seq_len, _) = ys.dims3()?;
            let logits = self
                .model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?
                .to_dtype(DType::F32)?;
            let logits = logits.broadcast_add(&self.suppress_mask)?;
            let next = logits.argmax(D::Minus1)?.to_scalar::<u32>()?;

            if next == self.eot_token || tokens.len() > self.config.max_target_positions {
                break;
            }
            if is_repetitive(&output, next) {
                tracing::debug!("Stopping decode on repeated tokens");
                break;
            }
            tokens.push(next);
            output.push(next);
        }

        let text = self
            .tokenizer
            .decode(&output, true)
            .map_err(|e| anyhow!("Tokenizer decode error: {}", e))?;
        let text = text.trim().to_string();

        tracing::debug!(
            "Transcribed {:.2}s of audio in {:.2}s: '{}'",
            samples.len() as f64 / m::SAMPLE_RATE as f64,
            start_time.elapsed().as_secs_f64(),
            text
        );

        Ok(text)
    }
}

/// Detect decoder loops ("the the the", "a b c a b c").
fn is_repetitive(tokens: &[u32], new_token: u32) -> bool {
    if tokens.len() < 6 {
        return false;
    }

    if tokens[tokens.len() - 3..] == [new_token, new_token, new_token] {
        return true;
    }

    let last_3 = &tokens[tokens.len() - 3..];
    let prev_3 = &tokens[tokens.len() - 6..tokens.len() - 3];
    last_3 == prev_3
}

/// Slaney-style mel filterbank (librosa's default, which Whisper was trained with).
///
/// Laid out as `[n_mels][n_fft / 2 + 1]`, the layout `audio::pcm_to_mel` indexes.
fn mel_filterbank(n_mels: usize, n_fft: usize, sample_rate: usize) -> Vec<f32> {
    let n_freqs = n_fft / 2 + 1;
    let fft_freqs: Vec<f64> = (0..n_freqs)
        .map(|k| k as f64 * sample_rate as f64 / n_fft as f64)
        .collect();

    let min_mel = hz_to_mel(0.0);
    let max_mel = hz_to_mel(sample_rate as f64 / 2.0);
    let mel_points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(min_mel + (max_mel - min_mel) * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0.0f32; n_mels * n_freqs];
    for mel in 0..n_mels {
        let (left, center, right) = (mel_points[mel], mel_points[mel + 1], mel_points[mel + 2]);
        let enorm = 2.0 / (right - left);
        for (k, &freq) in fft_freqs.iter().enumerate() {
            let lower = (freq - left) / (center - left);
            let upper = (right - freq) / (right - center);
            let weight = lower.min(upper).max(0.0);
            filters[mel * n_freqs + k] = (weight * enorm) as f32;
        }
    }

    filters
}

const F_SP: f64 = 200.0 / 3.0;
const MIN_LOG_HZ: f64 = 1000.0;
const MIN_LOG_MEL: f64 = MIN_LOG_HZ / F_SP;

fn log_step() -> f64 {
    6.4f64.ln() / 27.0
}

fn hz_to_mel(hz: f64) -> f64 {
    if hz >= MIN_LOG_HZ {
        MIN_LOG_MEL + (hz / MIN_LOG_HZ).ln() / log_step()
    } else {
        hz / F_SP
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    if mel >= MIN_LOG_MEL {
        MIN_LOG_HZ * (log_step() * (mel - MIN_LOG_MEL)).exp()
    } else {
        mel * F_SP
    }
}
