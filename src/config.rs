//! # Configuration Management
//!
//! Loads the application configuration from several layered sources:
//! - Built-in defaults (the `Default` impl below)
//! - An optional `config.toml` next to the binary
//! - Environment variables with the `APP_` prefix
//! - The bare `HOST` / `PORT` variables set by most deployment platforms
//!
//! ## Environment Variable Layout:
//! Nested keys are separated by a double underscore so that field names
//! containing single underscores survive the mapping:
//! - `APP_SERVER__PORT=8080` → `server.port`
//! - `APP_DISPATCH__ANSWER_URL=http://rag:9000/query` → `dispatch.answer_url`
//! - `APP_RECOGNITION__WAKE_SENSITIVITY=0.5` → `recognition.wake_sensitivity`
//!
//! ## Sections:
//! - **server**: bind address
//! - **decoder**: external decode subprocess (one per session)
//! - **recognition**: Whisper model, wake phrase and voice segmentation tuning
//! - **dispatch**: answer/synthesis endpoints and the audio artifact store
//! - **voice**: fixed synthesis voice parameters
//! - **performance**: capacity limits

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Complete application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub decoder: DecoderConfig,
    pub recognition: RecognitionConfig,
    pub dispatch: DispatchConfig,
    pub voice: VoiceParams,
    pub performance: PerformanceConfig,
}

/// HTTP/WebSocket listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Settings for the per-session decode subprocess.
///
/// ## Contract:
/// The command must read an arbitrary encoded stream on stdin and write
/// mono, 16 kHz, signed 16-bit little-endian PCM on stdout. The default is
/// the ffmpeg invocation the recognition side expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Executable to launch (looked up on `PATH`)
    pub command: String,

    /// Arguments passed to the executable
    pub args: Vec<String>,

    /// Size of each read from the decoder's stdout, in bytes
    pub read_block_size: usize,

    /// Back-off between reads when the decoder has nothing to offer
    pub poll_interval_ms: u64,

    /// Upper bound on waiting for the subprocess to exit during stop
    pub stop_timeout_ms: u64,

    /// Encoded chunks that may wait for the decoder's stdin before new ones are dropped
    pub input_queue_chunks: usize,
}

/// Recognition engine and wake phrase tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionConfig {
    /// Whisper model size ("tiny", "base", "small", "medium", "large")
    pub whisper_model: String,

    /// Language hint passed to the recognizer
    pub language: Option<String>,

    /// Trigger phrases that arm the assistant
    pub wake_words: Vec<String>,

    /// Minimum match confidence (0.0 to 1.0) for a wake phrase
    pub wake_sensitivity: f32,

    /// When false every utterance is forwarded (open microphone mode)
    pub require_wake_word: bool,

    /// RMS level above which a frame counts as speech
    pub energy_threshold: f32,

    /// Shortest span of speech considered an utterance
    pub min_speech_ms: u64,

    /// Silence that terminates an utterance
    pub end_silence_ms: u64,

    /// Utterances are cut at this length (Whisper's window is 30 s)
    pub max_utterance_secs: f32,

    /// How long a wake phrase keeps the session listening without a transcript
    pub listen_timeout_secs: u64,

    /// Decoded PCM chunks that may wait for the capture loop before new ones are dropped
    pub pcm_queue_chunks: usize,
}

/// Answer/synthesis endpoints and the artifact store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub answer_url: String,
    pub answer_timeout_secs: u64,
    pub synthesis_url: String,
    pub synthesis_timeout_secs: u64,

    /// Directory where synthesized replies are written
    pub output_dir: PathBuf,

    /// URL prefix under which `output_dir` is served
    pub audio_url_prefix: String,

    /// Sample rate of the synthesis engine output (Hz)
    pub sample_rate: u32,

    /// Silence appended to every reply
    pub trailing_silence_ms: u64,

    /// Transcripts shorter than this (after trimming) are discarded
    pub min_transcript_chars: usize,

    /// Spoken instead of an answer that normalizes to nothing
    pub fallback_phrase: String,

    /// Extra time after a reply's duration before the session falls back to idle
    pub playback_grace_secs: u64,
}

/// Fixed synthesis voice. These are configuration, never negotiated per call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VoiceParams {
    pub seed: u64,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub refine_prompt: String,
}

/// Capacity limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 5000,
            },
            decoder: DecoderConfig {
                command: "ffmpeg".to_string(),
                args: [
                    "-loglevel", "quiet", "-i", "pipe:0", "-f", "s16le", "-ar", "16000", "-ac",
                    "1", "pipe:1",
                ]
                .iter()
                .map(|arg| arg.to_string())
                .collect(),
                read_block_size: 4096,
                poll_interval_ms: 10,
                stop_timeout_ms: 2000,
                input_queue_chunks: 256,
            },
            recognition: RecognitionConfig {
                whisper_model: "base".to_string(),
                language: Some("en".to_string()),
                wake_words: vec!["jarvis".to_string()],
                wake_sensitivity: 0.6,
                require_wake_word: true,
                energy_threshold: 0.015,
                min_speech_ms: 250,
                end_silence_ms: 700,
                max_utterance_secs: 28.0,
                listen_timeout_secs: 10,
                pcm_queue_chunks: 512,
            },
            dispatch: DispatchConfig {
                answer_url: "http://127.0.0.1:8000/query".to_string(),
                answer_timeout_secs: 60,
                synthesis_url: "http://127.0.0.1:8001/synthesize".to_string(),
                synthesis_timeout_secs: 120,
                output_dir: PathBuf::from("static/audio"),
                audio_url_prefix: "/static/audio".to_string(),
                sample_rate: 24_000,
                trailing_silence_ms: 500,
                min_transcript_chars: 3,
                fallback_phrase: "Let's try again.".to_string(),
                playback_grace_secs: 3,
            },
            voice: VoiceParams {
                seed: 1335,
                temperature: 0.7,
                top_p: 0.9,
                top_k: 30,
                refine_prompt: "[oral_2][laugh_0][break_6]".to_string(),
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Priority (highest wins):
    /// 1. `HOST` / `PORT`
    /// 2. `APP_*` environment variables
    /// 3. `config.toml`
    /// 4. Defaults
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.decoder.command.trim().is_empty() {
            return Err(anyhow::anyhow!("Decoder command cannot be empty"));
        }

        if self.decoder.read_block_size == 0 || self.decoder.input_queue_chunks == 0 {
            return Err(anyhow::anyhow!("Decoder block size and queue depth must be greater than 0"));
        }

        if self.recognition.require_wake_word
            && self.recognition.wake_words.iter().all(|w| w.trim().is_empty())
        {
            return Err(anyhow::anyhow!("At least one wake word is required when require_wake_word is set"));
        }

        if !(0.0..=1.0).contains(&self.recognition.wake_sensitivity) {
            return Err(anyhow::anyhow!("Wake sensitivity must be between 0.0 and 1.0"));
        }

        if self.recognition.pcm_queue_chunks == 0 {
            return Err(anyhow::anyhow!("PCM queue depth must be greater than 0"));
        }

        if self.recognition.max_utterance_secs <= 0.0 {
            return Err(anyhow::anyhow!("Maximum utterance length must be positive"));
        }

        if self.dispatch.sample_rate == 0 {
            return Err(anyhow::anyhow!("Synthesis sample rate cannot be 0"));
        }

        if self.dispatch.min_transcript_chars == 0 {
            return Err(anyhow::anyhow!("Minimum transcript length must be at least 1"));
        }

        Ok(())
    }
}

impl DecoderConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl RecognitionConfig {
    pub fn listen_timeout(&self) -> Duration {
        Duration::from_secs(self.listen_timeout_secs)
    }
}

impl DispatchConfig {
    pub fn playback_grace(&self) -> Duration {
        Duration::from_secs(self.playback_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.dispatch.sample_rate, 24_000);
        assert_eq!(config.recognition.wake_words, vec!["jarvis".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_decoder_emits_recognizer_format() {
        let config = AppConfig::default();
        let args = config.decoder.args.join(" ");
        assert!(args.contains("-f s16le"));
        assert!(args.contains("-ar 16000"));
        assert!(args.contains("-ac 1"));
        assert_eq!(config.decoder.read_block_size, 4096);
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.recognition.wake_sensitivity = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.recognition.wake_words = vec!["  ".to_string()];
        assert!(config.validate().is_err());

        // Open microphone mode doesn't need a wake word
        config.recognition.require_wake_word = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_round_trips_through_config_crate() {
        let built = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default()).unwrap())
            .set_override("dispatch.min_transcript_chars", 5)
            .unwrap()
            .build()
            .unwrap();
        let config: AppConfig = built.try_deserialize().unwrap();
        assert_eq!(config.dispatch.min_transcript_chars, 5);
        assert_eq!(config.voice.top_k, 30);
    }
}
