//! Fixtures shared by the unit tests: synthetic audio, a pass-through
//! decoder and scripted stand-ins for the three engines.

use crate::audio::PcmSink;
use crate::config::{AppConfig, DecoderConfig, VoiceParams};
use crate::dispatch::answer::AnswerEngine;
use crate::dispatch::synthesis::{SynthesisEngine, Waveform};
use crate::dispatch::DispatchPipeline;
use crate::error::{PipelineError, PipelineResult};
use crate::recognition::SpeechRecognizer;
use crate::session::{SessionContext, SessionRegistry, SessionState};
use crate::state::{AppState, PipelineMetrics};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// `cat` echoes stdin to stdout, so "encoded" input comes out unchanged as PCM.
pub fn cat_decoder() -> DecoderConfig {
    DecoderConfig {
        command: "cat".to_string(),
        args: Vec::new(),
        ..AppConfig::default().decoder
    }
}

pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Vec<f32>>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vec<f32>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PcmSink for ChannelSink {
    fn feed_pcm(&self, samples: Vec<f32>) -> PipelineResult<()> {
        self.tx
            .send(samples)
            .map_err(|_| PipelineError::PipeClosed("test sink".to_string()))
    }
}

pub fn silence(samples: usize) -> Vec<f32> {
    vec![0.0; samples]
}

/// 440 Hz sine at 16 kHz.
pub fn tone(samples: usize, amplitude: f32) -> Vec<f32> {
    (0..samples)
        .map(|i| amplitude * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 16_000.0).sin())
        .collect()
}

/// Half a second of "speech" framed by enough silence to end the utterance.
pub fn spoken_utterance() -> Vec<f32> {
    let mut samples = silence(4_000);
    samples.extend(tone(8_000, 0.3));
    samples.extend(silence(16_000));
    samples
}

/// Encode samples as 16-bit little-endian PCM.
pub fn pcm_bytes(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| ((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16).to_le_bytes())
        .collect()
}

pub fn wav_bytes(samples: &[i16], channels: u16, sample_rate: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
    for &sample in samples {
        writer.write_sample(sample).unwrap();
    }
    writer.finalize().unwrap();
    cursor.into_inner()
}

/// Wait until the watched state equals `target`.
pub async fn next_state(rx: &mut watch::Receiver<SessionState>, target: SessionState) -> SessionState {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let current = *rx.borrow_and_update();
            if current == target {
                return current;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for state {}", target))
}

/// Returns queued results in order, then empty transcripts.
pub struct ScriptedRecognizer {
    script: Mutex<VecDeque<Result<String, String>>>,
    calls: AtomicUsize,
}

impl ScriptedRecognizer {
    pub fn new(transcripts: &[&str]) -> Self {
        Self::with_results(transcripts.iter().map(|t| Ok(t.to_string())).collect())
    }

    pub fn with_results(results: Vec<Result<String, String>>) -> Self {
        Self {
            script: Mutex::new(results.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SpeechRecognizer for ScriptedRecognizer {
    fn transcribe(&self, _samples: &[f32]) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().unwrap().pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(anyhow::anyhow!(message)),
            None => Ok(String::new()),
        }
    }

    fn name(&self) -> String {
        "scripted".to_string()
    }
}

pub struct FakeAnswerEngine {
    answer: Option<String>,
    delay: Duration,
}

impl FakeAnswerEngine {
    pub fn ok(answer: &str) -> Self {
        Self::slow(answer, Duration::ZERO)
    }

    /// Answers only after `delay`.
    pub fn slow(answer: &str, delay: Duration) -> Self {
        Self {
            answer: Some(answer.to_string()),
            delay,
        }
    }

    pub fn failing() -> Self {
        Self {
            answer: None,
            delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl AnswerEngine for FakeAnswerEngine {
    async fn query(&self, _question: &str) -> PipelineResult<String> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.answer
            .clone()
            .ok_or_else(|| PipelineError::AnswerEngine("engine offline".to_string()))
    }
}

pub struct FakeSynthesisEngine {
    sample_rate: Option<u32>,
    calls: AtomicUsize,
    last_text: Mutex<Option<String>>,
}

impl FakeSynthesisEngine {
    pub fn ok() -> Self {
        Self::with_rate(24_000)
    }

    pub fn with_rate(sample_rate: u32) -> Self {
        Self {
            sample_rate: Some(sample_rate),
            calls: AtomicUsize::new(0),
            last_text: Mutex::new(None),
        }
    }

    pub fn failing() -> Self {
        Self {
            sample_rate: None,
            ..Self::ok()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_text(&self) -> Option<String> {
        self.last_text.lock().unwrap().clone()
    }
}

#[async_trait]
impl SynthesisEngine for FakeSynthesisEngine {
    async fn synthesize(&self, text: &str, _voice: &VoiceParams) -> PipelineResult<Waveform> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_text.lock().unwrap() = Some(text.to_string());
        let sample_rate = self
            .sample_rate
            .ok_or_else(|| PipelineError::Synthesis("voice model crashed".to_string()))?;
        Ok(Waveform {
            samples: tone(sample_rate as usize / 4, 0.2),
            sample_rate,
        })
    }
}

/// Default configuration with the artifact store in `dir` and `cat` as decoder.
pub fn test_config(dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.decoder = cat_decoder();
    config.dispatch.output_dir = dir.to_path_buf();
    config
}

pub fn pipeline_in(
    dir: &Path,
    answer: Arc<dyn AnswerEngine>,
    synthesis: Arc<dyn SynthesisEngine>,
) -> DispatchPipeline {
    DispatchPipeline::new(answer, synthesis, &test_config(dir))
}

pub fn session_context(
    dir: &Path,
    recognizer: Arc<dyn SpeechRecognizer>,
    answer: Arc<dyn AnswerEngine>,
    synthesis: Arc<dyn SynthesisEngine>,
) -> SessionContext {
    let config = test_config(dir);
    SessionContext {
        dispatch: Arc::new(DispatchPipeline::new(answer, synthesis, &config)),
        config: Arc::new(config),
        recognizer,
        metrics: Arc::new(PipelineMetrics::new()),
    }
}

/// Application state around scripted engines, for handler tests.
pub fn app_state(dir: &Path, answer: Arc<dyn AnswerEngine>, synthesis: Arc<dyn SynthesisEngine>) -> AppState {
    app_state_from(session_context(dir, Arc::new(ScriptedRecognizer::new(&[])), answer, synthesis))
}

pub fn app_state_from(context: SessionContext) -> AppState {
    AppState::new(
        context.config.clone(),
        context.metrics.clone(),
        Arc::new(SessionRegistry::new(context.clone())),
        context.dispatch.clone(),
        "scripted".to_string(),
    )
}
