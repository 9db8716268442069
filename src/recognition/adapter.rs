//! # Recognition Adapter
//!
//! One per session. Decoded PCM is queued through [`feed_audio`], and a
//! capture task segments it into utterances, transcribes each one with the
//! shared recognizer and applies the wake phrase gate.
//!
//! ## Events (in order, per session):
//! - `WakeWord`: an utterance contained a configured wake phrase
//! - `VoiceActivity`: speech started while the gate was open
//! - `Transcript(text)`: a complete utterance after the wake phrase
//!
//! Empty transcripts are never emitted. A recognizer failure (error or panic)
//! is logged and counted, and the loop carries on with the next utterance.
//!
//! [`feed_audio`]: RecognitionAdapter::feed_audio

use crate::audio::decoder::PcmSink;
use crate::config::RecognitionConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::recognition::vad::{SegmentEvent, SegmenterConfig, VoiceSegmenter};
use crate::recognition::wake::WakeMatcher;
use crate::recognition::SpeechRecognizer;
use crate::state::PipelineMetrics;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    WakeWord,
    VoiceActivity,
    Transcript(String),
}

pub struct RecognitionAdapter {
    session_id: String,
    recognizer: Arc<dyn SpeechRecognizer>,
    config: RecognitionConfig,
    pcm_tx: mpsc::Sender<Vec<f32>>,
    pcm_rx: Mutex<Option<mpsc::Receiver<Vec<f32>>>>,
    events: mpsc::UnboundedSender<RecognitionEvent>,
    enabled: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<PipelineMetrics>,
}

impl RecognitionAdapter {
    pub fn new(
        session_id: &str,
        recognizer: Arc<dyn SpeechRecognizer>,
        config: &RecognitionConfig,
        events: mpsc::UnboundedSender<RecognitionEvent>,
        parent: &CancellationToken,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let (pcm_tx, pcm_rx) = mpsc::channel(config.pcm_queue_chunks);
        Self {
            session_id: session_id.to_string(),
            recognizer,
            config: config.clone(),
            pcm_tx,
            pcm_rx: Mutex::new(Some(pcm_rx)),
            events,
            enabled: Arc::new(AtomicBool::new(false)),
            cancel: parent.child_token(),
            task: Mutex::new(None),
            metrics,
        }
    }

    /// Queue PCM for the capture loop without blocking.
    ///
    /// Audio arriving while the adapter is stopped is discarded.
    pub fn feed_audio(&self, samples: Vec<f32>) -> PipelineResult<()> {
        if !self.enabled.load(Ordering::Relaxed) || samples.is_empty() {
            return Ok(());
        }
        self.pcm_tx.try_send(samples).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => PipelineError::QueueFull("recognition"),
            mpsc::error::TrySendError::Closed(_) => PipelineError::PipeClosed(self.session_id.clone()),
        })
    }

    /// Enable capture, spawning the capture task on first use.
    pub fn start(&self) {
        if let Some(pcm_rx) = lock(&self.pcm_rx).take() {
            let capture = CaptureLoop {
                session_id: self.session_id.clone(),
                recognizer: self.recognizer.clone(),
                segmenter: VoiceSegmenter::new(SegmenterConfig::from(&self.config)),
                wake: WakeMatcher::new(&self.config.wake_words, self.config.wake_sensitivity),
                require_wake_word: self.config.require_wake_word,
                listen_timeout: self.config.listen_timeout(),
                armed_until: None,
                events: self.events.clone(),
                enabled: self.enabled.clone(),
                metrics: self.metrics.clone(),
            };
            let handle = tokio::spawn(capture.run(pcm_rx, self.cancel.clone()));
            *lock(&self.task) = Some(handle);
        }
        self.enabled.store(true, Ordering::Relaxed);
        debug!(session_id = %self.session_id, "Recognition started");
    }

    /// Disable capture. Queued and subsequent audio is ignored.
    pub fn stop(&self) {
        if self.enabled.swap(false, Ordering::Relaxed) {
            debug!(session_id = %self.session_id, "Recognition stopped");
        }
    }

    /// Stop and end the capture task. An in-flight transcription finishes on
    /// the blocking pool but its result is dropped.
    pub async fn shutdown(&self) {
        self.stop();
        self.cancel.cancel();
        let task = lock(&self.task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl PcmSink for RecognitionAdapter {
    fn feed_pcm(&self, samples: Vec<f32>) -> PipelineResult<()> {
        self.feed_audio(samples)
    }
}

struct CaptureLoop {
    session_id: String,
    recognizer: Arc<dyn SpeechRecognizer>,
    segmenter: VoiceSegmenter,
    wake: WakeMatcher,
    require_wake_word: bool,
    listen_timeout: Duration,
    /// Set after a bare wake phrase; the next utterance is the request
    armed_until: Option<Instant>,
    events: mpsc::UnboundedSender<RecognitionEvent>,
    enabled: Arc<AtomicBool>,
    metrics: Arc<PipelineMetrics>,
}

impl CaptureLoop {
    async fn run(mut self, mut pcm_rx: mpsc::Receiver<Vec<f32>>, cancel: CancellationToken) {
        loop {
            let samples = tokio::select! {
                _ = cancel.cancelled() => break,
                samples = pcm_rx.recv() => match samples {
                    Some(samples) => samples,
                    None => break,
                },
            };

            if !self.enabled.load(Ordering::Relaxed) {
                self.segmenter.reset();
                continue;
            }

            for event in self.segmenter.push(&samples) {
                let keep_going = match event {
                    SegmentEvent::SpeechStarted => self.on_speech_started(),
                    SegmentEvent::SpeechEnded(utterance) => {
                        let result = tokio::select! {
                            _ = cancel.cancelled() => return,
                            result = transcribe(self.recognizer.clone(), utterance) => result,
                        };
                        match result {
                            Ok(text) => self.on_text(text.trim()),
                            Err(e) => {
                                self.metrics.record_recognition_error();
                                warn!(session_id = %self.session_id, "{}; no event this cycle", e);
                                true
                            }
                        }
                    }
                };
                if !keep_going {
                    debug!(session_id = %self.session_id, "Recognition listener gone, ending capture");
                    return;
                }
            }
        }
        debug!(session_id = %self.session_id, "Capture loop finished");
    }

    fn gate_open(&mut self) -> bool {
        if !self.require_wake_word {
            return true;
        }
        match self.armed_until {
            Some(deadline) if Instant::now() < deadline => true,
            Some(_) => {
                self.armed_until = None;
                false
            }
            None => false,
        }
    }

    fn on_speech_started(&mut self) -> bool {
        if self.gate_open() {
            return self.emit(RecognitionEvent::VoiceActivity);
        }
        true
    }

    fn on_text(&mut self, text: &str) -> bool {
        if text.is_empty() {
            return true;
        }

        if self.require_wake_word {
            if let Some(found) = self.wake.detect(text) {
                self.metrics.record_wake_word();
                info!(
                    session_id = %self.session_id,
                    wake_word = %found.phrase,
                    confidence = found.confidence,
                    "Wake word detected"
                );
                if !self.emit(RecognitionEvent::WakeWord) {
                    return false;
                }
                if found.remainder.is_empty() {
                    self.armed_until = Some(Instant::now() + self.listen_timeout);
                    return true;
                }
                self.armed_until = None;
                return self.emit(RecognitionEvent::Transcript(found.remainder));
            }

            if !self.gate_open() {
                debug!(session_id = %self.session_id, transcript = text, "Ignoring speech without wake word");
                return true;
            }
            self.armed_until = None;
        }

        self.emit(RecognitionEvent::Transcript(text.to_string()))
    }

    fn emit(&self, event: RecognitionEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

async fn transcribe(recognizer: Arc<dyn SpeechRecognizer>, samples: Vec<f32>) -> PipelineResult<String> {
    tokio::task::spawn_blocking(move || recognizer.transcribe(&samples))
        .await
        .map_err(|e| PipelineError::RecognitionEngine(format!("recognizer task failed: {}", e)))?
        .map_err(|e| PipelineError::RecognitionEngine(e.to_string()))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
