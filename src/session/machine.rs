//! # Session
//!
//! One [`Session`] per connected client. It owns the client's decoder
//! bridge and recognition adapter, and a driver task that runs the state
//! machine:
//!
//! - recognition events move the session from idle to listening to thinking
//! - a finished dispatch moves it to speaking (or back to idle on failure)
//! - the client's `playback_finished`, or a deadline, returns it to idle
//!
//! Every transition produces exactly one [`SessionEvent::StateChanged`].
//! Events are pushed into an unbounded channel and never awaited, so a slow
//! client can't stall the pipeline.
//!
//! A decoder that exits on its own is reaped right away and reported to the
//! client as a `pipe_closed` error, so it can send `restart_audio`.
//!
//! ## Teardown:
//! [`Session::close`] cancels the session scope (driver, capture loop,
//! decoder tasks), reaps the decoder process and waits for the tasks. An
//! in-flight dispatch is left to finish; its result is dropped and its
//! artifact deleted.

use crate::audio::buffer::PcmFrameBuffer;
use crate::audio::{AudioChunk, DecoderBridge, InputMode, PcmSink};
use crate::config::{AppConfig, DecoderConfig};
use crate::dispatch::{DispatchPipeline, Reply};
use crate::error::{PipelineError, PipelineResult};
use crate::recognition::{RecognitionAdapter, RecognitionEvent, SpeechRecognizer};
use crate::session::state::{transition, Effect, SessionState, Trigger};
use crate::state::PipelineMetrics;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outbound notifications for the client of one session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    WakeWordDetected,
    Transcription(String),
    ReplyReady { text_answer: String, audio_url: String },
    Error { code: String, message: String },
}

impl SessionEvent {
    pub fn error(err: &PipelineError) -> Self {
        SessionEvent::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Process-wide services every session is built from.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<AppConfig>,
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub dispatch: Arc<DispatchPipeline>,
    pub metrics: Arc<PipelineMetrics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub input_mode: InputMode,
    pub decoder_alive: bool,
}

enum Control {
    DispatchFinished(PipelineResult<Reply>),
    PlaybackFinished,
}

pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    decoder_config: DecoderConfig,
    input_mode: Mutex<InputMode>,
    decoder: Arc<Mutex<Option<Arc<DecoderBridge>>>>,
    pcm_carry: Mutex<PcmFrameBuffer>,
    recognition: Arc<RecognitionAdapter>,
    state: watch::Receiver<SessionState>,
    control: mpsc::UnboundedSender<Control>,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    metrics: Arc<PipelineMetrics>,
}

impl Session {
    /// Build the session, start its driver and recognition, and try to
    /// launch its decoder.
    ///
    /// A decoder that fails to spawn is reported to the client as an `error`
    /// event; the session stays usable (PCM input, `restart_audio`).
    pub fn open(
        id: String,
        context: &SessionContext,
        events: mpsc::UnboundedSender<SessionEvent>,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let config = &context.config;

        let (recognition_tx, recognition_rx) = mpsc::unbounded_channel();
        let recognition = Arc::new(RecognitionAdapter::new(
            &id,
            context.recognizer.clone(),
            &config.recognition,
            recognition_tx,
            &cancel,
            context.metrics.clone(),
        ));

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);

        let driver = SessionDriver {
            session_id: id.clone(),
            state: SessionState::Idle,
            state_tx,
            events: events.clone(),
            control: control_tx.clone(),
            recognition: recognition.clone(),
            dispatch: context.dispatch.clone(),
            min_transcript_chars: config.dispatch.min_transcript_chars,
            listen_timeout: config.recognition.listen_timeout(),
            playback_grace: config.dispatch.playback_grace(),
            deadline: None,
            cancel: cancel.clone(),
            metrics: context.metrics.clone(),
        };
        let _ = events.send(SessionEvent::StateChanged(SessionState::Idle));
        let handle = tokio::spawn(driver.run(recognition_rx, control_rx));
        recognition.start();

        let session = Self {
            id,
            created_at: Utc::now(),
            decoder_config: config.decoder.clone(),
            input_mode: Mutex::new(InputMode::default()),
            decoder: Arc::new(Mutex::new(None)),
            pcm_carry: Mutex::new(PcmFrameBuffer::new()),
            recognition,
            state: state_rx,
            control: control_tx,
            events,
            cancel,
            driver: Mutex::new(Some(handle)),
            closed: AtomicBool::new(false),
            metrics: context.metrics.clone(),
        };

        if let Err(e) = session.spawn_decoder() {
            session.report_spawn_failure(&e);
        }
        session
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn input_mode(&self) -> InputMode {
        *lock(&self.input_mode)
    }

    pub fn set_input_mode(&self, mode: InputMode) {
        let previous = std::mem::replace(&mut *lock(&self.input_mode), mode);
        if previous != mode {
            info!(session_id = %self.id, %mode, "Input mode changed");
        }
    }

    pub fn is_decoder_alive(&self) -> bool {
        lock(&self.decoder).as_ref().is_some_and(|d| d.is_alive())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Route one inbound chunk: encoded audio to the decoder, PCM straight to
    /// recognition.
    pub fn push_audio(&self, chunk: AudioChunk) -> PipelineResult<()> {
        if self.is_closed() {
            return Err(PipelineError::PipeClosed(self.id.clone()));
        }
        self.metrics.record_audio_bytes(chunk.len());

        let result = match chunk.mode {
            InputMode::Encoded => {
                let decoder = lock(&self.decoder).clone();
                match decoder {
                    Some(decoder) => decoder.write(chunk.bytes),
                    None => Err(PipelineError::PipeClosed(self.id.clone())),
                }
            }
            InputMode::Pcm => {
                let samples = lock(&self.pcm_carry).push(&chunk.bytes);
                self.recognition.feed_pcm(samples)
            }
        };

        if let Err(PipelineError::QueueFull(_)) = &result {
            self.metrics.record_dropped_chunk();
        }
        result
    }

    /// Replace the decoder with a fresh process.
    pub async fn restart_decoder(&self) -> PipelineResult<()> {
        if self.is_closed() {
            return Err(PipelineError::PipeClosed(self.id.clone()));
        }
        let previous = lock(&self.decoder).take();
        if let Some(previous) = previous {
            previous.stop().await;
        }
        self.spawn_decoder().inspect_err(|e| self.report_spawn_failure(e))?;

        // close() may have run while the old decoder was being stopped
        if self.is_closed() {
            let decoder = lock(&self.decoder).take();
            if let Some(decoder) = decoder {
                decoder.stop().await;
            }
            return Err(PipelineError::PipeClosed(self.id.clone()));
        }
        Ok(())
    }

    pub fn playback_finished(&self) {
        let _ = self.control.send(Control::PlaybackFinished);
    }

    /// Tear everything down. Only the first call does any work.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        let decoder = lock(&self.decoder).take();
        if let Some(decoder) = decoder {
            decoder.stop().await;
        }
        self.recognition.shutdown().await;

        let driver = lock(&self.driver).take();
        if let Some(driver) = driver {
            let _ = driver.await;
        }
        info!(session_id = %self.id, "Session closed");
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            state: self.state(),
            created_at: self.created_at,
            input_mode: self.input_mode(),
            decoder_alive: self.is_decoder_alive(),
        }
    }

    fn spawn_decoder(&self) -> PipelineResult<()> {
        let sink: Arc<dyn PcmSink> = self.recognition.clone();
        let decoder = DecoderBridge::start(
            &self.id,
            &self.decoder_config,
            sink,
            &self.cancel,
            self.metrics.clone(),
        )?;
        let decoder = Arc::new(decoder);
        *lock(&self.decoder) = Some(decoder.clone());
        self.watch_decoder(decoder);
        Ok(())
    }

    /// Reap `decoder` and tell the client if it exits without being stopped.
    fn watch_decoder(&self, decoder: Arc<DecoderBridge>) {
        let current = self.decoder.clone();
        let events = self.events.clone();
        let session_id = self.id.clone();

        tokio::spawn(async move {
            if !decoder.exited().await {
                return;
            }
            {
                let mut current = lock(&current);
                if current.as_ref().is_some_and(|d| Arc::ptr_eq(d, &decoder)) {
                    current.take();
                }
            }
            decoder.stop().await;

            let err = PipelineError::PipeClosed(session_id.clone());
            warn!(session_id = %session_id, "Decoder exited unexpectedly; audio input disabled until restart_audio");
            let _ = events.send(SessionEvent::error(&err));
        });
    }

    fn report_spawn_failure(&self, err: &PipelineError) {
        self.metrics.record_spawn_failure();
        warn!(session_id = %self.id, "{}; audio input disabled until restart_audio", err);
        let _ = self.events.send(SessionEvent::error(err));
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct SessionDriver {
    session_id: String,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    events: mpsc::UnboundedSender<SessionEvent>,
    control: mpsc::UnboundedSender<Control>,
    recognition: Arc<RecognitionAdapter>,
    dispatch: Arc<DispatchPipeline>,
    min_transcript_chars: usize,
    listen_timeout: Duration,
    playback_grace: Duration,
    /// Listening: give up waiting for a transcript. Speaking: assume playback ended.
    deadline: Option<Instant>,
    cancel: CancellationToken,
    metrics: Arc<PipelineMetrics>,
}

impl SessionDriver {
    async fn run(
        mut self,
        mut recognition_rx: mpsc::UnboundedReceiver<RecognitionEvent>,
        mut control_rx: mpsc::UnboundedReceiver<Control>,
    ) {
        loop {
            let deadline = self.deadline;
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(event) = recognition_rx.recv() => self.on_recognition(event),
                Some(control) = control_rx.recv() => self.on_control(control),
                _ = sleep_until(deadline) => self.on_deadline(),
            }
        }
        debug!(session_id = %self.session_id, state = %self.state, "Session driver finished");
    }

    fn on_recognition(&mut self, event: RecognitionEvent) {
        match event {
            RecognitionEvent::WakeWord => {
                if matches!(self.state, SessionState::Idle | SessionState::Listening) {
                    self.emit(SessionEvent::WakeWordDetected);
                }
                self.apply(Trigger::WakeWord);
                self.refresh_listen_deadline();
            }
            RecognitionEvent::VoiceActivity => {
                self.apply(Trigger::VoiceActivity);
                self.refresh_listen_deadline();
            }
            RecognitionEvent::Transcript(text) => self.on_transcript(text),
        }
    }

    fn on_transcript(&mut self, text: String) {
        match self.state {
            SessionState::Thinking | SessionState::Speaking => {
                debug!(session_id = %self.session_id, state = %self.state, "Ignoring transcript while busy");
                return;
            }
            // The listen window may have closed just before the transcript landed
            SessionState::Idle => {
                self.apply(Trigger::VoiceActivity);
            }
            SessionState::Listening => {}
        }

        self.metrics.record_utterance();
        info!(session_id = %self.session_id, transcript = %text, "Utterance transcribed");
        self.emit(SessionEvent::Transcription(text.clone()));

        match self.apply(Trigger::Utterance(text)) {
            Some(Effect::Dispatch(question)) => self.spawn_dispatch(question),
            Some(Effect::Discarded) => {
                self.metrics.record_trivial_transcript();
                debug!(session_id = %self.session_id, "Transcript too short, discarded");
            }
            Some(Effect::None) | None => {}
        }
    }

    fn on_control(&mut self, control: Control) {
        match control {
            Control::DispatchFinished(Ok(reply)) => {
                self.metrics.record_dispatch(true);
                self.emit(SessionEvent::ReplyReady {
                    text_answer: reply.text_answer,
                    audio_url: reply.audio.url,
                });
                if self.apply(Trigger::ReplyReady).is_some() {
                    let playback = Duration::from_secs_f64(reply.audio.duration_secs.max(0.0));
                    self.deadline = Some(Instant::now() + playback + self.playback_grace);
                }
            }
            Control::DispatchFinished(Err(e)) => {
                self.metrics.record_dispatch(false);
                warn!(session_id = %self.session_id, "Dispatch failed: {}", e);
                self.emit(SessionEvent::error(&e));
                self.apply(Trigger::DispatchFailed);
            }
            Control::PlaybackFinished => {
                self.apply(Trigger::PlaybackFinished);
            }
        }
    }

    fn on_deadline(&mut self) {
        self.deadline = None;
        match self.state {
            SessionState::Listening => {
                debug!(session_id = %self.session_id, "No utterance before listen timeout");
                self.apply(Trigger::ListenTimeout);
            }
            SessionState::Speaking => {
                debug!(session_id = %self.session_id, "Playback not confirmed, assuming finished");
                self.apply(Trigger::PlaybackFinished);
            }
            _ => {}
        }
    }

    /// Run the transition table and, if it fires, enter the new state.
    fn apply(&mut self, trigger: Trigger) -> Option<Effect> {
        let step = transition(self.state, &trigger, self.min_transcript_chars)?;
        let from = self.state;
        self.state = step.to;
        self.state_tx.send_replace(step.to);
        info!(session_id = %self.session_id, from = %from, to = %step.to, "State changed");
        self.emit(SessionEvent::StateChanged(step.to));

        self.deadline = match step.to {
            SessionState::Listening => Some(Instant::now() + self.listen_timeout),
            _ => None,
        };
        // Don't transcribe the assistant's own reply
        match step.to {
            SessionState::Thinking => self.recognition.stop(),
            SessionState::Idle => self.recognition.start(),
            _ => {}
        }
        Some(step.effect)
    }

    fn refresh_listen_deadline(&mut self) {
        if self.state == SessionState::Listening {
            self.deadline = Some(Instant::now() + self.listen_timeout);
        }
    }

    fn spawn_dispatch(&self, question: String) {
        let pipeline = self.dispatch.clone();
        let control = self.control.clone();
        let cancel = self.cancel.clone();
        let slot = self.session_id.clone();

        tokio::spawn(async move {
            let result = pipeline.run(&slot, &question).await;
            if cancel.is_cancelled() || control.send(Control::DispatchFinished(result)).is_err() {
                debug!(session_id = %slot, "Session gone, discarding reply");
                pipeline.store().remove_slot(&slot);
            }
        });
    }

    fn emit(&self, event: SessionEvent) {
        // The transport may already be gone; that's not our problem.
        let _ = self.events.send(event);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
