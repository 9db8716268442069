//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor through
//! `web::Data<AppState>`.
//!
//! ## Ownership:
//! - **config**: immutable after startup, so a plain `Arc<AppConfig>` is enough
//! - **metrics**: lock-free atomic counters updated from the hot audio path
//! - **sessions**: the single registry of live sessions (it does its own locking)
//! - **dispatch**: the process-wide answer/synthesis pipeline shared by all sessions
//!
//! `AppState` is `Clone`; every clone points at the same underlying data.

use crate::config::AppConfig;
use crate::dispatch::DispatchPipeline;
use crate::session::SessionRegistry;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub metrics: Arc<PipelineMetrics>,
    pub sessions: Arc<SessionRegistry>,
    pub dispatch: Arc<DispatchPipeline>,

    /// Identity of the loaded recognition model, reported by the health endpoint
    pub model_name: String,

    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        config: Arc<AppConfig>,
        metrics: Arc<PipelineMetrics>,
        sessions: Arc<SessionRegistry>,
        dispatch: Arc<DispatchPipeline>,
        model_name: String,
    ) -> Self {
        Self {
            config,
            metrics,
            sessions,
            dispatch,
            model_name,
            start_time: Instant::now(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Counters for the audio pipeline.
///
/// ## Gauges vs counters:
/// `active_sessions` and `live_decoders` go up and down; everything else only
/// grows. Gauges are decremented by exactly the code path that incremented
/// them, so they never underflow.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    active_sessions: AtomicU64,
    live_decoders: AtomicU64,
    decoder_spawn_failures: AtomicU64,
    audio_bytes_in: AtomicU64,
    chunks_dropped: AtomicU64,
    wake_words: AtomicU64,
    utterances: AtomicU64,
    trivial_transcripts: AtomicU64,
    recognition_errors: AtomicU64,
    dispatches_ok: AtomicU64,
    dispatches_failed: AtomicU64,
    direct_asks: AtomicU64,
}

/// Point-in-time copy of [`PipelineMetrics`] for JSON responses.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub active_sessions: u64,
    pub live_decoders: u64,
    pub decoder_spawn_failures: u64,
    pub audio_bytes_in: u64,
    pub chunks_dropped: u64,
    pub wake_words: u64,
    pub utterances: u64,
    pub trivial_transcripts: u64,
    pub recognition_errors: u64,
    pub dispatches_ok: u64,
    pub dispatches_failed: u64,
    pub direct_asks: u64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn decoder_started(&self) {
        self.live_decoders.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decoder_stopped(&self) {
        self.live_decoders.fetch_sub(1, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub fn live_decoders(&self) -> u64 {
        self.live_decoders.load(Ordering::Relaxed)
    }

    pub fn record_spawn_failure(&self) {
        self.decoder_spawn_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_audio_bytes(&self, bytes: usize) {
        self.audio_bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_dropped_chunk(&self) {
        self.chunks_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_wake_word(&self) {
        self.wake_words.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_utterance(&self) {
        self.utterances.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_trivial_transcript(&self) {
        self.trivial_transcripts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recognition_error(&self) {
        self.recognition_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch(&self, ok: bool) {
        if ok {
            self.dispatches_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dispatches_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_direct_ask(&self) {
        self.direct_asks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            sessions_opened: load(&self.sessions_opened),
            sessions_closed: load(&self.sessions_closed),
            active_sessions: load(&self.active_sessions),
            live_decoders: load(&self.live_decoders),
            decoder_spawn_failures: load(&self.decoder_spawn_failures),
            audio_bytes_in: load(&self.audio_bytes_in),
            chunks_dropped: load(&self.chunks_dropped),
            wake_words: load(&self.wake_words),
            utterances: load(&self.utterances),
            trivial_transcripts: load(&self.trivial_transcripts),
            recognition_errors: load(&self.recognition_errors),
            dispatches_ok: load(&self.dispatches_ok),
            dispatches_failed: load(&self.dispatches_failed),
            direct_asks: load(&self.direct_asks),
        }
    }
}

impl MetricsSnapshot {
    /// Fraction of dispatches that failed (0.0 when none have run).
    pub fn dispatch_failure_rate(&self) -> f64 {
        let total = self.dispatches_ok + self.dispatches_failed;
        if total > 0 {
            self.dispatches_failed as f64 / total as f64
        } else {
            0.0
        }
    }

    /// Fraction of transcribed utterances discarded as too short.
    pub fn trivial_transcript_rate(&self) -> f64 {
        if self.utterances > 0 {
            self.trivial_transcripts as f64 / self.utterances as f64
        } else {
            0.0
        }
    }
}
