//! # Decoder Bridge
//!
//! Wraps one external decode subprocess per session (ffmpeg by default).
//! Encoded chunks are written to its stdin; mono 16 kHz PCM is drained from
//! its stdout and forwarded to a [`PcmSink`].
//!
//! ## Tasks per bridge:
//! - **writer**: owns stdin, writes queued chunks in arrival order
//! - **reader**: owns stdout, reads fixed-size blocks and forwards whole samples
//!
//! Both tasks are bound to the bridge's cancellation token. `stop` cancels
//! them, closes stdin, kills the process and reaps it within a bounded wait.
//! If either task ends on its own (the process exited, a pipe broke), the
//! bridge is marked as exited; [`DecoderBridge::exited`] lets the owner notice
//! and stop it.
//!
//! ## Backpressure:
//! `write` never blocks the caller. Chunks go through a bounded queue; when the
//! decoder falls behind far enough to fill it, new chunks are dropped with
//! `QueueFull`. Writes after `stop` (or after the decoder died) fail with
//! `PipeClosed`.

use crate::audio::buffer::PcmFrameBuffer;
use crate::config::DecoderConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::state::PipelineMetrics;
use std::io::ErrorKind;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consumer of decoded PCM (the session's recognition adapter).
pub trait PcmSink: Send + Sync {
    fn feed_pcm(&self, samples: Vec<f32>) -> PipelineResult<()>;
}

pub struct DecoderBridge {
    session_id: String,
    input: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    child: tokio::sync::Mutex<Option<Child>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    /// Cancelled when a task ends without being asked to
    failed: CancellationToken,
    stopped: AtomicBool,
    stop_timeout: Duration,
    metrics: Arc<PipelineMetrics>,
}

impl DecoderBridge {
    /// Launch the decode subprocess and its reader/writer tasks.
    ///
    /// `parent` is the session's cancellation scope; cancelling it ends the
    /// tasks even if `stop` is never called.
    pub fn start(
        session_id: &str,
        config: &DecoderConfig,
        sink: Arc<dyn PcmSink>,
        parent: &CancellationToken,
        metrics: Arc<PipelineMetrics>,
    ) -> PipelineResult<Self> {
        let spawn_error = |source: std::io::Error| PipelineError::ProcessSpawn {
            command: config.command.clone(),
            source,
        };

        let mut child = Command::new(&config.command)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error(std::io::Error::other("decoder stdin was not captured")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error(std::io::Error::other("decoder stdout was not captured")))?;

        info!(
            session_id,
            command = %config.command,
            pid = ?child.id(),
            "Decoder started"
        );
        metrics.decoder_started();

        let cancel = parent.child_token();
        let failed = CancellationToken::new();
        let (tx, rx) = mpsc::channel(config.input_queue_chunks);

        let writer = tokio::spawn(write_loop(
            session_id.to_string(),
            stdin,
            rx,
            cancel.clone(),
            failed.clone(),
        ));
        let reader = tokio::spawn(read_loop(
            session_id.to_string(),
            stdout,
            sink,
            config.read_block_size,
            config.poll_interval(),
            cancel.clone(),
            failed.clone(),
            metrics.clone(),
        ));

        Ok(Self {
            session_id: session_id.to_string(),
            input: Mutex::new(Some(tx)),
            child: tokio::sync::Mutex::new(Some(child)),
            tasks: Mutex::new(vec![writer, reader]),
            cancel,
            failed,
            stopped: AtomicBool::new(false),
            stop_timeout: config.stop_timeout(),
            metrics,
        })
    }

    /// Queue encoded bytes for the decoder's stdin.
    pub fn write(&self, chunk: Vec<u8>) -> PipelineResult<()> {
        let input = lock(&self.input);
        let sender = input
            .as_ref()
            .ok_or_else(|| PipelineError::PipeClosed(self.session_id.clone()))?;

        sender.try_send(chunk).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => PipelineError::QueueFull("decoder input"),
            mpsc::error::TrySendError::Closed(_) => PipelineError::PipeClosed(self.session_id.clone()),
        })
    }

    /// True while the subprocess is accepting input.
    pub fn is_alive(&self) -> bool {
        lock(&self.input)
            .as_ref()
            .map(|sender| !sender.is_closed())
            .unwrap_or(false)
    }

    /// Resolves once the bridge is done: `true` if the decoder went away on
    /// its own, `false` if it was stopped or its session was cancelled.
    pub async fn exited(&self) -> bool {
        tokio::select! {
            biased;
            _ = self.failed.cancelled() => true,
            _ = self.cancel.cancelled() => false,
        }
    }

    /// Close stdin, terminate the subprocess and reap it.
    ///
    /// Safe to call more than once and from several places at the same time;
    /// only the first call does any work.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel.cancel();
        // Dropping the sender lets the writer drop stdin, closing the pipe.
        lock(&self.input).take();

        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.start_kill() {
                debug!(session_id = %self.session_id, "Decoder already exited: {}", e);
            }
            match tokio::time::timeout(self.stop_timeout, child.wait()).await {
                Ok(Ok(status)) => debug!(session_id = %self.session_id, %status, "Decoder exited"),
                Ok(Err(e)) => debug!(session_id = %self.session_id, "Error reaping decoder: {}", e),
                Err(_) => warn!(
                    session_id = %self.session_id,
                    "Decoder did not exit within {:?}, dropping handle",
                    self.stop_timeout
                ),
            }
        }

        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            let _ = tokio::time::timeout(self.stop_timeout, task).await;
        }

        self.metrics.decoder_stopped();
        info!(session_id = %self.session_id, "Decoder stopped");
    }
}

impl Drop for DecoderBridge {
    fn drop(&mut self) {
        // kill_on_drop reaps the process; this ends the tasks.
        self.cancel.cancel();
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.metrics.decoder_stopped();
        }
    }
}

async fn write_loop(
    session_id: String,
    mut stdin: ChildStdin,
    mut rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
    failed: CancellationToken,
) {
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            chunk = rx.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };

        if let Err(e) = stdin.write_all(&chunk).await {
            if !cancel.is_cancelled() {
                warn!(session_id = %session_id, "Decoder input closed: {}", e);
                failed.cancel();
            }
            break;
        }
    }
    // stdin and rx drop here; later writes observe a closed pipe.
}

async fn read_loop(
    session_id: String,
    mut stdout: ChildStdout,
    sink: Arc<dyn PcmSink>,
    block_size: usize,
    poll_interval: Duration,
    cancel: CancellationToken,
    failed: CancellationToken,
    metrics: Arc<PipelineMetrics>,
) {
    let mut block = vec![0u8; block_size];
    let mut frames = PcmFrameBuffer::new();

    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            read = stdout.read(&mut block) => read,
        };

        match read {
            Ok(0) => {
                debug!(session_id = %session_id, "Decoder output closed");
                break;
            }
            Ok(n) => {
                let samples = frames.push(&block[..n]);
                if samples.is_empty() {
                    continue;
                }
                if let Err(e) = sink.feed_pcm(samples) {
                    metrics.record_dropped_chunk();
                    debug!(session_id = %session_id, "Dropped decoded PCM: {}", e);
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {
                tokio::time::sleep(poll_interval).await;
            }
            Err(e) => {
                warn!(session_id = %session_id, "Decoder output read failed: {}", e);
                break;
            }
        }
    }

    if !cancel.is_cancelled() {
        failed.cancel();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
