//! # Session Registry
//!
//! The one table of live sessions, keyed by session id. Transport handlers
//! only ever talk to sessions through it: register on connect, route audio
//! and control messages by id, deregister on disconnect.
//!
//! Registration and removal happen under the map lock, so capacity checks
//! can't race. Everything slow (reaping a decoder, joining tasks) runs after
//! the entry has been removed and the lock released.

use crate::audio::{AudioChunk, InputMode};
use crate::error::{PipelineError, PipelineResult};
use crate::session::machine::{Session, SessionContext, SessionEvent, SessionInfo};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    context: SessionContext,
    max_sessions: usize,
    root: CancellationToken,
}

impl SessionRegistry {
    pub fn new(context: SessionContext) -> Self {
        let max_sessions = context.config.performance.max_concurrent_sessions;
        Self {
            sessions: Mutex::new(HashMap::new()),
            context,
            max_sessions,
            root: CancellationToken::new(),
        }
    }

    /// Register a new session whose events go to `events`.
    pub fn connect(&self, events: mpsc::UnboundedSender<SessionEvent>) -> PipelineResult<String> {
        let mut sessions = self.lock();
        if sessions.len() >= self.max_sessions {
            return Err(PipelineError::TooManySessions(self.max_sessions));
        }

        let session_id = Uuid::new_v4().to_string();
        let session = Session::open(session_id.clone(), &self.context, events, &self.root);
        sessions.insert(session_id.clone(), Arc::new(session));
        let active = sessions.len();
        drop(sessions);

        self.context.metrics.session_opened();
        info!(session_id = %session_id, active, "Session registered");
        Ok(session_id)
    }

    /// Remove and tear down a session. Returns false if it was already gone.
    pub async fn disconnect(&self, session_id: &str) -> bool {
        let removed = self.lock().remove(session_id);
        let Some(session) = removed else {
            return false;
        };

        session.close().await;
        self.context.dispatch.store().remove_slot(session_id);
        self.context.metrics.session_closed();
        info!(session_id, "Session deregistered");
        true
    }

    /// Tear down every session (server shutdown).
    pub async fn shutdown_all(&self) {
        let sessions: Vec<(String, Arc<Session>)> = self.lock().drain().collect();
        if !sessions.is_empty() {
            info!(count = sessions.len(), "Closing all sessions");
        }
        for (session_id, session) in sessions {
            session.close().await;
            self.context.dispatch.store().remove_slot(&session_id);
            self.context.metrics.session_closed();
        }
        self.root.cancel();
    }

    pub fn get(&self, session_id: &str) -> PipelineResult<Arc<Session>> {
        self.lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| PipelineError::SessionNotFound(session_id.to_string()))
    }

    pub fn push_audio(&self, session_id: &str, chunk: AudioChunk) -> PipelineResult<()> {
        self.get(session_id)?.push_audio(chunk)
    }

    pub fn set_input_mode(&self, session_id: &str, mode: InputMode) -> PipelineResult<()> {
        self.get(session_id)?.set_input_mode(mode);
        Ok(())
    }

    pub fn input_mode(&self, session_id: &str) -> PipelineResult<InputMode> {
        Ok(self.get(session_id)?.input_mode())
    }

    pub fn playback_finished(&self, session_id: &str) -> PipelineResult<()> {
        self.get(session_id)?.playback_finished();
        Ok(())
    }

    pub async fn restart_decoder(&self, session_id: &str) -> PipelineResult<()> {
        self.get(session_id)?.restart_decoder().await
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self.lock().values().map(|s| s.info()).collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
