//! # WebSocket Voice Session Handler
//!
//! Each connection to `/ws/audio` is one assistant session. The actor
//! registers the session on connect, routes inbound audio and control
//! messages to it through the registry, forwards the session's events to the
//! client, and deregisters it exactly once when the connection ends.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: server replies `connected` with the session id (or
//!    `error` + close when the server is full)
//! 2. **Audio Streaming**: binary frames, or `{"type":"audio","data":"<base64>"}`,
//!    in the session's input mode (encoded by default, see `configure`)
//! 3. **Events**: `state_changed`, `wake_word_detected`, `transcription`,
//!    `reply_ready`, `error`
//! 4. **Playback**: the client sends `playback_finished` once the reply audio
//!    has played
//!
//! ## Message Format:
//! - **Client → Server**: `configure`, `audio`, `playback_finished`,
//!   `restart_audio`, `ping` (JSON, `type`-tagged) and binary audio frames
//! - **Server → Client**: JSON messages, `type`-tagged, snake_case

use crate::audio::{AudioChunk, InputMode};
use crate::error::PipelineError;
use crate::session::{SessionEvent, SessionState};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_FRAME_SIZE: usize = 1 << 20;

/// Messages sent by the client.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Declare how subsequent audio frames are encoded
    Configure { input: InputMode },

    /// Base64-encoded audio chunk
    Audio { data: String },

    /// The reply audio finished playing
    PlaybackFinished,

    /// Retry launching the decoder after a spawn failure
    RestartAudio,

    Ping {
        #[serde(default)]
        timestamp: u64,
    },
}

/// Messages sent to the client.
#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        session_id: String,
    },
    StateChanged {
        session_id: String,
        state: SessionState,
    },
    WakeWordDetected {
        session_id: String,
    },
    Transcription {
        session_id: String,
        text: String,
    },
    ReplyReady {
        session_id: String,
        text_answer: String,
        audio_url: String,
    },
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Pong {
        timestamp: u64,
    },
}

impl ServerMessage {
    fn from_event(session_id: &str, event: SessionEvent) -> Self {
        let session_id = session_id.to_string();
        match event {
            SessionEvent::StateChanged(state) => ServerMessage::StateChanged { session_id, state },
            SessionEvent::WakeWordDetected => ServerMessage::WakeWordDetected { session_id },
            SessionEvent::Transcription(text) => ServerMessage::Transcription { session_id, text },
            SessionEvent::ReplyReady { text_answer, audio_url } => ServerMessage::ReplyReady {
                session_id,
                text_answer,
                audio_url,
            },
            SessionEvent::Error { code, message } => ServerMessage::Error {
                code,
                message,
                session_id: Some(session_id),
            },
        }
    }

    fn error(code: &str, message: impl Into<String>, session_id: Option<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
            session_id,
        }
    }
}

/// WebSocket actor for one voice session.
///
/// ## Actor Model:
/// The actor owns nothing but the session id; the session itself lives in
/// the registry. Session events arrive as a second stream on the actor's
/// context, so they're delivered in order on the connection's own task.
pub struct AudioWebSocket {
    state: AppState,
    session_id: Option<String>,
    last_heartbeat: Instant,
}

impl AudioWebSocket {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            session_id: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => error!("Failed to serialize server message: {}", e),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: impl Into<String>) {
        self.send(ctx, &ServerMessage::error(code, message, self.session_id.clone()));
    }

    fn handle_audio(&self, bytes: Vec<u8>) {
        let Some(session_id) = &self.session_id else {
            return;
        };
        let sessions = &self.state.sessions;
        let result = sessions
            .input_mode(session_id)
            .and_then(|mode| sessions.push_audio(session_id, AudioChunk::new(mode, bytes)));

        // Logged and dropped; the session keeps running.
        if let Err(e) = result {
            debug!(session_id = %session_id, "Audio chunk dropped: {}", e);
        }
    }

    fn handle_client_message(&mut self, message: ClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(session_id) = self.session_id.clone() else {
            return;
        };
        let sessions = self.state.sessions.clone();

        match message {
            ClientMessage::Configure { input } => {
                if let Err(e) = sessions.set_input_mode(&session_id, input) {
                    self.send_error(ctx, e.code(), e.to_string());
                }
            }
            ClientMessage::Audio { data } => match base64::engine::general_purpose::STANDARD.decode(data.trim()) {
                Ok(bytes) => self.handle_audio(bytes),
                Err(e) => {
                    let err = PipelineError::InvalidAudio(format!("audio data is not valid base64: {}", e));
                    self.send_error(ctx, err.code(), err.to_string());
                }
            },
            ClientMessage::PlaybackFinished => {
                if let Err(e) = sessions.playback_finished(&session_id) {
                    self.send_error(ctx, e.code(), e.to_string());
                }
            }
            ClientMessage::RestartAudio => {
                info!(session_id = %session_id, "Client requested decoder restart");
                // Spawn failures are reported through the session's own events.
                actix::spawn(async move {
                    if let Err(e) = sessions.restart_decoder(&session_id).await {
                        debug!(session_id = %session_id, "Decoder restart failed: {}", e);
                    }
                });
            }
            ClientMessage::Ping { timestamp } => {
                self.send(ctx, &ServerMessage::Pong { timestamp });
            }
        }
    }
}

impl Actor for AudioWebSocket {
    type Context = ws::WebsocketContext<Self>;

    /// Register the session and start the heartbeat.
    fn started(&mut self, ctx: &mut Self::Context) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        match self.state.sessions.connect(events_tx) {
            Ok(session_id) => {
                info!(session_id = %session_id, "WebSocket session started");
                self.send(ctx, &ServerMessage::Connected {
                    session_id: session_id.clone(),
                });
                self.session_id = Some(session_id);
                ctx.add_stream(UnboundedReceiverStream::new(events_rx));
            }
            Err(e) => {
                warn!("Rejecting WebSocket connection: {}", e);
                self.send_error(ctx, e.code(), e.to_string());
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Again,
                    description: Some(e.to_string()),
                }));
                ctx.stop();
                return;
            }
        }

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(session_id = ?act.session_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    /// Deregister the session. `session_id` is taken, so this runs once.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(session_id) = self.session_id.take() {
            info!(session_id = %session_id, "WebSocket connection stopped");
            let sessions = self.state.sessions.clone();
            actix::spawn(async move {
                sessions.disconnect(&session_id).await;
            });
        }
    }
}

/// Inbound WebSocket frames.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for AudioWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();

        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => self.handle_client_message(message, ctx),
                Err(e) => self.send_error(ctx, "invalid_message", format!("Unrecognized message: {}", e)),
            },
            Ok(ws::Message::Binary(data)) => self.handle_audio(data.to_vec()),
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = ?self.session_id, "WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = ?self.session_id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Outbound session events.
impl StreamHandler<SessionEvent> for AudioWebSocket {
    fn handle(&mut self, event: SessionEvent, ctx: &mut Self::Context) {
        if let Some(session_id) = &self.session_id {
            let message = ServerMessage::from_event(session_id, event);
            self.send(ctx, &message);
        }
    }

    /// The session closing its event channel doesn't end the connection.
    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Upgrades the request and hands the connection to an [`AudioWebSocket`]
/// actor; everything after that happens in the actor.
pub async fn audio_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("New WebSocket connection request from: {:?}", req.connection_info().peer_addr());

    ws::WsResponseBuilder::new(AudioWebSocket::new(app_state.get_ref().clone()), &req, stream)
        .frame_size(MAX_FRAME_SIZE)
        .start()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_client_message_parsing() {
        let configure: ClientMessage = serde_json::from_str(r#"{"type":"configure","input":"pcm"}"#).unwrap();
        assert!(matches!(configure, ClientMessage::Configure { input: InputMode::Pcm }));

        let audio: ClientMessage = serde_json::from_str(r#"{"type":"audio","data":"AAEC"}"#).unwrap();
        assert!(matches!(audio, ClientMessage::Audio { ref data } if data == "AAEC"));

        let ping: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(ping, ClientMessage::Ping { timestamp: 0 }));

        assert!(matches!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"playback_finished"}"#).unwrap(),
            ClientMessage::PlaybackFinished
        ));
        assert!(matches!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"restart_audio"}"#).unwrap(),
            ClientMessage::RestartAudio
        ));
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"dance"}"#).is_err());
    }

    #[test]
    fn test_session_events_map_to_wire_format() {
        let state = ServerMessage::from_event("s1", SessionEvent::StateChanged(SessionState::Listening));
        assert_eq!(
            serde_json::to_value(&state).unwrap(),
            json!({"type": "state_changed", "session_id": "s1", "state": "listening"})
        );

        let reply = ServerMessage::from_event(
            "s1",
            SessionEvent::ReplyReady {
                text_answer: "Four.".to_string(),
                audio_url: "/static/audio/s1/a.wav".to_string(),
            },
        );
        let value: Value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["type"], "reply_ready");
        assert_eq!(value["text_answer"], "Four.");
        assert_eq!(value["audio_url"], "/static/audio/s1/a.wav");

        let wake = serde_json::to_value(ServerMessage::from_event("s1", SessionEvent::WakeWordDetected)).unwrap();
        assert_eq!(wake, json!({"type": "wake_word_detected", "session_id": "s1"}));
    }

    #[test]
    fn test_error_message_omits_missing_session() {
        let json = serde_json::to_string(&ServerMessage::error("too_many_sessions", "full", None)).unwrap();
        assert!(json.contains("too_many_sessions"));
        assert!(!json.contains("session_id"));

        let event = SessionEvent::Error {
            code: "synthesis".to_string(),
            message: "voice model crashed".to_string(),
        };
        let value = serde_json::to_value(ServerMessage::from_event("s1", event)).unwrap();
        assert_eq!(value["session_id"], "s1");
        assert_eq!(value["code"], "synthesis");
    }

    use crate::test_support::{
        app_state_from, session_context, FakeAnswerEngine, FakeSynthesisEngine, ScriptedRecognizer,
    };
    use actix_web::App;
    use awc::ws::{CloseCode, Frame, Message};
    use futures_util::{SinkExt as _, Stream, StreamExt as _};
    use std::sync::Arc;

    fn state_with_capacity(dir: &std::path::Path, max_sessions: usize) -> AppState {
        let mut context = session_context(
            dir,
            Arc::new(ScriptedRecognizer::new(&[])),
            Arc::new(FakeAnswerEngine::ok("four")),
            Arc::new(FakeSynthesisEngine::ok()),
        );
        Arc::make_mut(&mut context.config).performance.max_concurrent_sessions = max_sessions;
        app_state_from(context)
    }

    fn server(state: AppState) -> actix_test::TestServer {
        actix_test::start(move || {
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/ws/audio", web::get().to(audio_websocket))
        })
    }

    async fn next_frame<S>(client: &mut S) -> Frame
    where
        S: Stream<Item = Result<Frame, awc::error::WsProtocolError>> + Unpin,
    {
        tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection ended")
            .unwrap()
    }

    async fn next_json<S>(client: &mut S) -> Value
    where
        S: Stream<Item = Result<Frame, awc::error::WsProtocolError>> + Unpin,
    {
        loop {
            match next_frame(client).await {
                Frame::Text(bytes) => return serde_json::from_slice(&bytes).unwrap(),
                Frame::Ping(_) | Frame::Pong(_) => continue,
                other => panic!("expected a text frame, got {:?}", other),
            }
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[actix_web::test]
    async fn test_connection_lifecycle_registers_and_deregisters_session() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state_with_capacity(tmp.path(), 4);
        let mut srv = server(state.clone());
        let mut client = srv.ws_at("/ws/audio").await.unwrap();

        let connected = next_json(&mut client).await;
        assert_eq!(connected["type"], "connected");
        let session_id = connected["session_id"].as_str().unwrap().to_string();
        assert_eq!(
            next_json(&mut client).await,
            json!({"type": "state_changed", "session_id": session_id, "state": "idle"})
        );
        assert_eq!(state.sessions.len(), 1);

        client
            .send(Message::Text(r#"{"type":"ping","timestamp":7}"#.into()))
            .await
            .unwrap();
        assert_eq!(next_json(&mut client).await, json!({"type": "pong", "timestamp": 7}));

        client.send(Message::Text(r#"{"type":"dance"}"#.into())).await.unwrap();
        assert_eq!(next_json(&mut client).await["code"], "invalid_message");

        client.send(Message::Close(Some(CloseCode::Normal.into()))).await.unwrap();
        let metrics = state.metrics.clone();
        wait_until(move || metrics.snapshot().sessions_closed == 1).await;
        assert_eq!(state.sessions.len(), 0);
        assert_eq!(state.metrics.live_decoders(), 0);
        assert!(!tmp.path().join(&session_id).exists());
    }

    #[actix_web::test]
    async fn test_connection_over_capacity_is_rejected_and_closed() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state_with_capacity(tmp.path(), 1);
        let mut srv = server(state.clone());

        let mut first = srv.ws_at("/ws/audio").await.unwrap();
        assert_eq!(next_json(&mut first).await["type"], "connected");

        let mut second = srv.ws_at("/ws/audio").await.unwrap();
        let rejected = next_json(&mut second).await;
        assert_eq!(rejected["type"], "error");
        assert_eq!(rejected["code"], "too_many_sessions");
        assert!(rejected.get("session_id").is_none());
        match next_frame(&mut second).await {
            Frame::Close(Some(reason)) => assert_eq!(reason.code, CloseCode::Again),
            other => panic!("expected a close frame, got {:?}", other),
        }

        // The rejected connection never owned a session
        assert_eq!(state.sessions.len(), 1);
        assert_eq!(state.metrics.snapshot().sessions_opened, 1);
        assert_eq!(state.metrics.snapshot().sessions_closed, 0);
    }
}
