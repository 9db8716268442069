//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - **`PipelineError`**: failures at the component boundaries of the audio
//!   pipeline (decoder subprocess, recognition engine, answer and synthesis
//!   engines, artifact store, session registry). These are caught where they
//!   happen and turned into state transitions or logged no-ops; they never
//!   cross into the session state machine as panics.
//! - **`AppError`**: what HTTP handlers return. It implements actix's
//!   `ResponseError` so a handler can simply use `?`.
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "bad_request",
//!     "message": "No question provided",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Failures raised by the decoder, recognition, dispatch and registry components.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The external decoder could not be launched. The session stays
    /// registered but has no audio path until `restart_audio`.
    #[error("failed to start decoder `{command}`: {source}")]
    ProcessSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Write to a decoder whose input is gone (stopped, crashed or never started).
    #[error("decoder input for session {0} is closed")]
    PipeClosed(String),

    /// The bounded queue in front of a consumer is full; the chunk was dropped.
    #[error("{0} queue is full, chunk dropped")]
    QueueFull(&'static str),

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("maximum concurrent sessions ({0}) reached")]
    TooManySessions(usize),

    #[error("recognition engine error: {0}")]
    RecognitionEngine(String),

    #[error("answer engine error: {0}")]
    AnswerEngine(String),

    #[error("synthesis error: {0}")]
    Synthesis(String),

    #[error("audio artifact error: {0}")]
    Artifact(#[from] std::io::Error),

    #[error("invalid audio: {0}")]
    InvalidAudio(String),
}

impl PipelineError {
    /// Stable machine-readable code used in WebSocket `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::ProcessSpawn { .. } => "process_spawn",
            PipelineError::PipeClosed(_) => "pipe_closed",
            PipelineError::QueueFull(_) => "queue_full",
            PipelineError::SessionNotFound(_) => "session_not_found",
            PipelineError::TooManySessions(_) => "too_many_sessions",
            PipelineError::RecognitionEngine(_) => "recognition_engine",
            PipelineError::AnswerEngine(_) => "answer_engine",
            PipelineError::Synthesis(_) => "synthesis",
            PipelineError::Artifact(_) => "artifact",
            PipelineError::InvalidAudio(_) => "invalid_audio",
        }
    }
}

/// Errors returned from HTTP handlers.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// An external engine (answer or synthesis) failed
    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::Internal(msg) => ("internal_error", msg),
            AppError::BadRequest(msg) => ("bad_request", msg),
            AppError::NotFound(msg) => ("not_found", msg),
            AppError::Upstream(msg) => ("upstream_error", msg),
            AppError::Unavailable(msg) => ("service_unavailable", msg),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::AnswerEngine(_) | PipelineError::Synthesis(_) => {
                AppError::Upstream(err.to_string())
            }
            PipelineError::SessionNotFound(_) => AppError::NotFound(err.to_string()),
            PipelineError::TooManySessions(_) => AppError::Unavailable(err.to_string()),
            PipelineError::InvalidAudio(_) => AppError::BadRequest(err.to_string()),
            _ => AppError::Internal(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

pub type AppResult<T> = Result<T, AppError>;
pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[test]
    fn test_pipeline_error_status_mapping() {
        let cases = [
            (PipelineError::AnswerEngine("timeout".into()), StatusCode::BAD_GATEWAY),
            (PipelineError::Synthesis("500".into()), StatusCode::BAD_GATEWAY),
            (PipelineError::SessionNotFound("abc".into()), StatusCode::NOT_FOUND),
            (PipelineError::TooManySessions(10), StatusCode::SERVICE_UNAVAILABLE),
            (PipelineError::InvalidAudio("odd".into()), StatusCode::BAD_REQUEST),
            (PipelineError::PipeClosed("abc".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, status) in cases {
            assert_eq!(AppError::from(err).status_code(), status);
        }
    }

    #[test]
    fn test_error_codes_are_snake_case() {
        let err = PipelineError::ProcessSpawn {
            command: "missing-decoder".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        assert_eq!(err.code(), "process_spawn");
        assert!(err.to_string().contains("missing-decoder"));
    }

    #[actix_web::test]
    async fn test_error_response_body() {
        let response = AppError::BadRequest("No question provided".into()).error_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = to_bytes(response.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["type"], "bad_request");
        assert_eq!(value["error"]["message"], "No question provided");
        assert!(value["error"]["timestamp"].is_string());
    }
}
