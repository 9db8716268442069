//! Direct question path: text in, spoken reply out, no audio pipeline.
//!
//! ## Endpoints:
//! - `POST /ask`
//! - `POST /api/v1/ask`
//!
//! ## Request / Response:
//! ```json
//! { "question": "what is two plus two" }
//! { "text_answer": "Four.", "audio_url": "/static/audio/direct/<uuid>.wav" }
//! ```

use crate::dispatch::DIRECT_SLOT;
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    #[serde(default)]
    pub question: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AskResponse {
    pub text_answer: String,
    pub audio_url: String,
}

pub async fn ask(state: web::Data<AppState>, body: web::Json<AskRequest>) -> AppResult<HttpResponse> {
    let question = body
        .into_inner()
        .question
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .ok_or_else(|| AppError::BadRequest("No question provided".to_string()))?;

    state.metrics.record_direct_ask();
    info!(question = %question, "Direct question received");

    let reply = state.dispatch.run(DIRECT_SLOT, &question).await?;
    Ok(HttpResponse::Ok().json(AskResponse {
        text_answer: reply.text_answer,
        audio_url: reply.audio.url,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{app_state, FakeAnswerEngine, FakeSynthesisEngine};
    use actix_web::{test, App};
    use serde_json::{json, Value};
    use std::sync::Arc;

    #[actix_web::test]
    async fn test_ask_returns_answer_and_audio() {
        let tmp = tempfile::tempdir().unwrap();
        let state = app_state(
            tmp.path(),
            Arc::new(FakeAnswerEngine::ok("Four.")),
            Arc::new(FakeSynthesisEngine::ok()),
        );
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/ask", web::post().to(ask)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/ask")
            .set_json(json!({ "question": "what is two plus two" }))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["text_answer"], "Four.");
        assert!(body["audio_url"].as_str().unwrap().starts_with("/static/audio/direct/"));
        assert_eq!(state.metrics.snapshot().direct_asks, 1);
    }

    #[actix_web::test]
    async fn test_blank_question_is_bad_request() {
        let tmp = tempfile::tempdir().unwrap();
        let state = app_state(
            tmp.path(),
            Arc::new(FakeAnswerEngine::ok("Four.")),
            Arc::new(FakeSynthesisEngine::ok()),
        );
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/ask", web::post().to(ask)),
        )
        .await;

        for payload in [json!({}), json!({ "question": "   " })] {
            let req = test::TestRequest::post().uri("/ask").set_json(payload).to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), 400);
            let body: Value = test::read_body_json(resp).await;
            assert_eq!(body["error"]["message"], "No question provided");
        }
    }

    #[actix_web::test]
    async fn test_engine_failure_is_bad_gateway() {
        let tmp = tempfile::tempdir().unwrap();
        let state = app_state(
            tmp.path(),
            Arc::new(FakeAnswerEngine::ok("Four.")),
            Arc::new(FakeSynthesisEngine::failing()),
        );
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/ask", web::post().to(ask)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/ask")
            .set_json(json!({ "question": "hello there" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 502);
    }
}
