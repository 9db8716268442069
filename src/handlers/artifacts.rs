//! `GET /static/audio/{slot}/{file}`: serves synthesized replies.
//!
//! Every reply has a fresh name and the previous one is deleted, so
//! responses must never be cached.

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::http::header;
use actix_web::{web, HttpResponse};

pub async fn serve_audio(state: web::Data<AppState>, path: web::Path<(String, String)>) -> AppResult<HttpResponse> {
    let (slot, file_name) = path.into_inner();
    let file = state
        .dispatch
        .store()
        .resolve(&slot, &file_name)
        .ok_or_else(|| AppError::NotFound(format!("audio {}/{}", slot, file_name)))?;

    let bytes = tokio::fs::read(&file)
        .await
        .map_err(|_| AppError::NotFound(format!("audio {}/{}", slot, file_name)))?;

    Ok(HttpResponse::Ok()
        .content_type("audio/wav")
        .insert_header((header::CACHE_CONTROL, "no-store"))
        .body(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{app_state, FakeAnswerEngine, FakeSynthesisEngine};
    use actix_web::{test, App};
    use std::sync::Arc;

    #[actix_web::test]
    async fn test_serves_written_artifact_without_caching() {
        let tmp = tempfile::tempdir().unwrap();
        let state = app_state(
            tmp.path(),
            Arc::new(FakeAnswerEngine::ok("Four.")),
            Arc::new(FakeSynthesisEngine::ok()),
        );
        let audio = state.dispatch.store().write("direct", &[0.0; 240]).unwrap();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/static/audio/{slot}/{file}", web::get().to(serve_audio)),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri(&audio.url).to_request()).await;
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers().get(header::CACHE_CONTROL).unwrap(), "no-store");
        let body = test::read_body(resp).await;
        assert_eq!(&body[..4], b"RIFF");

        let missing = test::TestRequest::get().uri("/static/audio/direct/nope.wav").to_request();
        assert_eq!(test::call_service(&app, missing).await.status(), 404);
        let sneaky = test::TestRequest::get().uri("/static/audio/direct/..%2F..%2Fsecret.wav").to_request();
        assert_eq!(test::call_service(&app, sneaky).await.status(), 404);
    }
}
