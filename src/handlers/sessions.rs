use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /api/v1/sessions`: every registered session and where it is in its cycle.
pub async fn list_sessions(state: web::Data<AppState>) -> HttpResponse {
    let sessions = state.sessions.snapshot();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": sessions.len(),
        "max_sessions": state.sessions.max_sessions(),
        "sessions": sessions
    }))
}
