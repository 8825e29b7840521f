use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn list_sessions(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let sessions = state.list_sessions();
    let max = state.get_config().performance.max_concurrent_sessions;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "active": sessions.len(),
        "max": max,
        "sessions": sessions
    })))
}

pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let id = path.into_inner();
    state
        .list_sessions()
        .into_iter()
        .find(|session| session.id == id)
        .map(|session| HttpResponse::Ok().json(session))
        .ok_or_else(|| AppError::NotFound(format!("No active session '{}'", id)))
}
