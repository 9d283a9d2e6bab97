use crate::error::AppError;
use crate::openai::RealtimeSessionManager;
use crate::telephony::CallSessionManager;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

/// `GET /api/v1/calls` — snapshots of every live AI session and its
/// telephony channel record.
pub async fn list_calls(
    manager: web::Data<Arc<RealtimeSessionManager>>,
    telephony: web::Data<Arc<CallSessionManager>>,
) -> Result<HttpResponse, AppError> {
    let sessions = manager.snapshots().await;
    let channels = telephony.active_channels().await;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": sessions.len(),
        "calls": sessions,
        "channels": channels
    })))
}

#[derive(Debug, Deserialize)]
pub struct TextMessageRequest {
    pub text: String,
}

/// `POST /api/v1/calls/{call_id}/message` — inject a text message into a
/// live conversation (operator whisper).
pub async fn send_text(
    manager: web::Data<Arc<RealtimeSessionManager>>,
    path: web::Path<String>,
    body: web::Json<TextMessageRequest>,
) -> Result<HttpResponse, AppError> {
    let call_id = path.into_inner();
    let request = body.into_inner();
    if request.text.trim().is_empty() {
        return Err(AppError::BadRequest("text must not be empty".to_string()));
    }

    manager.send_text_message(&call_id, request.text).await?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "sent",
        "call_id": call_id,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

/// `DELETE /api/v1/calls/{call_id}` — end a call's AI session.
pub async fn end_call(
    manager: web::Data<Arc<RealtimeSessionManager>>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let call_id = path.into_inner();
    manager.disconnect(&call_id).await;

    Ok(HttpResponse::Ok().json(json!({
        "status": "disconnected",
        "call_id": call_id,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}
