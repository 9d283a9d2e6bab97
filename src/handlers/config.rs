use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Serializable view of the configuration with the API key withheld.
fn config_view(config: &crate::config::AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "asterisk": {
            "base_url": config.asterisk.base_url,
            "app_name": config.asterisk.app_name,
            "sounds_dir": config.asterisk.sounds_dir
        },
        "openai": {
            "model": config.openai.model,
            "voice": config.openai.voice,
            "vad_threshold": config.openai.vad_threshold,
            "vad_prefix_padding_ms": config.openai.vad_prefix_padding_ms,
            "vad_silence_duration_ms": config.openai.vad_silence_duration_ms,
            "api_key_configured": !config.openai.api_key.is_empty()
        },
        "audio": {
            "max_pending_chunks": config.audio.max_pending_chunks,
            "commit_batch_size": config.audio.commit_batch_size,
            "commit_debounce_ms": config.audio.commit_debounce_ms,
            "commit_ack_timeout_ms": config.audio.commit_ack_timeout_ms
        },
        "session": {
            "session_ready_timeout_ms": config.session.session_ready_timeout_ms,
            "response_fallback_ms": config.session.response_fallback_ms,
            "idle_timeout_secs": config.session.idle_timeout_secs,
            "reconnect_base_delay_ms": config.session.reconnect_base_delay_ms,
            "reconnect_max_delay_ms": config.session.reconnect_max_delay_ms,
            "reconnect_max_attempts": config.session.reconnect_max_attempts,
            "recording_max_duration_secs": config.session.recording_max_duration_secs
        }
    })
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_view(&config)
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config.update_from_json(&json_str)?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::BadRequest)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_view(&current_config)
    })))
}
