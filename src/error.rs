//! # Error Handling
//!
//! Application error taxonomy and its mapping onto HTTP responses for the
//! operational API.
//!
//! ## Propagation policy:
//! - **Audio**: a frame that fails to transcode is logged and dropped at the
//!   pipeline boundary; it never fails the call.
//! - **Transport / Protocol**: transient socket and remote-session failures
//!   are consumed by the reconnection controller, not surfaced to callers.
//! - **Setup**: failures answering, bridging or recording a channel propagate
//!   so the inbound-channel handler can hang up cleanly.
//! - **NotFound / BadRequest / ConfigError / Internal**: the operational API
//!   surface, mapped to status codes below.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    /// Failure while standing up a call (answer, bridge, record).
    Setup(String),

    /// Socket-level failure (connect, send, close) toward a remote service.
    Transport(String),

    /// The remote speech service rejected or invalidated the session.
    Protocol(String),

    /// A frame could not be transcoded or framed.
    Audio(String),

    /// Requested resource (call, conversation) does not exist.
    NotFound(String),

    /// Client sent invalid or malformed data.
    BadRequest(String),

    /// Configuration file or environment variable problems.
    ConfigError(String),

    /// Anything else server-side.
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Setup(msg) => write!(f, "Call setup error: {}", msg),
            AppError::Transport(msg) => write!(f, "Transport error: {}", msg),
            AppError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            AppError::Audio(msg) => write!(f, "Audio pipeline error: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            AppError::Setup(msg) => (
                actix_web::http::StatusCode::BAD_GATEWAY,
                "call_setup_error",
                msg.clone(),
            ),
            AppError::Transport(msg) => (
                actix_web::http::StatusCode::BAD_GATEWAY,
                "transport_error",
                msg.clone(),
            ),
            AppError::Protocol(msg) => (
                actix_web::http::StatusCode::BAD_GATEWAY,
                "protocol_error",
                msg.clone(),
            ),
            AppError::Audio(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "audio_error",
                msg.clone(),
            ),
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Transport(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::Transport(err.to_string())
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;
