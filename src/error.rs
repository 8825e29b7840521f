//! # Error Handling
//!
//! Custom error types shared by the ops HTTP API and the streaming bridge.
//!
//! ## Error Categories:
//! - **Internal**: server-side problems (500 on the HTTP API)
//! - **NotFound**: unknown resource on the HTTP API
//! - **Engine**: the recognition engine failed to construct or to infer (session-scoped)
//! - **Transport**: the WebSocket failed (session-scoped, never fatal to the process)
//! - **SessionLimit**: a connection was refused because the relay is full
//!
//! Inside the bridge, only `Engine` failures are surfaced to the session's caller;
//! transport errors are recovered locally by running the normal teardown.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the application.
///
/// ## Usage Example:
/// ```rust
/// use speech_relay::error::AppError;
/// let err = AppError::SessionLimit(4);
/// assert_eq!(err.to_string(), "Session limit reached: 4 concurrent sessions");
/// ```
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Requested resource was not found
    NotFound(String),

    /// Recognition engine construction or inference failure
    Engine(String),

    /// WebSocket handshake, read or write failure
    Transport(String),

    /// Connection refused: the configured number of sessions is already active
    SessionLimit(usize),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Engine(msg) => write!(f, "Recognition engine error: {}", msg),
            AppError::Transport(msg) => write!(f, "Transport error: {}", msg),
            AppError::SessionLimit(max) => {
                write!(f, "Session limit reached: {} concurrent sessions", max)
            }
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// Machine-readable error type, used in both HTTP and WebSocket error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Internal(_) => "internal_error",
            AppError::NotFound(_) => "not_found",
            AppError::Engine(_) => "engine_error",
            AppError::Transport(_) => "transport_error",
            AppError::SessionLimit(_) => "session_limit",
        }
    }
}

/// Converts errors into JSON HTTP responses for the ops API.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "not_found",
///     "message": "Not found: No active session '10.0.0.7:41000'",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::SessionLimit(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Engine(_) | AppError::Transport(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::Transport(err.to_string())
    }
}

/// Type alias for Results that use our custom error type.
pub type AppResult<T> = Result<T, AppError>;
