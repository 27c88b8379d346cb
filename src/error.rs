use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::protocol::close_code;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Upstream credential missing or configuration unusable. Terminal, no upstream attempt.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Malformed upgrade request, rejected before bridging
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Upstream transport failure. Terminal for the connection.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Malformed inbound audio payload. Only the offending frame is discarded.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Microphone or speaker acquisition failure
    #[error("Hardware error: {0}")]
    Hardware(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error response body (unified success format)
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Protocol(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidState(_) => StatusCode::CONFLICT,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// WebSocket close code used when this error terminates a bridged channel
    pub fn close_code(&self) -> u16 {
        match self {
            AppError::Configuration(_) => close_code::POLICY_VIOLATION,
            AppError::Protocol(_) => close_code::PROTOCOL_ERROR,
            _ => close_code::INTERNAL_ERROR,
        }
    }

    /// Whether the error ends the connection it occurred on
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AppError::Encoding(_))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            success: false,
            message: self.to_string(),
        };

        tracing::error!(
            error_type = std::any::type_name_of_val(&self),
            error_message = %body.message,
            status = status.as_u16(),
            "Request failed"
        );

        (status, Json(body)).into_response()
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;
