use std::fmt;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use super::wsfed::TokenValidationError;

#[derive(Debug)]
pub enum AuthError {
    /// Callback request was not a well-formed WS-Federation sign-in response
    InvalidMessage(String),

    /// `wctx` missing, tampered with, or protected under another purpose
    InvalidState,

    /// No validator accepted the security token, or validation failed
    InvalidToken,

    /// Security token has expired
    ExpiredToken,

    /// Internal error during authentication
    Internal(String),
}

impl From<TokenValidationError> for AuthError {
    fn from(error: TokenValidationError) -> Self {
        match error {
            TokenValidationError::Expired => AuthError::ExpiredToken,
            _ => AuthError::InvalidToken,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    #[serde(rename = "type")]
    error_type: &'a str,
    code: &'a str,
    message: &'a str,
}

#[derive(Debug, Serialize)]
struct ErrorResponse<'a> {
    error: ErrorBody<'a>,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AuthError::InvalidMessage(_) => (
                StatusCode::BAD_REQUEST,
                "invalid_message",
                "Invalid WS-Federation message",
            ),
            AuthError::InvalidState => (
                StatusCode::BAD_REQUEST,
                "invalid_state",
                "Invalid or expired sign-in state",
            ),
            AuthError::InvalidToken => (
                StatusCode::UNAUTHORIZED,
                "invalid_token",
                "Invalid security token",
            ),
            AuthError::ExpiredToken => (
                StatusCode::UNAUTHORIZED,
                "expired_token",
                "Security token has expired",
            ),
            // Backchannel and configuration details stay in the logs
            AuthError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Authentication is unavailable",
            ),
        };

        tracing::debug!(code, error = %self, "Authentication error response");

        let body = ErrorResponse {
            error: ErrorBody {
                error_type: "authentication_error",
                code,
                message,
            },
        };
        (status, Json(body)).into_response()
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::InvalidMessage(msg) => write!(f, "Invalid WS-Federation message: {}", msg),
            AuthError::InvalidState => write!(f, "Invalid or expired sign-in state"),
            AuthError::InvalidToken => write!(f, "Invalid security token"),
            AuthError::ExpiredToken => write!(f, "Security token has expired"),
            AuthError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AuthError {}
