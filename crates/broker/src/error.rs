// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unified error codes shared across the Admin Surface (HTTP) and the
/// Transport Endpoint (WebSocket close codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    BadRequest,
    Unauthorized,
    Conflict,
    NotFound,
    RateLimited,
    RuntimeUnavailable,
    StalePrecondition,
    Internal,
}

impl ErrorCode {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::Conflict => 409,
            Self::NotFound => 404,
            Self::RateLimited => 429,
            Self::RuntimeUnavailable => 503,
            Self::StalePrecondition => 409,
            Self::Internal => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "BAD_REQUEST",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Conflict => "CONFLICT",
            Self::NotFound => "NOT_FOUND",
            Self::RateLimited => "RATE_LIMITED",
            Self::RuntimeUnavailable => "RUNTIME_UNAVAILABLE",
            Self::StalePrecondition => "STALE_PRECONDITION",
            Self::Internal => "INTERNAL",
        }
    }

    /// Close code to use on the stream transport for this error, per §6.
    pub fn ws_close_code(&self) -> u16 {
        match self {
            Self::BadRequest => 4001,
            Self::Unauthorized => 4001,
            Self::Conflict | Self::NotFound | Self::StalePrecondition => 4003,
            Self::RateLimited | Self::RuntimeUnavailable | Self::Internal => 1011,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error response envelope shared across all HTTP surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl ErrorCode {
    pub fn to_error_body(&self, message: impl Into<String>) -> ErrorBody {
        ErrorBody { code: self.as_str().to_owned(), message: message.into() }
    }

    pub fn to_http_response(
        &self,
        message: impl Into<String>,
    ) -> (axum::http::StatusCode, axum::Json<ErrorResponse>) {
        let status = axum::http::StatusCode::from_u16(self.http_status())
            .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        (status, axum::Json(ErrorResponse { error: self.to_error_body(message) }))
    }
}

impl axum::response::IntoResponse for ErrorCode {
    fn into_response(self) -> axum::response::Response {
        self.to_http_response(self.as_str()).into_response()
    }
}

/// A [`ErrorCode`] paired with a human-readable message, propagated with `?`
/// through the Session Manager and Admin Surface. This is the concrete
/// `std::error::Error` type the rest of the crate passes around; `ErrorCode`
/// alone is the wire-facing projection.
#[derive(Debug, Clone)]
pub struct BrokerError {
    pub code: ErrorCode,
    pub message: String,
}

impl BrokerError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Conflict, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn stale_precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::StalePrecondition, message)
    }

    pub fn runtime_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RuntimeUnavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for BrokerError {}

impl From<rusqlite::Error> for BrokerError {
    fn from(e: rusqlite::Error) -> Self {
        BrokerError::internal(e.to_string())
    }
}

impl axum::response::IntoResponse for BrokerError {
    fn into_response(self) -> axum::response::Response {
        self.code.to_http_response(self.message).into_response()
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
