// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bearer-token gate for the Admin Surface and stream transport, per §10.3.
//!
//! This is access control for an otherwise-open broker, not an authentication
//! system — `user_id` remains an opaque, unauthenticated field the caller
//! supplies. When `auth_token` is unset, every check here is a no-op.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::{ErrorCode, ErrorResponse};
use crate::state::AppState;

/// Constant-time comparison so a mismatched token doesn't leak its prefix
/// length through response timing.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Validate a bare token value (already extracted from wherever the caller
/// carries it — an `Authorization` header or a `?token=` query parameter)
/// against the configured expectation. `Ok(())` when `expected` is `None`.
pub fn validate_token(provided: Option<&str>, expected: Option<&str>) -> Result<(), ErrorCode> {
    let expected = match expected {
        Some(tok) => tok,
        None => return Ok(()),
    };
    match provided {
        Some(tok) if constant_time_eq(tok, expected) => Ok(()),
        _ => Err(ErrorCode::Unauthorized),
    }
}

/// Validate a Bearer token carried in an HTTP `Authorization` header.
pub fn validate_bearer(headers: &HeaderMap, expected: Option<&str>) -> Result<(), ErrorCode> {
    if expected.is_none() {
        return Ok(());
    }
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    validate_token(token, expected)
}

/// Axum middleware enforcing the bearer token on the Admin Surface, per
/// §10.3. `/health` stays open so orchestrators can probe liveness without a
/// credential; `/ws/*` and `/pty/*` carry their own `?token=` check in
/// [`crate::transport::handle_upgrade`] since a WebSocket upgrade request
/// can't always set a custom header from a browser client.
pub async fn auth_layer(
    State(state): State<Arc<AppState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let path = req.uri().path();
    if path == "/health" || path.starts_with("/ws/") || path.starts_with("/pty/") {
        return next.run(req).await;
    }

    if let Err(code) = validate_bearer(req.headers(), state.config.auth_token.as_deref()) {
        let body = ErrorResponse { error: code.to_error_body("unauthorized") };
        return (
            StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::UNAUTHORIZED),
            axum::Json(body),
        )
            .into_response();
    }

    next.run(req).await
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
