// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Admin Surface (AS) — §4.7.
//!
//! Plain JSON/HTTP control plane: session CRUD plus the anonymity toggle.
//! Every handler is a thin layer over [`crate::session::SessionManager`] and
//! [`crate::aes::AnonymitySupervisor`] — validation and rate-limiting happen
//! here, state transitions happen there.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BrokerError, ErrorCode};
use crate::model::{AnonymityState, SessionStatus, SessionSummary};
use crate::state::AppState;

const CREATE_SESSION_ENDPOINT: &str = "sessions.create";

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub user_id: String,
    pub container_image: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub websocket_url: String,
    pub created_at: i64,
}

impl SessionResponse {
    fn from_session(session: &crate::model::Session) -> Self {
        Self {
            session_id: session.id,
            status: session.status,
            websocket_url: format!("/pty/{}", session.id),
            created_at: session.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Deserialize)]
pub struct ListSessionsQuery {
    pub user_id: String,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct DeleteSessionResponse {
    pub session_id: Uuid,
    pub status: SessionStatus,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct PrivacyResponse {
    #[serde(flatten)]
    pub state: AnonymityState,
}

/// `POST /api/sessions`, per §4.7: validates the request, enforces the
/// per-`user_id` rate limit and concurrent-session quota, then hands off to
/// the Session Manager's `Creating -> Ready | Failed` transition.
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> impl IntoResponse {
    match create_session_inner(&state, req).await {
        Ok(session) => (axum::http::StatusCode::CREATED, Json(SessionResponse::from_session(&session)))
            .into_response(),
        Err(err) => err.into_response(),
    }
}

async fn create_session_inner(
    state: &Arc<AppState>,
    req: CreateSessionRequest,
) -> Result<crate::model::Session, BrokerError> {
    let user_id = req.user_id.trim();
    if user_id.is_empty() {
        return Err(BrokerError::bad_request("user_id must not be empty"));
    }
    let image = req.container_image.as_deref().unwrap_or(&state.config.image_allowlist()[0]).to_owned();
    if !state.config.image_allowed(&image) {
        return Err(BrokerError::bad_request(format!("image {image} is not allow-listed")));
    }

    let now = crate::clock::unix_now();
    let window_start = now - (now % state.config.rate_limit_window_secs as i64);
    let count = state.store.incr_rate(user_id, CREATE_SESSION_ENDPOINT, window_start)?;
    if count > state.config.rate_limit_max {
        return Err(BrokerError::new(ErrorCode::RateLimited, "session creation rate limit exceeded"));
    }

    let active = state
        .store
        .list_by_user(user_id, u32::MAX)?
        .into_iter()
        .filter(|s| !matches!(s.status, SessionStatus::Terminated | SessionStatus::Failed))
        .count();
    if active >= state.config.max_sessions_per_user as usize {
        return Err(BrokerError::conflict("max concurrent sessions per user exceeded"));
    }

    state.session_manager.create(user_id, &image).await
}

/// `GET /api/sessions?user_id=...&limit=...`, per §4.7.
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListSessionsQuery>,
) -> impl IntoResponse {
    let user_id = query.user_id.trim();
    if user_id.is_empty() {
        return BrokerError::bad_request("user_id must not be empty").into_response();
    }
    let limit = query.limit.unwrap_or(50).min(500);
    match state.store.list_by_user(user_id, limit) {
        Ok(rows) => {
            let sessions = rows.iter().map(SessionSummary::from).collect();
            Json(SessionListResponse { sessions }).into_response()
        }
        Err(err) => err.into_response(),
    }
}

/// `GET /api/sessions/{id}`, per §4.7.
pub async fn get_session(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match state.store.get(id) {
        Ok(Some(session)) => Json(SessionResponse::from_session(&session)).into_response(),
        Ok(None) => BrokerError::not_found(format!("session {id} not found")).into_response(),
        Err(err) => err.into_response(),
    }
}

/// `DELETE /api/sessions/{id}`, per §4.7: transitions to `Terminating`
/// synchronously, signals any live PTY Bridge to tear down, and schedules
/// container removal in the background.
pub async fn delete_session(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match state.session_manager.delete(id).await {
        Ok(session) => {
            state.cancel_bridge(id);
            (
                axum::http::StatusCode::ACCEPTED,
                Json(DeleteSessionResponse { session_id: session.id, status: session.status }),
            )
                .into_response()
        }
        Err(err) => err.into_response(),
    }
}

/// `GET /health` — liveness probe, unauthenticated per §6.
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok", version: env!("CARGO_PKG_VERSION") })
}

/// `POST /api/privacy/enable`, per §4.7/§4.3.
pub async fn privacy_enable(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.aes.enable().await {
        Ok(status) => Json(PrivacyResponse { state: status }).into_response(),
        Err(err) => err.into_response(),
    }
}

/// `POST /api/privacy/disable`, per §4.7/§4.3.
pub async fn privacy_disable(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.aes.disable().await {
        Ok(status) => Json(PrivacyResponse { state: status }).into_response(),
        Err(err) => err.into_response(),
    }
}

/// `GET /api/privacy/status`, per §4.7/§4.3.
pub async fn privacy_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(PrivacyResponse { state: state.aes.status() })
}

#[cfg(test)]
#[path = "admin_tests.rs"]
mod tests;
