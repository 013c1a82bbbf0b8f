// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Transport Endpoint (TE) — §4.6.
//!
//! `/ws/{session_id}` and `/pty/{session_id}` are served by the same axum
//! WebSocket upgrade handler, parameterized only by the downstream pump's
//! preferred frame type, per §9's frame-grammar consolidation note.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use futures_util::SinkExt;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::admin;
use crate::auth;
use crate::bridge::{self, BridgeOutcome, FrameMode};
use crate::model::AuditKind;
use crate::runtime::{ContainerRef, PtySize};
use crate::state::AppState;

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;
const SHELL_ARGV: &[&str] = &["/bin/sh"];

/// Assemble the full HTTP/WebSocket surface, per §4.6/§4.7. The bearer-token
/// gate (§10.3) is applied as middleware over the whole router rather than
/// per-handler; `auth::auth_layer` itself exempts `/health` and the stream
/// upgrade paths, which carry their own `?token=` check.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(admin::health))
        .route("/api/sessions", post(admin::create_session).get(admin::list_sessions))
        .route("/api/sessions/{id}", get(admin::get_session).delete(admin::delete_session))
        .route("/api/privacy/enable", post(admin::privacy_enable))
        .route("/api/privacy/disable", post(admin::privacy_disable))
        .route("/api/privacy/status", get(admin::privacy_status))
        .route("/ws/{session_id}", get(ws_upgrade))
        .route("/pty/{session_id}", get(pty_upgrade))
        .layer(axum::middleware::from_fn_with_state(Arc::clone(&state), auth::auth_layer))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    token: Option<String>,
}

/// `GET /ws/{session_id}` — JSON/UTF-8-text-preferred downstream framing.
pub async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
    Query(query): Query<StreamQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    handle_upgrade(state, session_id, query, FrameMode::Text, ws).await
}

/// `GET /pty/{session_id}` — binary-preferred downstream framing.
pub async fn pty_upgrade(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
    Query(query): Query<StreamQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    handle_upgrade(state, session_id, query, FrameMode::Binary, ws).await
}

/// The handshake always completes, per §6: rejecting pre-upgrade would leave
/// a stream client unable to observe the documented close codes (4001/4003),
/// so auth and claim failures are reported as a WS close frame instead of a
/// plain HTTP error.
async fn handle_upgrade(
    state: Arc<AppState>,
    session_id: Uuid,
    query: StreamQuery,
    mode: FrameMode,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        if let Err(code) = auth::validate_token(query.token.as_deref(), state.config.auth_token.as_deref()) {
            close_with_code(socket, code.ws_close_code(), code.as_str()).await;
            return;
        }

        match state.session_manager.attach_claim(session_id).await {
            Ok(session) => run_attached_session(state, session, mode, socket).await,
            Err(err) => close_with_code(socket, err.code.ws_close_code(), &err.message).await,
        }
    })
}

/// Complete the close handshake with a specific code before dropping the
/// socket, per §6 — used for auth/claim failures that happen after upgrade.
async fn close_with_code(mut socket: WebSocket, code: u16, reason: &str) {
    let _ = socket.send(Message::Close(Some(CloseFrame { code, reason: reason.to_owned().into() }))).await;
    let _ = socket.close().await;
}

#[instrument(skip(state, socket), fields(session_id = %session.id))]
async fn run_attached_session(
    state: Arc<AppState>,
    session: crate::model::Session,
    mode: FrameMode,
    socket: axum::extract::ws::WebSocket,
) {
    let container_ref = match &session.container_ref {
        Some(r) => ContainerRef(r.clone()),
        None => {
            warn!("attached session has no container_ref, closing");
            return;
        }
    };

    let pty = state
        .runtime
        .exec_pty(
            &container_ref,
            &SHELL_ARGV.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            &[],
            PtySize { cols: DEFAULT_COLS, rows: DEFAULT_ROWS },
        )
        .await;

    let pty = match pty {
        Ok(pty) => pty,
        Err(err) => {
            warn!(%err, "exec_pty failed on attach");
            let _ = state.session_manager.release_to_terminating(session.id).await;
            return;
        }
    };

    let cancel = state.register_bridge_cancel(session.id);
    let outcome = bridge::run(pty, socket, mode, cancel).await;
    state.clear_bridge_cancel(session.id);

    finalize_outcome(&state, session.id, outcome).await;
}

async fn finalize_outcome(state: &Arc<AppState>, session_id: Uuid, outcome: BridgeOutcome) {
    match outcome {
        BridgeOutcome::ClientClosed => {
            info!(%session_id, "bridge closed by client, releasing to Detached");
            if let Err(err) = state.session_manager.release_to_detached(session_id).await {
                warn!(%session_id, %err, "failed to release session to Detached");
            }
        }
        BridgeOutcome::PtyClosed => {
            info!(%session_id, "pty closed (container exit), terminating session");
            if let Err(err) = state.session_manager.release_to_terminating(session_id).await {
                warn!(%session_id, %err, "failed to terminate session after pty close");
            }
        }
        BridgeOutcome::Cancelled => {
            info!(%session_id, "bridge cancelled by session manager");
        }
        BridgeOutcome::HeartbeatTimeout => {
            info!(%session_id, "bridge heartbeat timed out, releasing to Detached");
            if let Err(err) = state.session_manager.release_to_detached(session_id).await {
                warn!(%session_id, %err, "failed to release session after heartbeat timeout");
            }
        }
        BridgeOutcome::SecurityViolation(reason) => {
            warn!(%session_id, %reason, "bridge closed for security violation");
            let now = crate::clock::unix_now();
            let user_id = state.store.get(session_id).ok().flatten().map(|s| s.user_id).unwrap_or_default();
            let _ = state.store.append_security(Some(session_id), &user_id, &reason, now);
            let _ = state.store.append_audit(
                Some(session_id),
                &user_id,
                AuditKind::SecurityViolation,
                serde_json::json!({"reason": reason}),
                now,
            );
            if let Err(err) = state.session_manager.release_to_terminating(session_id).await {
                warn!(%session_id, %err, "failed to terminate session after security violation");
            }
        }
    }
}
