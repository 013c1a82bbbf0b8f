// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared application state handed to every axum handler via the `State`
//! extractor, grouped by concern the way the rest of this codebase groups
//! its top-level structs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::aes::AnonymitySupervisor;
use crate::config::Config;
use crate::runtime::ContainerRuntime;
use crate::session::SessionManager;
use crate::store::MetadataStore;

pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<MetadataStore>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub session_manager: Arc<SessionManager>,
    pub aes: Arc<AnonymitySupervisor>,
    /// Per-session cancellation tokens for active PTY Bridge instances, so
    /// an operator delete can signal a running bridge to tear down instead
    /// of waiting for the client to disconnect.
    bridge_cancels: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        store: Arc<MetadataStore>,
        runtime: Arc<dyn ContainerRuntime>,
        session_manager: Arc<SessionManager>,
        aes: Arc<AnonymitySupervisor>,
    ) -> Self {
        Self { config, store, runtime, session_manager, aes, bridge_cancels: Mutex::new(HashMap::new()) }
    }

    /// Register a fresh cancellation token for a newly attached bridge,
    /// returning it for the bridge supervisor to select on.
    pub fn register_bridge_cancel(&self, session_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.bridge_cancels.lock().unwrap_or_else(|e| e.into_inner()).insert(session_id, token.clone());
        token
    }

    pub fn clear_bridge_cancel(&self, session_id: Uuid) {
        self.bridge_cancels.lock().unwrap_or_else(|e| e.into_inner()).remove(&session_id);
    }

    /// Signal an active bridge to cancel, if one is attached to this session.
    pub fn cancel_bridge(&self, session_id: Uuid) {
        if let Some(token) = self.bridge_cancels.lock().unwrap_or_else(|e| e.into_inner()).get(&session_id) {
            token.cancel();
        }
    }
}
