// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session Manager (SM) — §4.4.
//!
//! Owns the session lifecycle state machine. Every transition is a
//! compare-and-set against the Metadata Store; SM itself holds no
//! per-session lock longer than a single transition. PTY-bridge exclusivity
//! is enforced by the CAS itself: binding a bridge performs `Ready->Attached`
//! or `Detached->Attached`, and only one caller can win that race.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::BrokerError;
use crate::model::{AuditKind, ResourceLimits, Session, SessionId, SessionStatus};
use crate::runtime::{ContainerRef, ContainerRuntime, RuntimeError};
use crate::store::MetadataStore;

/// States reconciled on process restart, per §4.4.
const RECOVERABLE_STATUSES: &[SessionStatus] =
    &[SessionStatus::Creating, SessionStatus::Attached, SessionStatus::Terminating];

/// Teardown retry schedule: initial 1s, factor 2, cap 60s, 5 attempts.
const TEARDOWN_MAX_ATTEMPTS: u32 = 5;
const TEARDOWN_INITIAL_BACKOFF_SECS: u64 = 1;
const TEARDOWN_BACKOFF_FACTOR: u64 = 2;
const TEARDOWN_BACKOFF_CAP_SECS: u64 = 60;

pub struct SessionManager {
    store: Arc<MetadataStore>,
    runtime: Arc<dyn ContainerRuntime>,
    config: Arc<Config>,
}

impl SessionManager {
    pub fn new(store: Arc<MetadataStore>, runtime: Arc<dyn ContainerRuntime>, config: Arc<Config>) -> Self {
        Self { store, runtime, config }
    }

    /// Crash recovery reconciliation, per §4.4: run once, synchronously,
    /// before the HTTP listener binds.
    #[instrument(skip(self))]
    pub async fn reconcile_crash_recovery(&self) -> Result<(), BrokerError> {
        let rows = self.store.list_by_statuses(RECOVERABLE_STATUSES)?;
        let now = crate::clock::unix_now();
        for row in rows {
            let live = match &row.container_ref {
                Some(container_ref) => self.runtime.is_live(&ContainerRef(container_ref.clone())).await,
                None => false,
            };
            if live {
                let detached_at = now;
                let expires_at = now + self.config.session_idle_ttl_secs as i64;
                self.store.force_set_status(
                    row.id,
                    SessionStatus::Detached,
                    Some(detached_at),
                    Some(expires_at),
                    now,
                )?;
                info!(session_id = %row.id, "crash recovery: container live, reconciled to Detached");
            } else {
                self.store.force_set_status(row.id, SessionStatus::Terminated, None, None, now)?;
                self.store.append_audit(
                    Some(row.id),
                    &row.user_id,
                    AuditKind::SessionFail,
                    serde_json::json!({"reason": "crash recovery: container not live"}),
                    now,
                )?;
                info!(session_id = %row.id, "crash recovery: container not live, reconciled to Terminated");
            }
        }
        Ok(())
    }

    /// `POST /api/sessions`, per §4.4/§4.7. Image allow-list and rate limit
    /// checks happen in the Admin Surface before this is called; this method
    /// owns the `Creating -> Ready | Failed` transition.
    #[instrument(skip(self), fields(user_id = %user_id, image = %image))]
    pub async fn create(&self, user_id: &str, image: &str) -> Result<Session, BrokerError> {
        let now = crate::clock::unix_now();
        let id = Uuid::new_v4();
        let limits = self.config.default_resource_limits();
        let session = Session {
            id,
            user_id: user_id.to_owned(),
            image: image.to_owned(),
            status: SessionStatus::Creating,
            container_ref: None,
            resource_limits: limits,
            created_at: now,
            ready_at: None,
            last_activity_at: now,
            detached_at: None,
            expires_at: None,
            metadata: Default::default(),
        };
        self.store.insert_session(&session)?;

        let create_timeout = Duration::from_secs(self.config.session_create_timeout_secs);
        let outcome = tokio::time::timeout(create_timeout, self.provision(image, limits)).await;

        match outcome {
            Ok(Ok(container_ref)) => {
                self.store.set_container_ref(id, &container_ref.0)?;
                let ready_now = crate::clock::unix_now();
                self.store.update_status(id, SessionStatus::Creating, SessionStatus::Ready, ready_now)?;
                self.store.mark_ready(id, ready_now)?;
                self.store.append_audit(
                    Some(id),
                    user_id,
                    AuditKind::SessionCreate,
                    serde_json::json!({"image": image}),
                    ready_now,
                )?;
                self.store.append_audit(
                    Some(id),
                    user_id,
                    AuditKind::SessionReady,
                    serde_json::json!({"container_ref": container_ref.0}),
                    ready_now,
                )?;
                self.store.get(id)?.ok_or_else(|| BrokerError::not_found(format!("session {id} not found")))
            }
            Ok(Err(err)) => {
                self.fail(id, user_id, &err.to_string()).await?;
                Err(err)
            }
            Err(_) => {
                let err = BrokerError::runtime_unavailable("session create timed out");
                self.fail(id, user_id, &err.to_string()).await?;
                Err(err)
            }
        }
    }

    async fn provision(&self, image: &str, limits: ResourceLimits) -> Result<ContainerRef, BrokerError> {
        self.runtime.ensure_image(image).await.map_err(BrokerError::from)?;
        let env = crate::runtime::SecurityProfile::base_env();
        let container_ref =
            self.runtime.create(image, limits, &env, &[]).await.map_err(BrokerError::from)?;
        if let Err(err) = self.runtime.start(&container_ref).await {
            let _ = self.runtime.remove(&container_ref, true).await;
            return Err(BrokerError::from(err));
        }
        Ok(container_ref)
    }

    async fn fail(&self, id: SessionId, user_id: &str, reason: &str) -> Result<(), BrokerError> {
        let now = crate::clock::unix_now();
        let _ = self.store.update_status(id, SessionStatus::Creating, SessionStatus::Failed, now);
        self.store.append_audit(
            Some(id),
            user_id,
            AuditKind::SessionFail,
            serde_json::json!({"reason": reason}),
            now,
        )?;
        Ok(())
    }

    /// Claim a session for a new PTY Bridge binding, per §4.4: `Ready ->
    /// Attached` on first attach, `Detached -> Attached` on reattach.
    #[instrument(skip(self))]
    pub async fn attach_claim(&self, id: SessionId) -> Result<Session, BrokerError> {
        let now = crate::clock::unix_now();
        let row = self.store.get(id)?.ok_or_else(|| BrokerError::not_found(format!("session {id} not found")))?;
        if !row.status.attachable() {
            return Err(BrokerError::conflict(format!("session {id} is not attachable from {}", row.status)));
        }
        self.store.update_status(id, row.status, SessionStatus::Attached, now)?;
        if row.status == SessionStatus::Detached {
            self.store.clear_detached(id)?;
        }
        self.store.append_audit(Some(id), &row.user_id, AuditKind::SessionAttach, serde_json::json!({}), now)?;
        self.store.get(id)?.ok_or_else(|| BrokerError::not_found(format!("session {id} not found")))
    }

    /// PTY Bridge closed cleanly and the container is still running:
    /// `Attached -> Detached`, per §4.4.
    #[instrument(skip(self))]
    pub async fn release_to_detached(&self, id: SessionId) -> Result<Session, BrokerError> {
        let now = crate::clock::unix_now();
        let row = self.store.get(id)?.ok_or_else(|| BrokerError::not_found(format!("session {id} not found")))?;
        let _ = self.store.update_status(id, SessionStatus::Attached, SessionStatus::Detached, now)?;
        let expires_at = now + self.config.session_idle_ttl_secs as i64;
        self.store.set_detached(id, now, expires_at)?;
        self.store.append_audit(Some(id), &row.user_id, AuditKind::SessionDetach, serde_json::json!({}), now)?;
        self.store.get(id)?.ok_or_else(|| BrokerError::not_found(format!("session {id} not found")))
    }

    /// PTY reported container exit while attached: `Attached -> Terminating`,
    /// followed by teardown.
    #[instrument(skip(self))]
    pub async fn release_to_terminating(&self, id: SessionId) -> Result<(), BrokerError> {
        let row = self.store.get(id)?.ok_or_else(|| BrokerError::not_found(format!("session {id} not found")))?;
        self.begin_terminating(id, row.status).await?;
        self.teardown(id).await;
        Ok(())
    }

    /// `DELETE /api/sessions/{id}`, per §4.7. Transitions synchronously and
    /// schedules teardown in the background so the caller gets a prompt
    /// `{status:"terminating"}` response.
    #[instrument(skip(self))]
    pub async fn delete(self: &Arc<Self>, id: SessionId) -> Result<Session, BrokerError> {
        let row = self.store.get(id)?.ok_or_else(|| BrokerError::not_found(format!("session {id} not found")))?;
        if row.status == SessionStatus::Terminated {
            return Ok(row);
        }
        let updated = self.begin_terminating(id, row.status).await?;
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.teardown(id).await;
        });
        Ok(updated)
    }

    async fn begin_terminating(&self, id: SessionId, from: SessionStatus) -> Result<Session, BrokerError> {
        let now = crate::clock::unix_now();
        match from {
            SessionStatus::Attached | SessionStatus::Detached | SessionStatus::Ready => {
                self.store.update_status(id, from, SessionStatus::Terminating, now)
            }
            SessionStatus::Terminating => {
                self.store.get(id)?.ok_or_else(|| BrokerError::not_found(format!("session {id} not found")))
            }
            other => Err(BrokerError::conflict(format!("session {id} cannot be deleted from {other}"))),
        }
    }

    /// Stop + remove the container, retrying with exponential backoff on
    /// failure, per §4.4. Exhaustion moves the row to `Failed` and the
    /// container handle is left for the runtime's own orphan reaper.
    async fn teardown(&self, id: SessionId) {
        let Ok(Some(row)) = self.store.get(id) else { return };
        let Some(container_ref) = row.container_ref.clone() else {
            let now = crate::clock::unix_now();
            let _ = self.store.update_status(id, SessionStatus::Terminating, SessionStatus::Terminated, now);
            return;
        };
        let container_ref = ContainerRef(container_ref);

        let mut attempt = 0u32;
        let mut backoff = TEARDOWN_INITIAL_BACKOFF_SECS;
        loop {
            attempt += 1;
            match self.stop_and_remove(&container_ref).await {
                Ok(()) => {
                    let now = crate::clock::unix_now();
                    self.store.clear_container_ref(id).ok();
                    if self
                        .store
                        .update_status(id, SessionStatus::Terminating, SessionStatus::Terminated, now)
                        .is_ok()
                    {
                        let _ = self.store.append_audit(
                            Some(id),
                            &row.user_id,
                            AuditKind::SessionTerminate,
                            serde_json::json!({}),
                            now,
                        );
                    }
                    return;
                }
                Err(err) if attempt >= TEARDOWN_MAX_ATTEMPTS => {
                    warn!(session_id = %id, attempt, %err, "teardown exhausted retries, marking Failed");
                    let now = crate::clock::unix_now();
                    let _ = self.store.force_set_status(id, SessionStatus::Failed, None, None, now);
                    let _ = self.store.append_audit(
                        Some(id),
                        &row.user_id,
                        AuditKind::SessionFail,
                        serde_json::json!({"reason": err.to_string(), "attempts": attempt}),
                        now,
                    );
                    return;
                }
                Err(err) => {
                    warn!(session_id = %id, attempt, %err, backoff_secs = backoff, "teardown failed, retrying");
                    tokio::time::sleep(Duration::from_secs(backoff)).await;
                    backoff = (backoff * TEARDOWN_BACKOFF_FACTOR).min(TEARDOWN_BACKOFF_CAP_SECS);
                }
            }
        }
    }

    async fn stop_and_remove(&self, container_ref: &ContainerRef) -> Result<(), RuntimeError> {
        self.runtime.stop(container_ref, Duration::from_secs(10)).await?;
        self.runtime.remove(container_ref, true).await
    }

    /// Background sweeper, per §4.4: TTL eviction of `Detached` rows, the
    /// `Ready` attach-grace sweep, and §4.2 retention GC, folded into one
    /// task on a single interval rather than three independently scheduled
    /// loops.
    pub async fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.sweep_interval_secs));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("sweeper shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn sweep_once(&self) {
        let now = crate::clock::unix_now();

        match self.store.expired_detached(now) {
            Ok(ids) => {
                for id in ids {
                    if let Ok(Some(row)) = self.store.get(id) {
                        if self.begin_terminating(id, row.status).await.is_ok() {
                            self.teardown(id).await;
                        }
                    }
                }
            }
            Err(err) => warn!(%err, "sweeper: expired_detached query failed"),
        }

        let ready_grace_deadline = now - self.config.session_ready_grace_secs as i64;
        match self.store.ready_past_grace(ready_grace_deadline) {
            // compares against `ready_at`, not `created_at` — see mark_ready.
            Ok(ids) => {
                for id in ids {
                    let _ = self.store.update_status(id, SessionStatus::Ready, SessionStatus::Terminating, now);
                    if let Ok(Some(row)) = self.store.get(id) {
                        self.teardown_no_container_or_stop(id, &row).await;
                    }
                }
            }
            Err(err) => warn!(%err, "sweeper: ready_past_grace query failed"),
        }

        match self.store.terminated_past_grace(now - self.config.session_audit_grace_secs as i64) {
            Ok(ids) => {
                for id in ids {
                    if let Err(err) = self.store.delete(id) {
                        warn!(session_id = %id, %err, "sweeper: failed to delete terminated row past grace");
                    }
                }
            }
            Err(err) => warn!(%err, "sweeper: terminated_past_grace query failed"),
        }

        if let Err(err) = self.store.gc_retention(now) {
            warn!(%err, "sweeper: retention GC failed");
        }
    }

    async fn teardown_no_container_or_stop(&self, id: SessionId, row: &Session) {
        if row.container_ref.is_some() {
            self.teardown(id).await;
        } else {
            let now = crate::clock::unix_now();
            let _ = self.store.update_status(id, SessionStatus::Terminating, SessionStatus::Terminated, now);
        }
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
