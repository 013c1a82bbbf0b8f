// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Data model shared by the Metadata Store, the Session Manager, and the
//! Admin Surface's JSON responses.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque 128-bit session identifier.
pub type SessionId = Uuid;

/// Session lifecycle state. Transitions are enforced by [`crate::session::SessionManager`]
/// against the DAG in §4.4 — this type carries no transition logic of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Creating,
    Ready,
    Attached,
    Detached,
    Terminating,
    Terminated,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "Creating",
            Self::Ready => "Ready",
            Self::Attached => "Attached",
            Self::Detached => "Detached",
            Self::Terminating => "Terminating",
            Self::Terminated => "Terminated",
            Self::Failed => "Failed",
        }
    }

    /// `true` for the states where a `container_ref` must be present.
    pub fn has_container(&self) -> bool {
        matches!(self, Self::Ready | Self::Attached | Self::Detached | Self::Terminating)
    }

    /// `true` for the states from which a stream transport may bind.
    pub fn attachable(&self) -> bool {
        matches!(self, Self::Ready | Self::Detached)
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "Creating" => Self::Creating,
            "Ready" => Self::Ready,
            "Attached" => Self::Attached,
            "Detached" => Self::Detached,
            "Terminating" => Self::Terminating,
            "Terminated" => Self::Terminated,
            "Failed" => Self::Failed,
            _ => return None,
        })
    }

    /// Whether `self -> to` is a legal edge in the §4.4 DAG.
    pub fn can_transition_to(&self, to: Self) -> bool {
        use SessionStatus::*;
        matches!(
            (self, to),
            (Creating, Ready)
                | (Creating, Failed)
                | (Ready, Attached)
                | (Attached, Detached)
                | (Detached, Attached)
                | (Detached, Terminating)
                | (Attached, Terminating)
                | (Ready, Terminating)
                | (Terminating, Terminated)
                | (Failed, Terminated)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable resource ceilings applied at container-creation time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_bytes: u64,
    pub cpu_shares: u32,
    pub pids_max: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self { memory_bytes: 512 * 1024 * 1024, cpu_shares: 512, pids_max: 128 }
    }
}

/// A single session row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub user_id: String,
    pub image: String,
    pub status: SessionStatus,
    pub container_ref: Option<String>,
    pub resource_limits: ResourceLimits,
    pub created_at: i64,
    /// When the row entered `Ready`, distinct from `created_at` — the §4.4
    /// attach-grace deadline is measured from here so provisioning time
    /// doesn't eat into the grace budget. `None` before the row leaves
    /// `Creating`.
    pub ready_at: Option<i64>,
    pub last_activity_at: i64,
    pub detached_at: Option<i64>,
    pub expires_at: Option<i64>,
    pub metadata: BTreeMap<String, String>,
}

impl Session {
    /// Invariant check per §3 — used by tests and as a defensive assertion
    /// after any state transition.
    pub fn invariants_hold(&self) -> bool {
        let container_ok = self.status.has_container() == self.container_ref.is_some();
        let expiry_ok = match (self.expires_at, self.detached_at) {
            (Some(exp), Some(det)) => exp > det,
            (Some(_), None) => false,
            _ => true,
        };
        container_ok && expiry_ok
    }
}

/// Compact representation returned by list/summary endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub user_id: String,
    pub image: String,
    pub status: SessionStatus,
    pub created_at: i64,
    pub last_activity_at: i64,
}

impl From<&Session> for SessionSummary {
    fn from(s: &Session) -> Self {
        Self {
            session_id: s.id,
            user_id: s.user_id.clone(),
            image: s.image.clone(),
            status: s.status,
            created_at: s.created_at,
            last_activity_at: s.last_activity_at,
        }
    }
}

/// Closed set of audit event kinds, per §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditKind {
    SessionCreate,
    SessionReady,
    SessionAttach,
    SessionDetach,
    SessionTerminate,
    SessionFail,
    SecurityViolation,
    PrivacyEnable,
    PrivacyDisable,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionCreate => "session.create",
            Self::SessionReady => "session.ready",
            Self::SessionAttach => "session.attach",
            Self::SessionDetach => "session.detach",
            Self::SessionTerminate => "session.terminate",
            Self::SessionFail => "session.fail",
            Self::SecurityViolation => "security.violation",
            Self::PrivacyEnable => "privacy.enable",
            Self::PrivacyDisable => "privacy.disable",
        }
    }
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only audit row. `session_id` is `None` for process-wide events
/// (e.g. `privacy.enable`).
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub seq: i64,
    pub session_id: Option<SessionId>,
    pub user_id: String,
    pub kind: AuditKind,
    pub payload: serde_json::Value,
    pub created_at: i64,
}

/// A security-relevant event, stored separately from general audit rows
/// so operators can alert on it without filtering the full audit stream.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityEvent {
    pub seq: i64,
    pub session_id: Option<SessionId>,
    pub user_id: String,
    pub reason: String,
    pub created_at: i64,
}

/// Process-wide anonymity (egress proxy) state, per §3.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnonymityState {
    pub enabled: bool,
    pub listen_port: u16,
    pub pid: Option<u32>,
    pub started_at: Option<i64>,
}

#[cfg(test)]
#[path = "model_tests.rs"]
mod tests;
