// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Container Runtime Adapter (CRA) — §4.1.
//!
//! [`ContainerRuntime`] is an object-safe capability trait so the Session
//! Manager and PTY Bridge can be exercised against [`fake::FakeRuntime`] in
//! tests without a live Docker daemon; [`docker::DockerRuntime`] is the
//! single production implementation.

pub mod docker;
pub mod fake;

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::model::ResourceLimits;

/// Adapter-assigned handle identifying a live container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerRef(pub String);

impl fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Terminal dimensions for an attached PTY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    pub cols: u16,
    pub rows: u16,
}

/// Failure modes surfaced by the adapter, per §4.1 and §7.
#[derive(Debug, Clone)]
pub enum RuntimeError {
    ImageUnavailable(String),
    ResourceExhausted(String),
    RuntimeUnavailable(String),
    ExecFailed(String),
    NotFound(String),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ImageUnavailable(m) => write!(f, "image unavailable: {m}"),
            Self::ResourceExhausted(m) => write!(f, "resource exhausted: {m}"),
            Self::RuntimeUnavailable(m) => write!(f, "runtime unavailable: {m}"),
            Self::ExecFailed(m) => write!(f, "exec failed: {m}"),
            Self::NotFound(m) => write!(f, "not found: {m}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<RuntimeError> for crate::error::BrokerError {
    fn from(e: RuntimeError) -> Self {
        use crate::error::{BrokerError, ErrorCode};
        match e {
            RuntimeError::ImageUnavailable(m) => BrokerError::new(ErrorCode::BadRequest, m),
            RuntimeError::ResourceExhausted(m) => BrokerError::new(ErrorCode::RuntimeUnavailable, m),
            RuntimeError::RuntimeUnavailable(m) => BrokerError::runtime_unavailable(m),
            RuntimeError::ExecFailed(m) => BrokerError::internal(m),
            RuntimeError::NotFound(m) => BrokerError::not_found(m),
        }
    }
}

/// Security defaults applied to every container the adapter creates, per §4.1.
pub struct SecurityProfile;

impl SecurityProfile {
    pub const CAP_DROP: &'static [&'static str] = &["ALL"];
    pub const CAP_ADD: &'static [&'static str] =
        &["CHOWN", "DAC_OVERRIDE", "FOWNER", "SETUID", "SETGID"];
    pub const NO_NEW_PRIVILEGES: &'static str = "no-new-privileges:true";

    /// Baseline environment merged under any caller-supplied env vars.
    pub fn base_env() -> Vec<(String, String)> {
        vec![
            ("TERM".to_owned(), "xterm-256color".to_owned()),
            ("LANG".to_owned(), "C.UTF-8".to_owned()),
            ("LC_ALL".to_owned(), "C.UTF-8".to_owned()),
            ("DEBIAN_FRONTEND".to_owned(), "noninteractive".to_owned()),
        ]
    }
}

/// An attached pseudo-terminal: independent read/write halves plus an
/// out-of-band control handle for resize/signal/close.
///
/// Reader and writer are split so the PTY Bridge's two pumps can each own a
/// half without sharing a lock, matching §4.5's single-owner requirement.
pub struct Pty {
    pub reader: Pin<Box<dyn AsyncRead + Send>>,
    pub writer: Pin<Box<dyn AsyncWrite + Send>>,
    pub control: Arc<dyn PtyControl>,
}

/// Out-of-band control operations on an attached PTY, per §4.1's guarantees:
/// resize is asynchronous but ordered with respect to subsequent writes on
/// the same handle (callers must await `resize` before issuing the next write
/// if ordering matters — the adapter does not reorder internally).
#[async_trait]
pub trait PtyControl: Send + Sync {
    async fn resize(&self, size: PtySize) -> Result<(), RuntimeError>;

    /// Send a signal to the container's init process (used by CRA::stop's
    /// SIGTERM/SIGKILL escalation, not by per-keystroke control characters —
    /// those pass through the PTY byte stream verbatim).
    async fn signal(&self, signal: nix::sys::signal::Signal) -> Result<(), RuntimeError>;

    /// Close the PTY's write half, signaling EOF to the remote shell.
    async fn close(&self);
}

/// Abstraction over a container engine, per §4.1.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError>;

    async fn create(
        &self,
        image: &str,
        limits: ResourceLimits,
        env: &[(String, String)],
        cmd: &[String],
    ) -> Result<ContainerRef, RuntimeError>;

    async fn start(&self, container_ref: &ContainerRef) -> Result<(), RuntimeError>;

    async fn exec_pty(
        &self,
        container_ref: &ContainerRef,
        argv: &[String],
        env: &[(String, String)],
        initial_size: PtySize,
    ) -> Result<Pty, RuntimeError>;

    async fn stop(&self, container_ref: &ContainerRef, grace: Duration) -> Result<(), RuntimeError>;

    async fn remove(&self, container_ref: &ContainerRef, force: bool) -> Result<(), RuntimeError>;

    /// Whether the container is still live in the runtime. Used by the
    /// Session Manager's crash-recovery reconciliation (§4.4).
    async fn is_live(&self, container_ref: &ContainerRef) -> bool;
}
