// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Anonymizing Egress Supervisor (AES) — §4.3.
//!
//! Starts, monitors, and stops a local SOCKS5 proxy subprocess bound to
//! loopback. Subprocess launching is behind [`ProxySpawner`] the same way
//! [`crate::runtime::ContainerRuntime`] abstracts the container engine:
//! [`SubprocessSpawner`] is the production path, [`FakeSpawner`] stands in
//! for a real SOCKS5 binary in tests.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::error::BrokerError;
use crate::model::{AnonymityState, AuditKind};
use crate::store::MetadataStore;

/// Readiness-probe retry budget, per §4.3.
const READY_PROBE_BUDGET: Duration = Duration::from_secs(3);
const READY_PROBE_INTERVAL: Duration = Duration::from_millis(100);
/// Grace between SIGTERM and SIGKILL on disable, per §4.3.
const STOP_GRACE: Duration = Duration::from_secs(2);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A running SOCKS5 proxy process, or a fake standing in for one.
#[async_trait]
pub trait ProxyHandle: Send + Sync {
    /// Terminate the process, SIGTERM-then-SIGKILL for a real subprocess.
    async fn kill(&self);
    fn pid(&self) -> Option<u32>;
}

/// Launches a SOCKS5 proxy bound to loopback on the given port.
#[async_trait]
pub trait ProxySpawner: Send + Sync {
    async fn spawn(&self, port: u16) -> Result<Box<dyn ProxyHandle>, BrokerError>;
}

/// Production spawner: launches the configured command, substituting
/// `{port}` via [`crate::config::Config::anon_proxy_argv`] before this is
/// called.
pub struct SubprocessSpawner {
    argv: Vec<String>,
}

impl SubprocessSpawner {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

#[async_trait]
impl ProxySpawner for SubprocessSpawner {
    async fn spawn(&self, _port: u16) -> Result<Box<dyn ProxyHandle>, BrokerError> {
        let Some((program, rest)) = self.argv.split_first() else {
            return Err(BrokerError::runtime_unavailable("no SOCKS proxy command configured"));
        };
        let child = Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BrokerError::runtime_unavailable(format!("spawn socks proxy: {e}")))?;
        let pid = child.id();
        Ok(Box::new(ChildHandle { child: Mutex::new(child), pid }))
    }
}

struct ChildHandle {
    child: Mutex<Child>,
    pid: Option<u32>,
}

#[async_trait]
impl ProxyHandle for ChildHandle {
    async fn kill(&self) {
        let mut child = self.child.lock().await;
        let Some(pid) = self.pid else {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return;
        };
        let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGTERM);
        let deadline = tokio::time::Instant::now() + STOP_GRACE;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) if tokio::time::Instant::now() >= deadline => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return;
                }
                Ok(None) => tokio::time::sleep(STOP_POLL_INTERVAL).await,
                Err(_) => return,
            }
        }
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Test stand-in for a real SOCKS5 binary: binds the listen port for real
/// (so the readiness probe and crash probe see honest TCP behavior) but
/// accepts and immediately drops connections instead of proxying anything.
pub struct FakeSpawner {
    /// If set, the accept loop exits after this long, as if the process had
    /// crashed — used to exercise AES's crash-probe path.
    crash_after: Option<Duration>,
}

impl FakeSpawner {
    pub fn new() -> Self {
        Self { crash_after: None }
    }

    pub fn crashing_after(crash_after: Duration) -> Self {
        Self { crash_after: Some(crash_after) }
    }
}

impl Default for FakeSpawner {
    fn default() -> Self {
        Self::new()
    }
}

struct FakeHandle {
    cancel: CancellationToken,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[async_trait]
impl ProxyHandle for FakeHandle {
    async fn kill(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }

    fn pid(&self) -> Option<u32> {
        None
    }
}

#[async_trait]
impl ProxySpawner for FakeSpawner {
    async fn spawn(&self, port: u16) -> Result<Box<dyn ProxyHandle>, BrokerError> {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| BrokerError::runtime_unavailable(format!("fake socks listen: {e}")))?;
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        // A crash-free fake never fires this deadline in practice.
        let crash_after = self.crash_after.unwrap_or(Duration::from_secs(3650 * 24 * 3600));
        let task = tokio::spawn(async move {
            let deadline = tokio::time::sleep(crash_after);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => return,
                    _ = &mut deadline => return,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _)) => drop(stream),
                            Err(_) => return,
                        }
                    }
                }
            }
        });
        Ok(Box::new(FakeHandle { cancel, task: Mutex::new(Some(task)) }))
    }
}

/// Process-wide supervisor over a single SOCKS5 proxy instance, per §4.3/§5.
/// `enable`/`disable` serialize under the handle mutex; [`Self::status`] is a
/// lock-free read of the atomics below, per §5's "status reads are lock-free
/// against a memory-ordered snapshot".
pub struct AnonymitySupervisor {
    spawner: Arc<dyn ProxySpawner>,
    store: Arc<MetadataStore>,
    listen_port: u16,
    enabled: AtomicBool,
    started_at: AtomicI64,
    pid: AtomicU32,
    handle: Mutex<Option<Box<dyn ProxyHandle>>>,
}

impl AnonymitySupervisor {
    pub fn new(spawner: Arc<dyn ProxySpawner>, store: Arc<MetadataStore>, listen_port: u16) -> Arc<Self> {
        Arc::new(Self {
            spawner,
            store,
            listen_port,
            enabled: AtomicBool::new(false),
            started_at: AtomicI64::new(0),
            pid: AtomicU32::new(0),
            handle: Mutex::new(None),
        })
    }

    /// `enable(); enable()` is idempotent, per §8 — a second call while
    /// already enabled returns the current status without spawning again.
    #[instrument(skip(self))]
    pub async fn enable(&self) -> Result<AnonymityState, BrokerError> {
        let mut guard = self.handle.lock().await;
        if guard.is_some() {
            return Ok(self.status());
        }
        let handle = self.spawner.spawn(self.listen_port).await?;
        if let Err(err) = self.wait_ready().await {
            handle.kill().await;
            return Err(err);
        }
        let pid = handle.pid();
        *guard = Some(handle);
        drop(guard);

        let now = crate::clock::unix_now();
        self.started_at.store(now, Ordering::Release);
        self.pid.store(pid.unwrap_or(0), Ordering::Release);
        self.enabled.store(true, Ordering::Release);

        self.store.append_audit(
            None,
            "system",
            AuditKind::PrivacyEnable,
            serde_json::json!({"socks_port": self.listen_port}),
            now,
        )?;
        info!(port = self.listen_port, "anonymizing egress proxy enabled");
        Ok(self.status())
    }

    pub async fn disable(&self) -> Result<AnonymityState, BrokerError> {
        self.disable_with_reason(None).await
    }

    async fn disable_with_reason(&self, reason: Option<&str>) -> Result<AnonymityState, BrokerError> {
        let mut guard = self.handle.lock().await;
        if let Some(handle) = guard.take() {
            handle.kill().await;
        }
        drop(guard);

        self.enabled.store(false, Ordering::Release);
        self.pid.store(0, Ordering::Release);

        let now = crate::clock::unix_now();
        let mut payload = serde_json::json!({});
        if let Some(reason) = reason {
            payload["reason"] = serde_json::Value::String(reason.to_owned());
        }
        self.store.append_audit(None, "system", AuditKind::PrivacyDisable, payload, now)?;
        info!(port = self.listen_port, ?reason, "anonymizing egress proxy disabled");
        Ok(self.status())
    }

    /// Lock-free snapshot, per §5.
    pub fn status(&self) -> AnonymityState {
        AnonymityState {
            enabled: self.enabled.load(Ordering::Acquire),
            listen_port: self.listen_port,
            pid: match self.pid.load(Ordering::Acquire) {
                0 => None,
                pid => Some(pid),
            },
            started_at: match self.started_at.load(Ordering::Acquire) {
                0 => None,
                ts => Some(ts),
            },
        }
    }

    async fn wait_ready(&self) -> Result<(), BrokerError> {
        let deadline = tokio::time::Instant::now() + READY_PROBE_BUDGET;
        loop {
            if TcpStream::connect(("127.0.0.1", self.listen_port)).await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BrokerError::runtime_unavailable(
                    "socks proxy did not become ready within budget",
                ));
            }
            tokio::time::sleep(READY_PROBE_INTERVAL).await;
        }
    }

    /// Background crash probe, per §4.3: periodically reconfirms the listen
    /// port is reachable while enabled; on failure, disables and audits the
    /// reason rather than retrying the probe forever.
    pub async fn run_crash_probe(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("anonymity crash probe shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    if !self.enabled.load(Ordering::Acquire) {
                        continue;
                    }
                    if TcpStream::connect(("127.0.0.1", self.listen_port)).await.is_err() {
                        warn!(port = self.listen_port, "anonymity proxy unreachable, disabling");
                        let _ = self
                            .disable_with_reason(Some("crash detected: listen port unreachable"))
                            .await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "aes_tests.rs"]
mod tests;
