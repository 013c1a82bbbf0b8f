// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end binary smoke tests.
//!
//! Spawns the real `termbroker` binary (wired to the `fake` container
//! runtime profile, per §8's test-only backend) and exercises it over its
//! HTTP admin surface and WebSocket stream transport.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

/// Find a free TCP port by binding to :0 then releasing.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Resolve the path to the compiled `termbroker` binary.
fn termbroker_binary() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs -> tests -> workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join("termbroker")
}

/// Builder for a [`BrokerProcess`], letting individual tests dial in the
/// TTL/grace/sweep knobs they need to observe eviction within the test
/// timeout instead of waiting out the production defaults.
pub struct BrokerBuilder {
    idle_ttl_secs: u64,
    ready_grace_secs: u64,
    audit_grace_secs: u64,
    sweep_interval_secs: u64,
    max_sessions_per_user: u32,
    rate_limit_max: u32,
}

impl Default for BrokerBuilder {
    fn default() -> Self {
        Self {
            idle_ttl_secs: 600,
            ready_grace_secs: 120,
            audit_grace_secs: 60,
            sweep_interval_secs: 10,
            max_sessions_per_user: 5,
            rate_limit_max: 5,
        }
    }
}

impl BrokerBuilder {
    pub fn idle_ttl_secs(mut self, v: u64) -> Self {
        self.idle_ttl_secs = v;
        self
    }

    pub fn ready_grace_secs(mut self, v: u64) -> Self {
        self.ready_grace_secs = v;
        self
    }

    pub fn audit_grace_secs(mut self, v: u64) -> Self {
        self.audit_grace_secs = v;
        self
    }

    pub fn sweep_interval_secs(mut self, v: u64) -> Self {
        self.sweep_interval_secs = v;
        self
    }

    pub fn max_sessions_per_user(mut self, v: u32) -> Self {
        self.max_sessions_per_user = v;
        self
    }

    pub fn rate_limit_max(mut self, v: u32) -> Self {
        self.rate_limit_max = v;
        self
    }

    pub fn spawn(self) -> anyhow::Result<BrokerProcess> {
        let binary = termbroker_binary();
        anyhow::ensure!(binary.exists(), "termbroker binary not found at {}", binary.display());

        let port = free_port()?;
        let db_dir = tempfile::tempdir()?;
        let db_path = db_dir.path().join("termbroker.db");

        let child = Command::new(&binary)
            .args([
                "--host".to_owned(),
                "127.0.0.1".to_owned(),
                "--port".to_owned(),
                port.to_string(),
                "--db-path".to_owned(),
                db_path.to_string_lossy().into_owned(),
                "--container-runtime".to_owned(),
                "fake".to_owned(),
                "--session-idle-ttl-secs".to_owned(),
                self.idle_ttl_secs.to_string(),
                "--session-ready-grace-secs".to_owned(),
                self.ready_grace_secs.to_string(),
                "--session-audit-grace-secs".to_owned(),
                self.audit_grace_secs.to_string(),
                "--sweep-interval-secs".to_owned(),
                self.sweep_interval_secs.to_string(),
                "--max-sessions-per-user".to_owned(),
                self.max_sessions_per_user.to_string(),
                "--rate-limit-max".to_owned(),
                self.rate_limit_max.to_string(),
                "--log-format".to_owned(),
                "pretty".to_owned(),
                "--log-level".to_owned(),
                "warn".to_owned(),
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        Ok(BrokerProcess { child, port, _db_dir: db_dir })
    }
}

/// A running `termbroker` process, killed on drop.
pub struct BrokerProcess {
    child: Child,
    port: u16,
    _db_dir: tempfile::TempDir,
}

impl BrokerProcess {
    /// Spawn with every TTL/grace knob at its production default.
    pub fn start() -> anyhow::Result<Self> {
        BrokerBuilder::default().spawn()
    }

    pub fn build() -> BrokerBuilder {
        BrokerBuilder::default()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// WebSocket URL for the binary-preferred `/pty/{id}` endpoint.
    pub fn pty_url(&self, session_id: &str) -> String {
        format!("ws://127.0.0.1:{}/pty/{session_id}", self.port)
    }

    /// WebSocket URL for the text-preferred `/ws/{id}` endpoint.
    pub fn ws_url(&self, session_id: &str) -> String {
        format!("ws://127.0.0.1:{}/ws/{session_id}", self.port)
    }

    /// Poll `/health` until it responds or `timeout` elapses.
    pub async fn wait_healthy(&self, timeout: Duration) -> anyhow::Result<()> {
        let client = reqwest::Client::new();
        let url = format!("{}/health", self.base_url());
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("termbroker did not become healthy within {timeout:?}");
            }
            if let Ok(resp) = client.get(&url).send().await {
                if resp.status().is_success() {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Poll `GET /api/sessions/{id}` until its `status` equals `want`, or
    /// time out. Treats a 404 as the terminal "row deleted past audit grace"
    /// state, returning `Ok(())` only if `want == "Terminated"`.
    pub async fn wait_status(&self, session_id: &str, want: &str, timeout: Duration) -> anyhow::Result<()> {
        let client = reqwest::Client::new();
        let url = format!("{}/api/sessions/{session_id}", self.base_url());
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("session {session_id} never reached status {want} within {timeout:?}");
            }
            let resp = client.get(&url).send().await?;
            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                if want == "Terminated" {
                    return Ok(());
                }
            } else if resp.status().is_success() {
                let body: serde_json::Value = resp.json().await?;
                if body["status"] == want {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

impl Drop for BrokerProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
