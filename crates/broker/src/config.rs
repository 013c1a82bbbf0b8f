// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use clap::Parser;

use crate::model::ResourceLimits;

/// Default allow-listed base images (§6), used when `--image-allowlist` is unset.
pub const DEFAULT_IMAGE_ALLOWLIST: &[&str] = &[
    "ubuntu:22.04",
    "ubuntu:20.04",
    "alpine:latest",
    "debian:latest",
    "node:18-alpine",
    "python:3.11-slim",
    "rust:latest",
];

/// Browser-accessible terminal broker: mediates between web clients and
/// ephemeral, isolated container sessions.
#[derive(Debug, Clone, Parser)]
#[command(name = "termbroker", version, about)]
pub struct Config {
    /// HTTP host to bind to.
    #[arg(long, env = "SERVER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// HTTP port to bind to.
    #[arg(long, env = "SERVER_PORT", default_value = "8080")]
    pub port: u16,

    /// Docker Engine API endpoint (unix socket or tcp address).
    #[arg(long, env = "DOCKER_HOST")]
    pub docker_host: Option<String>,

    /// SQLite database file for the Metadata Store.
    #[arg(long, env = "DB_PATH", default_value = "termbroker.db")]
    pub db_path: PathBuf,

    /// Comma-separated allow-list of base images. Falls back to the built-in default set.
    #[arg(long, env = "IMAGE_ALLOWLIST")]
    pub image_allowlist: Option<String>,

    /// Idle TTL for a detached session, in seconds, before it is terminated.
    #[arg(long, env = "SESSION_IDLE_TTL_SECS", default_value = "600")]
    pub session_idle_ttl_secs: u64,

    /// Grace period for a `Ready` session with no attach, in seconds.
    #[arg(long, env = "SESSION_READY_GRACE_SECS", default_value = "120")]
    pub session_ready_grace_secs: u64,

    /// Overall timeout for session creation (pull + create + start + ready-probe), in seconds.
    #[arg(long, env = "SESSION_CREATE_TIMEOUT_SECS", default_value = "30")]
    pub session_create_timeout_secs: u64,

    /// Sweeper tick interval, in seconds.
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value = "10")]
    pub sweep_interval_secs: u64,

    /// Audit-visibility grace window after `Terminated`, in seconds, before
    /// the row is deleted from the Metadata Store.
    #[arg(long, env = "SESSION_AUDIT_GRACE_SECS", default_value = "60")]
    pub session_audit_grace_secs: u64,

    /// Rate-limit window, in seconds, for per-(user, endpoint) throttling.
    #[arg(long, env = "RATE_LIMIT_WINDOW_SECS", default_value = "60")]
    pub rate_limit_window_secs: u64,

    /// Maximum requests allowed per rate-limit window.
    #[arg(long, env = "RATE_LIMIT_MAX", default_value = "5")]
    pub rate_limit_max: u32,

    /// Whether the anonymizing egress proxy is enabled at startup.
    #[arg(long, env = "ANON_ENABLED_DEFAULT", default_value = "false")]
    pub anon_enabled_default: bool,

    /// Local SOCKS5 listen port for the anonymizing egress proxy.
    #[arg(long, env = "ANYONE_SOCKS_PORT", default_value = "9050")]
    pub anon_socks_port: u16,

    /// Command template for the SOCKS5 proxy subprocess the AES spawns;
    /// `{port}` is substituted with `anon_socks_port`.
    #[arg(long, env = "ANON_PROXY_CMD", default_value = "anon --socks-port {port} --quiet")]
    pub anon_proxy_cmd: String,

    /// AES crash-probe interval, in seconds.
    #[arg(long, env = "ANON_CRASH_PROBE_INTERVAL_SECS", default_value = "5")]
    pub anon_crash_probe_interval_secs: u64,

    /// Maximum non-terminal sessions a single user may hold concurrently.
    #[arg(long, env = "MAX_SESSIONS_PER_USER", default_value = "5")]
    pub max_sessions_per_user: u32,

    /// Emit optional `container_metrics` rows (off by default).
    #[arg(long, env = "METRICS_ENABLED", default_value = "false")]
    pub metrics_enabled: bool,

    /// Bearer token gating the Admin Surface and stream upgrade. Unset = open (§10.3).
    #[arg(long, env = "AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Log format: `pretty` or `json`.
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level / env-filter directive string.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    /// Container runtime backend. `fake` is for tests only — it fabricates
    /// a pipe-backed pseudo-PTY instead of talking to a Docker daemon.
    #[arg(long, env = "CONTAINER_RUNTIME", default_value = "docker", hide = true)]
    pub container_runtime: String,
}

impl Config {
    /// Validate the configuration after parsing, per §10.2.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port == 0 {
            anyhow::bail!("--port must be a nonzero, bindable port");
        }

        let allowlist = self.image_allowlist();
        if allowlist.is_empty() {
            anyhow::bail!("image allow-list must not be empty");
        }

        if self.session_idle_ttl_secs < 5 {
            tracing::warn!(
                idle_ttl_secs = self.session_idle_ttl_secs,
                "session_idle_ttl_secs is unusually small"
            );
        }

        match self.container_runtime.as_str() {
            "docker" | "fake" => {}
            other => anyhow::bail!("invalid --container-runtime: {other}"),
        }

        Ok(())
    }

    /// Resolve the effective image allow-list (configured, or the built-in default).
    pub fn image_allowlist(&self) -> Vec<String> {
        match &self.image_allowlist {
            Some(raw) => {
                raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect()
            }
            None => DEFAULT_IMAGE_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Whether the given image is allow-listed.
    pub fn image_allowed(&self, image: &str) -> bool {
        self.image_allowlist().iter().any(|s| s == image)
    }

    /// Default resource limits applied to every new session's container.
    pub fn default_resource_limits(&self) -> ResourceLimits {
        ResourceLimits::default()
    }

    pub fn uses_fake_runtime(&self) -> bool {
        self.container_runtime == "fake"
    }

    /// Split [`Self::anon_proxy_cmd`] into argv, substituting `{port}`.
    pub fn anon_proxy_argv(&self) -> Vec<String> {
        self.anon_proxy_cmd
            .split_whitespace()
            .map(|part| part.replace("{port}", &self.anon_socks_port.to_string()))
            .collect()
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
