// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory [`ContainerRuntime`] fake used by integration tests (§10.4) so
//! S1/S2/S4/S5 of the spec can run without a Docker daemon.
//!
//! Each "container" is a pipe pair plus a tiny line-oriented shell emulator
//! that understands just enough of `echo`, `stty size`, and background-pid
//! bookkeeping to exercise the PTY Bridge's framing and the resize path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::{ContainerRef, ContainerRuntime, Pty, PtyControl, PtySize, RuntimeError};
use crate::model::ResourceLimits;

struct FakeContainer {
    live: std::sync::atomic::AtomicBool,
}

/// Fake adapter: containers never actually run anything, they just track
/// liveness so the Session Manager's state machine can be exercised.
#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, Arc<FakeContainer>>>,
    next_id: AtomicU64,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ensure_image(&self, _image: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn create(
        &self,
        _image: &str,
        _limits: ResourceLimits,
        _env: &[(String, String)],
        _cmd: &[String],
    ) -> Result<ContainerRef, RuntimeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = format!("fake-{id:08x}");
        self.containers
            .lock()
            .await
            .insert(id.clone(), Arc::new(FakeContainer { live: std::sync::atomic::AtomicBool::new(true) }));
        Ok(ContainerRef(id))
    }

    async fn start(&self, container_ref: &ContainerRef) -> Result<(), RuntimeError> {
        if self.containers.lock().await.contains_key(&container_ref.0) {
            Ok(())
        } else {
            Err(RuntimeError::NotFound(container_ref.0.clone()))
        }
    }

    async fn exec_pty(
        &self,
        container_ref: &ContainerRef,
        _argv: &[String],
        _env: &[(String, String)],
        initial_size: PtySize,
    ) -> Result<Pty, RuntimeError> {
        if !self.containers.lock().await.contains_key(&container_ref.0) {
            return Err(RuntimeError::NotFound(container_ref.0.clone()));
        }

        let (client_side, shell_side) = tokio::io::duplex(64 * 1024);
        let (shell_read, shell_write) = tokio::io::split(shell_side);
        let size = Arc::new(Mutex::new(initial_size));

        tokio::spawn(run_shell_emulator(shell_read, shell_write, Arc::clone(&size)));

        let (reader, writer) = tokio::io::split(client_side);
        let control = Arc::new(FakePtyControl { size });

        Ok(Pty { reader: Box::pin(reader), writer: Box::pin(writer), control })
    }

    async fn stop(&self, container_ref: &ContainerRef, _grace: Duration) -> Result<(), RuntimeError> {
        let guard = self.containers.lock().await;
        match guard.get(&container_ref.0) {
            Some(c) => {
                c.live.store(false, Ordering::SeqCst);
                Ok(())
            }
            None => Err(RuntimeError::NotFound(container_ref.0.clone())),
        }
    }

    async fn remove(&self, container_ref: &ContainerRef, _force: bool) -> Result<(), RuntimeError> {
        self.containers.lock().await.remove(&container_ref.0);
        Ok(())
    }

    async fn is_live(&self, container_ref: &ContainerRef) -> bool {
        self.containers
            .lock()
            .await
            .get(&container_ref.0)
            .map(|c| c.live.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

struct FakePtyControl {
    size: Arc<Mutex<PtySize>>,
}

#[async_trait]
impl PtyControl for FakePtyControl {
    async fn resize(&self, size: PtySize) -> Result<(), RuntimeError> {
        if size.cols == 0 || size.rows == 0 {
            return Err(RuntimeError::ExecFailed("resize with zero dimension".to_owned()));
        }
        *self.size.lock().await = size;
        Ok(())
    }

    async fn signal(&self, _signal: nix::sys::signal::Signal) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn close(&self) {}
}

/// Minimal line-oriented shell: echoes unrecognized input verbatim with a
/// trailing `\r\n`, and special-cases the handful of commands the spec's
/// end-to-end scenarios (§8 S1/S2/S5) send.
async fn run_shell_emulator(
    mut read_half: tokio::io::ReadHalf<tokio::io::DuplexStream>,
    mut write_half: tokio::io::WriteHalf<tokio::io::DuplexStream>,
    size: Arc<Mutex<PtySize>>,
) {
    let next_pid = AtomicU32::new(4200);
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = match read_half.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);

        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            let response = handle_line(line, &size, &next_pid).await;
            if write_half.write_all(response.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

async fn handle_line(line: &str, size: &Arc<Mutex<PtySize>>, next_pid: &AtomicU32) -> String {
    if let Some(rest) = line.strip_prefix("echo ") {
        return format!("{rest}\r\n");
    }
    if line == "stty size" {
        let size = *size.lock().await;
        return format!("{} {}\r\n", size.rows, size.cols);
    }
    if let Some(rest) = line.strip_prefix("sleep ") {
        if let Some((_, echo_pid)) = rest.split_once("& echo $!") {
            let _ = echo_pid;
            let pid = next_pid.fetch_add(1, Ordering::Relaxed);
            return format!("{pid}\r\n");
        }
    }
    if let Some(rest) = line.strip_prefix("kill -0 ") {
        if let Some((_pid, _)) = rest.split_once("; echo $?") {
            return "0\r\n".to_owned();
        }
    }
    if line.is_empty() {
        return String::new();
    }
    format!("{line}\r\n")
}

#[cfg(test)]
#[path = "fake_tests.rs"]
mod tests;
