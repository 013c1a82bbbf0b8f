// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Production [`ContainerRuntime`] backed by the Docker Engine API via `bollard`.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, RemoveContainerOptions,
    ResizeContainerTtyOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::TryStreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tokio_util::sync::PollSender;
use tracing::{debug, warn};

use super::{ContainerRef, ContainerRuntime, Pty, PtyControl, PtySize, RuntimeError, SecurityProfile};
use crate::model::ResourceLimits;

/// Docker-backed adapter. One instance is shared across all sessions.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the configured Docker Engine endpoint, falling back to the
    /// platform default (local Unix socket, or `npipe` on Windows).
    pub fn connect(docker_host: Option<&str>) -> Result<Self, RuntimeError> {
        let docker = match docker_host {
            Some(host) => Docker::connect_with_socket(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| RuntimeError::RuntimeUnavailable(e.to_string()))?,
            None => Docker::connect_with_local_defaults()
                .map_err(|e| RuntimeError::RuntimeUnavailable(e.to_string()))?,
        };
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        let options = CreateImageOptions { from_image: image, ..Default::default() };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream
            .try_next()
            .await
            .map_err(|e| RuntimeError::ImageUnavailable(format!("{image}: {e}")))?
        {
            debug!(?progress, image, "pulling image");
        }
        Ok(())
    }

    async fn create(
        &self,
        image: &str,
        limits: ResourceLimits,
        env: &[(String, String)],
        cmd: &[String],
    ) -> Result<ContainerRef, RuntimeError> {
        let mut full_env = SecurityProfile::base_env();
        full_env.extend(env.iter().cloned());
        let env_strings: Vec<String> = full_env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let host_config = HostConfig {
            memory: Some(limits.memory_bytes as i64),
            cpu_shares: Some(limits.cpu_shares as i64),
            pids_limit: Some(limits.pids_max as i64),
            cap_drop: Some(SecurityProfile::CAP_DROP.iter().map(|s| s.to_string()).collect()),
            cap_add: Some(SecurityProfile::CAP_ADD.iter().map(|s| s.to_string()).collect()),
            security_opt: Some(vec![SecurityProfile::NO_NEW_PRIVILEGES.to_owned()]),
            network_mode: Some("bridge".to_owned()),
            // Read-only root per §4.1's hardening default; this adapter has
            // no per-image capability probe, so every allow-listed image gets
            // the stricter setting rather than opting in per image.
            readonly_rootfs: Some(true),
            ..Default::default()
        };

        let config = Config {
            image: Some(image.to_owned()),
            env: Some(env_strings),
            cmd: if cmd.is_empty() { None } else { Some(cmd.to_vec()) },
            tty: Some(true),
            open_stdin: Some(true),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions { name: String::new(), platform: None };
        let response = self.docker.create_container(Some(options), config).await.map_err(|e| {
            RuntimeError::ResourceExhausted(format!("create {image}: {e}"))
        })?;
        for warning in response.warnings {
            warn!(image, warning, "container create warning");
        }
        Ok(ContainerRef(response.id))
    }

    async fn start(&self, container_ref: &ContainerRef) -> Result<(), RuntimeError> {
        self.docker
            .start_container::<String>(&container_ref.0, None)
            .await
            .map_err(|e| RuntimeError::RuntimeUnavailable(e.to_string()))
    }

    async fn exec_pty(
        &self,
        container_ref: &ContainerRef,
        argv: &[String],
        env: &[(String, String)],
        initial_size: PtySize,
    ) -> Result<Pty, RuntimeError> {
        let env_strings: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let exec_options = CreateExecOptions {
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(true),
            env: Some(env_strings),
            cmd: Some(argv.to_vec()),
            ..Default::default()
        };

        let created = self
            .docker
            .create_exec(&container_ref.0, exec_options)
            .await
            .map_err(|e| RuntimeError::ExecFailed(e.to_string()))?;

        let started = self
            .docker
            .start_exec(&created.id, Some(StartExecOptions { detach: false, tty: true, output_capacity: None }))
            .await
            .map_err(|e| RuntimeError::ExecFailed(e.to_string()))?;

        let (output, input) = match started {
            StartExecResults::Attached { output, input } => (output, input),
            StartExecResults::Detached => {
                return Err(RuntimeError::ExecFailed("exec started detached".to_owned()));
            }
        };

        let byte_stream = output.map_ok(|chunk| chunk.into_bytes()).map_err(std::io::Error::other);
        let reader: Pin<Box<dyn tokio::io::AsyncRead + Send>> =
            Box::pin(StreamReader::new(byte_stream));

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<WriterCmd>(EXEC_WRITER_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut input = input;
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    WriterCmd::Write(bytes) => {
                        if input.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    WriterCmd::Shutdown => {
                        shutdown_writer(input).await;
                        break;
                    }
                }
            }
        });

        let control = Arc::new(DockerPtyControl {
            docker: self.docker.clone(),
            container_id: container_ref.0.clone(),
            exec_id: created.id,
            cmd_tx: cmd_tx.clone(),
        });
        control.resize(initial_size).await?;

        let writer = ExecWriter { sender: PollSender::new(cmd_tx) };
        Ok(Pty { reader, writer: Box::pin(writer), control })
    }

    async fn stop(&self, container_ref: &ContainerRef, grace: Duration) -> Result<(), RuntimeError> {
        let options = StopContainerOptions { t: grace.as_secs() as i32 };
        self.docker
            .stop_container(&container_ref.0, Some(options))
            .await
            .map_err(|e| RuntimeError::RuntimeUnavailable(e.to_string()))
    }

    async fn remove(&self, container_ref: &ContainerRef, force: bool) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions { force, v: true, ..Default::default() };
        self.docker
            .remove_container(&container_ref.0, Some(options))
            .await
            .map_err(|e| RuntimeError::RuntimeUnavailable(e.to_string()))
    }

    async fn is_live(&self, container_ref: &ContainerRef) -> bool {
        match self.docker.inspect_container(&container_ref.0, None).await {
            Ok(resp) => resp.state.and_then(|s| s.running).unwrap_or(false),
            Err(_) => false,
        }
    }
}

/// Commands accepted by the exec's dedicated writer task, which owns the
/// bollard exec's stdin handle exclusively so both the bridge (writes) and
/// [`DockerPtyControl::close`] (shutdown) can reach it without sharing a lock
/// across an `async fn` boundary.
enum WriterCmd {
    Write(Vec<u8>),
    Shutdown,
}

const EXEC_WRITER_CHANNEL_CAPACITY: usize = 16;

/// [`Pty::writer`] half for the Docker adapter: an `AsyncWrite` facade over
/// the exec writer task's command channel, via [`PollSender`]'s poll-based
/// send so it composes with `tokio::io::AsyncWrite`'s poll methods directly.
struct ExecWriter {
    sender: PollSender<WriterCmd>,
}

impl AsyncWrite for ExecWriter {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match this.sender.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let len = buf.len();
                match this.sender.send_item(WriterCmd::Write(buf.to_vec())) {
                    Ok(()) => Poll::Ready(Ok(len)),
                    Err(_) => Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "exec writer task gone"))),
                }
            }
            Poll::Ready(Err(_)) => {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "exec writer task gone")))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().sender.abort_send();
        Poll::Ready(Ok(()))
    }
}

/// Per-exec control handle: resize via the exec's TTY, signal via the
/// container (exec processes share the container's init signal handling),
/// close by shutting down the exec's stdin.
struct DockerPtyControl {
    docker: Docker,
    container_id: String,
    exec_id: String,
    cmd_tx: mpsc::Sender<WriterCmd>,
}

#[async_trait]
impl PtyControl for DockerPtyControl {
    async fn resize(&self, size: PtySize) -> Result<(), RuntimeError> {
        let options = ResizeContainerTtyOptions { width: size.cols, height: size.rows };
        self.docker
            .resize_exec(&self.exec_id, options)
            .await
            .map_err(|e| RuntimeError::ExecFailed(format!("resize: {e}")))
    }

    async fn signal(&self, signal: nix::sys::signal::Signal) -> Result<(), RuntimeError> {
        let options = KillContainerOptions { signal: signal.as_str().to_owned() };
        self.docker
            .kill_container(&self.container_id, Some(options))
            .await
            .map_err(|e| RuntimeError::RuntimeUnavailable(format!("signal: {e}")))
    }

    async fn close(&self) {
        debug!(exec_id = %self.exec_id, "closing exec stdin via control handle");
        let _ = self.cmd_tx.send(WriterCmd::Shutdown).await;
    }
}

async fn shutdown_writer<W: tokio::io::AsyncWrite + Unpin>(mut w: W) {
    let _ = w.shutdown().await;
}
