// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process entry point: wires every component together and serves the HTTP
//! surface until shutdown, per §9's "single binary, single process" note.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::aes::{AnonymitySupervisor, ProxySpawner, SubprocessSpawner};
use crate::config::Config;
use crate::runtime::docker::DockerRuntime;
use crate::runtime::fake::FakeRuntime;
use crate::runtime::ContainerRuntime;
use crate::session::SessionManager;
use crate::state::AppState;
use crate::store::MetadataStore;

/// Build every component, reconcile crash recovery, and serve until the
/// process receives a shutdown signal.
pub async fn run(config: Config) -> anyhow::Result<()> {
    init_tracing(&config);
    let config = Arc::new(config);

    let store = Arc::new(MetadataStore::open(&config.db_path)?);

    let runtime: Arc<dyn ContainerRuntime> = if config.uses_fake_runtime() {
        info!("using fake container runtime (test profile)");
        Arc::new(FakeRuntime::new())
    } else {
        Arc::new(DockerRuntime::connect(config.docker_host.as_deref())?)
    };

    let session_manager =
        Arc::new(SessionManager::new(Arc::clone(&store), Arc::clone(&runtime), Arc::clone(&config)));
    session_manager.reconcile_crash_recovery().await?;

    let spawner: Arc<dyn ProxySpawner> = Arc::new(SubprocessSpawner::new(config.anon_proxy_argv()));
    let aes = AnonymitySupervisor::new(spawner, Arc::clone(&store), config.anon_socks_port);
    if config.anon_enabled_default {
        if let Err(err) = aes.enable().await {
            tracing::warn!(%err, "failed to auto-enable anonymizing egress proxy at startup");
        }
    }

    let state = Arc::new(AppState::new(
        Arc::clone(&config),
        Arc::clone(&store),
        Arc::clone(&runtime),
        Arc::clone(&session_manager),
        Arc::clone(&aes),
    ));

    let shutdown = CancellationToken::new();
    tokio::spawn(Arc::clone(&session_manager).run_sweeper(shutdown.child_token()));
    tokio::spawn(Arc::clone(&aes).run_crash_probe(
        std::time::Duration::from_secs(config.anon_crash_probe_interval_secs),
        shutdown.child_token(),
    ));

    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        shutdown_signal.cancel();
    });

    let router = crate::transport::build_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "termbroker listening");

    axum::serve(listener, router).with_graceful_shutdown(shutdown.cancelled_owned()).await?;

    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_format == "json" {
        subscriber.json().init();
    } else {
        subscriber.pretty().init();
    }
}
