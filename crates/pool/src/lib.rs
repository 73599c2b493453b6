// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! gpupool: coordinator for a fleet of independently owned inference agents.

pub mod agent_link;
pub mod config;
pub mod error;
pub mod registry;
pub mod relay;
pub mod scheduler;
pub mod state;
pub mod test_support;
pub mod transport;
pub mod work;

use std::sync::{Arc, Once};

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::PoolConfig;
use crate::registry::sweeper::spawn_sweeper;
use crate::registry::{CapabilityStore, MemoryStore, Registry, RegistryPolicy};
use crate::state::PoolState;
use crate::transport::build_router;

/// Install the ring rustls provider. Safe to call more than once.
pub fn ensure_crypto_provider() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Bind the configured address and serve until SIGINT/SIGTERM.
pub async fn run(config: PoolConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let listener = TcpListener::bind(&addr).await?;
    info!("gpupool listening on {addr}");
    serve(config, listener, shutdown).await
}

/// Serve on an already-bound listener until `shutdown` fires.
///
/// Once `shutdown` is cancelled the coordinator keeps answering for
/// `drain_grace` (heartbeats carry a `drain` command), then stops accepting
/// connections and waits for in-flight requests.
pub async fn serve(
    config: PoolConfig,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    config.validate()?;
    ensure_crypto_provider();

    let catalog = config.load_catalog()?;
    let store: Arc<dyn CapabilityStore> = match config.state_file {
        Some(ref path) => Arc::new(MemoryStore::open(path)?),
        None => Arc::new(MemoryStore::new()),
    };
    let registry =
        Arc::new(Registry::new(store, catalog, RegistryPolicy::from_config(&config)));
    let state = Arc::new(PoolState::new(config.clone(), Arc::clone(&registry), shutdown.clone()));

    let stop = CancellationToken::new();
    let sweeper = spawn_sweeper(
        registry,
        config.sweep_interval(),
        config.reliability_half_life(),
        stop.clone(),
    );
    {
        let stop = stop.clone();
        let grace = config.drain_grace();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            if !grace.is_zero() {
                info!(grace_ms = grace.as_millis() as u64, "draining agents before shutdown");
                tokio::select! {
                    _ = tokio::time::sleep(grace) => {}
                    _ = stop.cancelled() => {}
                }
            }
            stop.cancel();
        });
    }

    let router = build_router(state);
    let result = axum::serve(listener, router)
        .with_graceful_shutdown(stop.clone().cancelled_owned())
        .await;

    stop.cancel();
    let _ = sweeper.await;
    info!("gpupool stopped");
    result?;
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGTERM");
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGINT");
            }
        }
        shutdown.cancel();
    });
}
