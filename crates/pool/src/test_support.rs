// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure: builders, a flaky store, and a scripted fake agent.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use clap::Parser;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::config::{ModelCatalog, PoolConfig};
use crate::error::{ErrorCode, PoolError};
use crate::registry::{
    AgentId, AgentRecord, Capability, CapabilityStore, Hardware, MemoryStore, Registration,
    Registry, RegistryPolicy,
};
use crate::state::PoolState;

/// Config with short intervals suitable for tests. No auth tokens.
pub fn test_config() -> PoolConfig {
    PoolConfig::parse_from([
        "gpupool",
        "--port",
        "0",
        "--heartbeat-interval-ms",
        "1000",
        "--missed-heartbeats",
        "3",
        "--header-timeout-ms",
        "500",
        "--request-timeout-ms",
        "2000",
        "--reliability-half-life-ms",
        "0",
    ])
}

pub fn test_policy() -> RegistryPolicy {
    RegistryPolicy::from_config(&test_config())
}

/// A 24 GB agent serving each model at 4 GB / 4k context.
pub fn registration(name: &str, endpoint: &str, models: &[&str]) -> Registration {
    Registration {
        agent_id: Some(name.to_owned()),
        name: name.to_owned(),
        endpoint: endpoint.to_owned(),
        hardware: Hardware {
            gpu_vendor: "nvidia".to_owned(),
            gpu_model: "rtx-4090".to_owned(),
            vram_mb: 24_000,
            platform: "linux".to_owned(),
        },
        models: models
            .iter()
            .map(|m| Capability {
                model: (*m).to_owned(),
                quantization: Some("q4_k_m".to_owned()),
                context_length: 4096,
                capacity_required_mb: 4_000,
            })
            .collect(),
        max_concurrent: None,
    }
}

pub fn registry_with(store: Arc<dyn CapabilityStore>, policy: RegistryPolicy) -> Arc<Registry> {
    Arc::new(Registry::new(store, ModelCatalog::default(), policy))
}

pub fn memory_registry() -> Arc<Registry> {
    registry_with(Arc::new(MemoryStore::new()), test_policy())
}

/// Coordinator state over an in-memory registry.
pub fn test_state(config: PoolConfig) -> Arc<PoolState> {
    let registry = registry_with(Arc::new(MemoryStore::new()), RegistryPolicy::from_config(&config));
    Arc::new(PoolState::new(config, registry, CancellationToken::new()))
}

/// Serve the full router on a random port for integration testing.
///
/// Returns the bound address and a join handle for the server task.
pub async fn spawn_http_server(
    state: Arc<PoolState>,
) -> anyhow::Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>)> {
    let router = crate::transport::build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    Ok((addr, handle))
}

/// A [`MemoryStore`] whose reads and writes can be made to fail on demand.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    pub fail_reads: AtomicBool,
    pub fail_writes: AtomicBool,
}

impl FlakyStore {
    fn check(&self, flag: &AtomicBool) -> Result<(), PoolError> {
        if flag.load(Ordering::SeqCst) {
            return Err(PoolError::new(ErrorCode::StoreUnavailable, "injected store failure"));
        }
        Ok(())
    }
}

impl CapabilityStore for FlakyStore {
    fn upsert(
        &self,
        id: &str,
        build: &mut dyn FnMut(Option<&AgentRecord>) -> AgentRecord,
    ) -> Result<AgentRecord, PoolError> {
        self.check(&self.fail_writes)?;
        self.inner.upsert(id, build)
    }

    fn update(
        &self,
        id: &str,
        tx: &mut dyn FnMut(&mut AgentRecord) -> Result<(), PoolError>,
    ) -> Result<AgentRecord, PoolError> {
        self.check(&self.fail_writes)?;
        self.inner.update(id, tx)
    }

    fn get(&self, id: &str) -> Result<Option<AgentRecord>, PoolError> {
        self.check(&self.fail_reads)?;
        self.inner.get(id)
    }

    fn snapshot(&self) -> Result<Vec<AgentRecord>, PoolError> {
        self.check(&self.fail_reads)?;
        self.inner.snapshot()
    }

    fn ids(&self) -> Result<Vec<AgentId>, PoolError> {
        self.check(&self.fail_reads)?;
        self.inner.ids()
    }
}

/// How a fake agent answers a relayed request.
#[derive(Debug, Clone)]
pub enum AgentScript {
    /// Stream the chunks with `delay` between them, then end cleanly.
    Complete { chunks: Vec<&'static str>, delay: Duration },
    /// Stream the chunks, then reset the connection.
    Disconnect { chunks: Vec<&'static str>, delay: Duration },
    /// Never send response headers.
    NoHeaders,
    /// Send headers and the chunks, then stall without closing.
    Stall { chunks: Vec<&'static str> },
    /// Answer immediately with a bare status code.
    Status(u16),
}

/// Handle to a running fake agent.
pub struct FakeAgent {
    pub url: String,
    pub hits: Arc<AtomicU32>,
    pub handle: tokio::task::JoinHandle<()>,
}

/// Spawn a fake agent on a random port that answers `POST /v1/completions`
/// according to `script`.
pub async fn spawn_fake_agent(script: AgentScript) -> anyhow::Result<FakeAgent> {
    let hits = Arc::new(AtomicU32::new(0));
    let app = Router::new().route(
        "/v1/completions",
        post({
            let hits = Arc::clone(&hits);
            move || {
                let hits = Arc::clone(&hits);
                let script = script.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    scripted_response(script).await
                }
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(FakeAgent { url: format!("http://{addr}"), hits, handle })
}

async fn scripted_response(script: AgentScript) -> Response {
    match script {
        AgentScript::NoHeaders => {
            std::future::pending::<()>().await;
            StatusCode::OK.into_response()
        }
        AgentScript::Status(code) => {
            StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR).into_response()
        }
        AgentScript::Complete { chunks, delay } => chunked(chunks, delay, Ending::Close),
        AgentScript::Disconnect { chunks, delay } => chunked(chunks, delay, Ending::Reset),
        AgentScript::Stall { chunks } => chunked(chunks, Duration::ZERO, Ending::Stall),
    }
}

enum Ending {
    Close,
    Reset,
    Stall,
}

fn chunked(chunks: Vec<&'static str>, delay: Duration, ending: Ending) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(8);
    tokio::spawn(async move {
        for chunk in chunks {
            if tx.send(Ok(Bytes::from_static(chunk.as_bytes()))).await.is_err() {
                return;
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        match ending {
            Ending::Close => {}
            Ending::Reset => {
                let _ = tx
                    .send(Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "gpu fell over")))
                    .await;
            }
            Ending::Stall => {
                tx.closed().await;
            }
        }
    });
    Response::builder()
        .header("content-type", "text/event-stream")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
