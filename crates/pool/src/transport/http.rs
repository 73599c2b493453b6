// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP handlers for agents, operators, and health checks.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, PoolError};
use crate::registry::{
    AgentRecord, Capability, Hardware, HeartbeatReport, Liveness, Registration, Reliability,
    SelfStatus,
};
use crate::state::PoolState;
use crate::work::StatsSnapshot;

// -- Request/Response types ---------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub agents: usize,
    pub online: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub agent_id: String,
    pub heartbeat_interval_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub acknowledged: bool,
    pub next_interval_ms: u64,
    #[serde(default)]
    pub commands: Vec<AgentCommand>,
}

/// Instructions piggybacked on a heartbeat acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentCommand {
    /// Finish in-flight work and stop accepting more.
    Drain,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: String,
    pub name: String,
    pub endpoint: String,
    pub status: Liveness,
    pub self_status: SelfStatus,
    pub load: u32,
    pub max_concurrent: u32,
    pub reported_load: u32,
    pub reliability: Reliability,
    pub score: u32,
    pub hardware: Hardware,
    pub models: Vec<Capability>,
    /// Milliseconds since the last heartbeat, if one was ever received.
    pub last_heartbeat_ago_ms: Option<u64>,
    pub registered_at_ms: u64,
}

impl From<AgentRecord> for AgentInfo {
    fn from(rec: AgentRecord) -> Self {
        Self {
            score: rec.reliability.score(),
            last_heartbeat_ago_ms: rec.last_heartbeat.map(|t| t.elapsed().as_millis() as u64),
            agent_id: rec.id,
            name: rec.name,
            endpoint: rec.endpoint,
            status: rec.liveness,
            self_status: rec.self_status,
            load: rec.load,
            max_concurrent: rec.max_concurrent,
            reported_load: rec.reported_load,
            reliability: rec.reliability,
            hardware: rec.hardware,
            models: rec.capabilities,
            registered_at_ms: rec.registered_at_ms,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AgentListResponse {
    pub agents: Vec<AgentInfo>,
    pub total: usize,
    pub online: usize,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub requests: StatsSnapshot,
    pub uptime_secs: u64,
}

// -- Handlers -----------------------------------------------------------------

/// `GET /api/v1/health`
pub async fn health(State(s): State<Arc<PoolState>>) -> Result<impl IntoResponse, PoolError> {
    let agents = s.registry.list()?;
    let online = agents.iter().filter(|a| a.liveness == Liveness::Online).count();
    let status = if s.shutdown.is_cancelled() { "draining" } else { "running" };
    Ok(Json(HealthResponse { status: status.to_owned(), agents: agents.len(), online }))
}

/// `POST /api/v1/agents/register`
pub async fn register_agent(
    State(s): State<Arc<PoolState>>,
    Json(req): Json<Registration>,
) -> Result<impl IntoResponse, PoolError> {
    // Registration may write the snapshot file.
    let registry = Arc::clone(&s.registry);
    let agent = tokio::task::spawn_blocking(move || registry.register(req))
        .await
        .map_err(|e| PoolError::new(ErrorCode::Internal, format!("registration task failed: {e}")))??;
    let body = RegisterResponse {
        agent_id: agent.id,
        heartbeat_interval_ms: s.registry.policy().heartbeat_interval.as_millis() as u64,
    };
    Ok((StatusCode::CREATED, Json(body)))
}

/// `POST /api/v1/agents/{id}/heartbeat`
pub async fn heartbeat(
    State(s): State<Arc<PoolState>>,
    Path(id): Path<String>,
    Json(report): Json<HeartbeatReport>,
) -> Result<impl IntoResponse, PoolError> {
    let ack = s.registry.heartbeat(&id, &report)?;
    let mut commands = Vec::new();
    if s.shutdown.is_cancelled() {
        commands.push(AgentCommand::Drain);
    }
    Ok(Json(HeartbeatResponse {
        acknowledged: true,
        next_interval_ms: ack.next_interval.as_millis() as u64,
        commands,
    }))
}

/// `GET /api/v1/admin/agents`
pub async fn list_agents(State(s): State<Arc<PoolState>>) -> Result<impl IntoResponse, PoolError> {
    let agents: Vec<AgentInfo> = s.registry.list()?.into_iter().map(AgentInfo::from).collect();
    let online = agents.iter().filter(|a| a.status == Liveness::Online).count();
    Ok(Json(AgentListResponse { total: agents.len(), online, agents }))
}

/// `GET /api/v1/admin/stats`
pub async fn stats(State(s): State<Arc<PoolState>>) -> impl IntoResponse {
    Json(StatsResponse {
        requests: s.stats.snapshot(),
        uptime_secs: s.started_at.elapsed().as_secs(),
    })
}
