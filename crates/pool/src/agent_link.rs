// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent-side link to the coordinator.
//!
//! Registers on startup (retrying with backoff), heartbeats at the interval
//! the coordinator asks for, and re-registers under the same identity when
//! the coordinator no longer knows it. Commands piggybacked on heartbeat
//! acknowledgements are published on a watch channel.

use std::time::Duration;

use reqwest::StatusCode;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ErrorCode, ErrorResponse};
use crate::registry::{HeartbeatReport, Registration};
use crate::transport::http::{AgentCommand, HeartbeatResponse, RegisterResponse};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Configuration for one agent's link to the coordinator.
#[derive(Debug, Clone)]
pub struct AgentLinkConfig {
    /// Base URL of the coordinator (e.g. `http://10.0.0.2:8080`).
    pub coordinator_url: String,
    /// Agent credential, if the coordinator requires one.
    pub token: Option<String>,
    pub registration: Registration,
}

/// Handle to a running link.
pub struct AgentLink {
    /// Identity confirmed by the coordinator, once registered.
    pub agent_id: watch::Receiver<Option<String>>,
    /// Commands from the most recent heartbeat acknowledgement.
    pub commands: watch::Receiver<Vec<AgentCommand>>,
    pub handle: JoinHandle<()>,
}

/// Spawn the link. `status` is read on every heartbeat.
pub fn spawn(
    config: AgentLinkConfig,
    status: watch::Receiver<HeartbeatReport>,
    shutdown: CancellationToken,
) -> AgentLink {
    let (id_tx, id_rx) = watch::channel(None);
    let (cmd_tx, cmd_rx) = watch::channel(Vec::new());
    let handle = tokio::spawn(run(config, status, id_tx, cmd_tx, shutdown));
    AgentLink { agent_id: id_rx, commands: cmd_rx, handle }
}

enum Beat {
    Ack(HeartbeatResponse),
    /// The coordinator does not know this identity.
    Forgotten,
}

async fn run(
    mut config: AgentLinkConfig,
    status: watch::Receiver<HeartbeatReport>,
    id_tx: watch::Sender<Option<String>>,
    cmd_tx: watch::Sender<Vec<AgentCommand>>,
    shutdown: CancellationToken,
) {
    crate::ensure_crypto_provider();
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_default();
    let base = config.coordinator_url.trim_end_matches('/').to_owned();

    'register: loop {
        let Some(registered) = register_with_backoff(&client, &base, &config, &shutdown).await else {
            return;
        };
        info!(coordinator = %base, agent_id = %registered.agent_id, "registered with coordinator");
        config.registration.agent_id = Some(registered.agent_id.clone());
        id_tx.send_replace(Some(registered.agent_id.clone()));
        let mut interval = Duration::from_millis(registered.heartbeat_interval_ms.max(1));

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.cancelled() => return,
            }
            let report = status.borrow().clone();
            match heartbeat(&client, &base, &config, &registered.agent_id, &report).await {
                Ok(Beat::Ack(ack)) => {
                    interval = Duration::from_millis(ack.next_interval_ms.max(1));
                    if !ack.commands.is_empty() {
                        debug!(commands = ?ack.commands, "coordinator sent commands");
                    }
                    cmd_tx.send_replace(ack.commands);
                }
                Ok(Beat::Forgotten) => {
                    warn!(agent_id = %registered.agent_id, "coordinator forgot this agent, re-registering");
                    continue 'register;
                }
                Err(e) => {
                    debug!(coordinator = %base, err = %e, "heartbeat failed");
                }
            }
        }
    }
}

/// Register, retrying with exponential backoff until it succeeds or
/// `shutdown` fires.
async fn register_with_backoff(
    client: &reqwest::Client,
    base: &str,
    config: &AgentLinkConfig,
    shutdown: &CancellationToken,
) -> Option<RegisterResponse> {
    let mut delay = INITIAL_BACKOFF;
    let mut attempt = 0u32;
    loop {
        if shutdown.is_cancelled() {
            return None;
        }
        attempt += 1;
        match register(client, base, config).await {
            Ok(resp) => return Some(resp),
            Err(e) => {
                debug!(
                    coordinator = %base,
                    attempt,
                    err = %e,
                    "registration attempt failed, retrying in {:?}",
                    delay,
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.cancelled() => return None,
                }
                delay = (delay * 2).min(MAX_BACKOFF);
            }
        }
    }
}

fn apply_auth(req: reqwest::RequestBuilder, config: &AgentLinkConfig) -> reqwest::RequestBuilder {
    match config.token {
        Some(ref token) => req.bearer_auth(token),
        None => req,
    }
}

async fn register(
    client: &reqwest::Client,
    base: &str,
    config: &AgentLinkConfig,
) -> anyhow::Result<RegisterResponse> {
    let req = client.post(format!("{base}/api/v1/agents/register")).json(&config.registration);
    let resp = apply_auth(req, config).send().await?;
    let status = resp.status();
    if !status.is_success() {
        let detail = error_code(resp).await.unwrap_or_else(|| status.to_string());
        anyhow::bail!("registration rejected: {detail}");
    }
    Ok(resp.json().await?)
}

async fn heartbeat(
    client: &reqwest::Client,
    base: &str,
    config: &AgentLinkConfig,
    agent_id: &str,
    report: &HeartbeatReport,
) -> anyhow::Result<Beat> {
    let req = client.post(format!("{base}/api/v1/agents/{agent_id}/heartbeat")).json(report);
    let resp = apply_auth(req, config).send().await?;
    let status = resp.status();
    if status.is_success() {
        return Ok(Beat::Ack(resp.json().await?));
    }
    let code = error_code(resp).await;
    if status == StatusCode::NOT_FOUND && code.as_deref() == Some(ErrorCode::UnknownAgent.as_str()) {
        return Ok(Beat::Forgotten);
    }
    anyhow::bail!("heartbeat rejected: {}", code.unwrap_or_else(|| status.to_string()))
}

async fn error_code(resp: reqwest::Response) -> Option<String> {
    resp.json::<ErrorResponse>().await.ok().map(|body| body.error.code)
}
