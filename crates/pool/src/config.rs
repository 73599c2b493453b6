// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Coordinator for a fleet of independently owned inference agents.
#[derive(Debug, Clone, Parser)]
#[command(name = "gpupool", version, about)]
pub struct PoolConfig {
    /// Host to bind on.
    #[arg(long, default_value = "127.0.0.1", env = "GPUPOOL_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080, env = "GPUPOOL_PORT")]
    pub port: u16,

    /// Bearer token for client completion traffic. If unset, client auth is disabled.
    #[arg(long, env = "GPUPOOL_API_TOKEN")]
    pub api_token: Option<String>,

    /// Bearer token agents present on register/heartbeat. If unset, agent auth is disabled.
    #[arg(long, env = "GPUPOOL_AGENT_TOKEN")]
    pub agent_token: Option<String>,

    /// Bearer token for the admin listing. If unset, the admin surface is closed.
    #[arg(long, env = "GPUPOOL_ADMIN_TOKEN")]
    pub admin_token: Option<String>,

    /// Interval agents are told to heartbeat at, in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "GPUPOOL_HEARTBEAT_INTERVAL_MS")]
    pub heartbeat_interval_ms: u64,

    /// Consecutive missed heartbeats before an agent is marked offline.
    #[arg(long, default_value_t = 3, env = "GPUPOOL_MISSED_HEARTBEATS")]
    pub missed_heartbeats: u32,

    /// Liveness sweep period in milliseconds (0 = heartbeat interval).
    #[arg(long, default_value_t = 0, env = "GPUPOOL_SWEEP_INTERVAL_MS")]
    pub sweep_interval_ms: u64,

    /// Time an agent has to start responding to a relayed request.
    #[arg(long, default_value_t = 30_000, env = "GPUPOOL_HEADER_TIMEOUT_MS")]
    pub header_timeout_ms: u64,

    /// Upper bound on a whole relayed request, headers included.
    #[arg(long, default_value_t = 300_000, env = "GPUPOOL_REQUEST_TIMEOUT_MS")]
    pub request_timeout_ms: u64,

    /// Concurrent requests per agent when the agent does not advertise a bound.
    #[arg(long, default_value_t = 1, env = "GPUPOOL_MAX_CONCURRENT")]
    pub max_concurrent: u32,

    /// Ceiling applied to agent-advertised concurrency bounds.
    #[arg(long, default_value_t = 64, env = "GPUPOOL_MAX_CONCURRENT_CAP")]
    pub max_concurrent_cap: u32,

    /// VRAM (MB) held back from an agent's reported capacity when matching models.
    #[arg(long, default_value_t = 512, env = "GPUPOOL_CAPACITY_MARGIN_MB")]
    pub capacity_margin_mb: u64,

    /// How long a cached fleet snapshot may be served when the store cannot be read.
    #[arg(long, default_value_t = 5_000, env = "GPUPOOL_SNAPSHOT_TTL_MS")]
    pub snapshot_ttl_ms: u64,

    /// Period after which reliability counters are halved.
    #[arg(long, default_value_t = 600_000, env = "GPUPOOL_RELIABILITY_HALF_LIFE_MS")]
    pub reliability_half_life_ms: u64,

    /// Per-request buffer between the relay and a slow client.
    #[arg(long, default_value_t = 32, env = "GPUPOOL_STREAM_BUFFER")]
    pub stream_buffer: usize,

    /// Path requests are relayed to on the agent.
    #[arg(long, default_value = "/v1/completions", env = "GPUPOOL_AGENT_COMPLETIONS_PATH")]
    pub agent_completions_path: String,

    /// How long to keep serving after a shutdown signal so agents hear `drain`.
    #[arg(long, default_value_t = 0, env = "GPUPOOL_DRAIN_GRACE_MS")]
    pub drain_grace_ms: u64,

    /// Path to a JSON model catalog.
    #[arg(long, env = "GPUPOOL_MODELS")]
    pub models: Option<PathBuf>,

    /// Path to the registry snapshot file. If unset, the registry is memory-only.
    #[arg(long, env = "GPUPOOL_STATE_FILE")]
    pub state_file: Option<PathBuf>,

    /// Log filter (tracing EnvFilter syntax).
    #[arg(long, default_value = "info", env = "GPUPOOL_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text or json).
    #[arg(long, default_value = "text", env = "GPUPOOL_LOG_FORMAT")]
    pub log_format: String,
}

impl PoolConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.heartbeat_interval_ms == 0 {
            anyhow::bail!("--heartbeat-interval-ms must be greater than zero");
        }
        if self.missed_heartbeats == 0 {
            anyhow::bail!("--missed-heartbeats must be at least 1");
        }
        if self.header_timeout_ms == 0 || self.request_timeout_ms == 0 {
            anyhow::bail!("relay timeouts must be greater than zero");
        }
        if self.max_concurrent == 0 || self.max_concurrent_cap == 0 {
            anyhow::bail!("concurrency bounds must be at least 1");
        }
        if self.stream_buffer == 0 {
            anyhow::bail!("--stream-buffer must be at least 1");
        }
        if !self.agent_completions_path.starts_with('/') {
            anyhow::bail!("--agent-completions-path must start with '/'");
        }
        match self.log_format.as_str() {
            "text" | "json" => {}
            other => anyhow::bail!("invalid log format: {other}"),
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence after which an agent is presumed offline.
    pub fn stale_timeout(&self) -> Duration {
        self.heartbeat_interval().saturating_mul(self.missed_heartbeats)
    }

    pub fn sweep_interval(&self) -> Duration {
        if self.sweep_interval_ms == 0 {
            self.heartbeat_interval()
        } else {
            Duration::from_millis(self.sweep_interval_ms)
        }
    }

    pub fn header_timeout(&self) -> Duration {
        Duration::from_millis(self.header_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_millis(self.snapshot_ttl_ms)
    }

    pub fn reliability_half_life(&self) -> Duration {
        Duration::from_millis(self.reliability_half_life_ms)
    }

    /// Retry hint handed to clients that hit a saturated fleet.
    pub fn retry_after_secs(&self) -> u64 {
        self.heartbeat_interval().as_secs().max(1)
    }

    /// Load the model catalog, or an empty one when no path is configured.
    pub fn load_catalog(&self) -> anyhow::Result<ModelCatalog> {
        match self.models {
            Some(ref path) => ModelCatalog::load(path),
            None => Ok(ModelCatalog::default()),
        }
    }
}

/// Requirements the coordinator imposes on agents serving a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    #[serde(default)]
    pub capacity_required_mb: u64,
    #[serde(default)]
    pub min_context: u32,
}

/// Operator-maintained model requirements, keyed by model name.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: HashMap<String, ModelSpec>,
}

impl ModelCatalog {
    pub fn new(specs: Vec<ModelSpec>) -> Self {
        Self { models: specs.into_iter().map(|m| (m.name.clone(), m)).collect() }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let specs: Vec<ModelSpec> = serde_json::from_str(&contents)?;
        Ok(Self::new(specs))
    }

    pub fn get(&self, model: &str) -> Option<&ModelSpec> {
        self.models.get(model)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
