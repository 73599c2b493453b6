// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent records and the registration/heartbeat payloads that mutate them.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{ErrorCode, PoolError};

/// Opaque, stable agent identity.
pub type AgentId = String;

/// Coordinator-side liveness. Two states only; draining is a self-reported flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Online,
    Offline,
}

/// Status an agent reports about itself on each heartbeat.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelfStatus {
    #[default]
    Available,
    /// Informational only; routing follows the coordinator's own load count.
    Busy,
    /// Finish in-flight work, take nothing new.
    #[serde(alias = "degraded")]
    Draining,
}

/// Static hardware descriptor produced by the agent's capability probe.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hardware {
    #[serde(default)]
    pub gpu_vendor: String,
    #[serde(default)]
    pub gpu_model: String,
    #[serde(default)]
    pub vram_mb: u64,
    #[serde(default)]
    pub platform: String,
}

/// One model an agent claims to serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,
    /// Context length the agent serves this model with.
    pub context_length: u32,
    /// VRAM the agent says the model needs.
    #[serde(default)]
    pub capacity_required_mb: u64,
}

/// Registration payload sent by an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    /// Identity from a previous registration; absent on first contact.
    #[serde(default)]
    pub agent_id: Option<AgentId>,
    #[serde(default)]
    pub name: String,
    /// Base URL the coordinator relays work to.
    pub endpoint: String,
    #[serde(default)]
    pub hardware: Hardware,
    pub models: Vec<Capability>,
    #[serde(default)]
    pub max_concurrent: Option<u32>,
}

impl Registration {
    /// Reject capability sets the registry cannot route against.
    pub fn validate(&self) -> Result<(), PoolError> {
        let invalid = |msg: String| Err(PoolError::new(ErrorCode::InvalidCapability, msg));

        if self.models.is_empty() {
            return invalid("capability set is empty".to_owned());
        }
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return invalid(format!("endpoint must be an http(s) URL: {:?}", self.endpoint));
        }
        for (i, cap) in self.models.iter().enumerate() {
            if cap.model.trim().is_empty() {
                return invalid(format!("models[{i}] has an empty model name"));
            }
            if cap.context_length == 0 {
                return invalid(format!("models[{i}] ({}) has zero context length", cap.model));
            }
            let duplicate = self.models[..i]
                .iter()
                .any(|prev| prev.model == cap.model && prev.quantization == cap.quantization);
            if duplicate {
                return invalid(format!("models[{i}] duplicates {}", cap.model));
            }
        }
        Ok(())
    }
}

/// Heartbeat payload.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct HeartbeatReport {
    #[serde(default)]
    pub status: SelfStatus,
    /// Load as the agent sees it. Recorded, never used for accounting.
    #[serde(default)]
    pub current_load: u32,
    /// Fresh hardware probe; replaces the registered descriptor when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<Hardware>,
}

/// Success/failure counters used only to break ranking ties.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reliability {
    pub successes: u64,
    pub failures: u64,
}

impl Reliability {
    /// Laplace-smoothed success ratio in per-mille. A fresh agent scores 500.
    pub fn score(&self) -> u32 {
        let num = self.successes.saturating_add(1).saturating_mul(1000);
        let den = self.successes.saturating_add(self.failures).saturating_add(2);
        u32::try_from(num / den).unwrap_or(1000)
    }

    pub fn record(&mut self, success: bool) {
        if success {
            self.successes = self.successes.saturating_add(1);
        } else {
            self.failures = self.failures.saturating_add(1);
        }
    }

    /// Halve both counters so old history weighs less than recent history.
    pub fn decay(&mut self) {
        self.successes /= 2;
        self.failures /= 2;
    }
}

/// One row of the capability store.
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub id: AgentId,
    pub name: String,
    pub endpoint: String,
    pub hardware: Hardware,
    pub capabilities: Vec<Capability>,
    pub liveness: Liveness,
    /// Coordinator clock time of the last accepted heartbeat or registration.
    pub last_heartbeat: Option<Instant>,
    pub self_status: SelfStatus,
    pub reported_load: u32,
    /// Reservations currently held. Mutated only through `Registry::adjust_load`.
    pub load: u32,
    pub max_concurrent: u32,
    pub reliability: Reliability,
    /// Epoch millis of the first registration.
    pub registered_at_ms: u64,
}

impl AgentRecord {
    /// Whether new work may be reserved on this agent right now.
    pub fn accepts_work(&self) -> bool {
        self.liveness == Liveness::Online && self.self_status != SelfStatus::Draining
    }

    pub fn to_ref(&self) -> AgentRef {
        AgentRef {
            id: self.id.clone(),
            endpoint: self.endpoint.clone(),
            load: self.load,
            max_concurrent: self.max_concurrent,
            score: self.reliability.score(),
        }
    }
}

/// Lightweight view of an agent handed to the scheduler and relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRef {
    pub id: AgentId,
    pub endpoint: String,
    pub load: u32,
    pub max_concurrent: u32,
    pub score: u32,
}

#[cfg(test)]
#[path = "agent_tests.rs"]
mod tests;
