// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Registry snapshot persistence: load/save to a JSON file with atomic writes.
//!
//! Only registration data and reliability history survive a restart. Load,
//! liveness, and heartbeat time are runtime state and always start fresh.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::registry::agent::{
    AgentId, AgentRecord, Capability, Hardware, Liveness, Reliability, SelfStatus,
};

/// Persisted state for all registered agents.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct PersistedRegistry {
    pub agents: Vec<PersistedAgent>,
}

/// Persisted state for a single agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedAgent {
    pub id: AgentId,
    #[serde(default)]
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub hardware: Hardware,
    pub capabilities: Vec<Capability>,
    pub max_concurrent: u32,
    #[serde(default)]
    pub reliability: Reliability,
    #[serde(default)]
    pub registered_at_ms: u64,
}

impl From<&AgentRecord> for PersistedAgent {
    fn from(rec: &AgentRecord) -> Self {
        Self {
            id: rec.id.clone(),
            name: rec.name.clone(),
            endpoint: rec.endpoint.clone(),
            hardware: rec.hardware.clone(),
            capabilities: rec.capabilities.clone(),
            max_concurrent: rec.max_concurrent,
            reliability: rec.reliability,
            registered_at_ms: rec.registered_at_ms,
        }
    }
}

impl PersistedAgent {
    /// Rehydrate as an offline record with no reservations.
    pub fn into_record(self) -> AgentRecord {
        AgentRecord {
            id: self.id,
            name: self.name,
            endpoint: self.endpoint,
            hardware: self.hardware,
            capabilities: self.capabilities,
            liveness: Liveness::Offline,
            last_heartbeat: None,
            self_status: SelfStatus::Available,
            reported_load: 0,
            load: 0,
            max_concurrent: self.max_concurrent.max(1),
            reliability: self.reliability,
            registered_at_ms: self.registered_at_ms,
        }
    }
}

/// Load a persisted registry from a JSON file.
pub fn load(path: &Path) -> anyhow::Result<PersistedRegistry> {
    let contents = std::fs::read_to_string(path)?;
    let registry: PersistedRegistry = serde_json::from_str(&contents)?;
    Ok(registry)
}

/// Save the registry to a JSON file atomically (write tmp + rename).
///
/// Uses a unique temp filename (PID + counter) so concurrent saves never
/// share a `.tmp` file.
pub fn save(path: &Path, registry: &PersistedRegistry) -> anyhow::Result<()> {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let json = serde_json::to_string_pretty(registry)?;
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp_name = format!(
        "{}.{}.{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy(),
        std::process::id(),
        seq,
    );
    let tmp_path = path.with_file_name(tmp_name);
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
