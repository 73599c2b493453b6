// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent registry: lifecycle (register, heartbeat, liveness sweep) on top of
//! the capability store, plus capability-filtered queries and bounded load
//! accounting.
//!
//! `current load` is the one field mutated by two components (the scheduler
//! increments, the relay decrements). Both go through [`Registry::adjust_load`],
//! which is a single store transaction, so the capacity bound holds under any
//! interleaving.

pub mod agent;
pub mod persist;
pub mod store;
pub mod sweeper;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ModelCatalog, PoolConfig};
use crate::error::{ErrorCode, PoolError};
use crate::state::epoch_ms;

pub use agent::{
    AgentId, AgentRecord, AgentRef, Capability, Hardware, HeartbeatReport, Liveness, Registration,
    Reliability, SelfStatus,
};
pub use store::{CapabilityStore, MemoryStore};

/// Tunables the registry applies to every agent.
#[derive(Debug, Clone)]
pub struct RegistryPolicy {
    pub heartbeat_interval: Duration,
    pub stale_timeout: Duration,
    pub default_max_concurrent: u32,
    pub max_concurrent_cap: u32,
    pub capacity_margin_mb: u64,
    pub snapshot_ttl: Duration,
}

impl RegistryPolicy {
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            stale_timeout: config.stale_timeout(),
            default_max_concurrent: config.max_concurrent,
            max_concurrent_cap: config.max_concurrent_cap,
            capacity_margin_mb: config.capacity_margin_mb,
            snapshot_ttl: config.snapshot_ttl(),
        }
    }
}

/// Returned to an agent after a successful heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatAck {
    pub next_interval: Duration,
    /// The heartbeat moved the agent from offline back to online.
    pub revived: bool,
}

struct CachedFleet {
    taken_at: Instant,
    records: Arc<Vec<AgentRecord>>,
}

pub struct Registry {
    store: Arc<dyn CapabilityStore>,
    catalog: ModelCatalog,
    policy: RegistryPolicy,
    /// Last good fleet snapshot, served to routing when the store read fails.
    cached: RwLock<Option<CachedFleet>>,
    /// Load decrements that hit a store failure, keyed by agent.
    deferred: Mutex<HashMap<AgentId, u32>>,
}

impl Registry {
    pub fn new(store: Arc<dyn CapabilityStore>, catalog: ModelCatalog, policy: RegistryPolicy) -> Self {
        Self { store, catalog, policy, cached: RwLock::new(None), deferred: Mutex::new(HashMap::new()) }
    }

    pub fn policy(&self) -> &RegistryPolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<dyn CapabilityStore> {
        &self.store
    }

    /// Idempotent upsert. Re-registration replaces the capability set and
    /// marks the agent online with a fresh heartbeat; in-flight load and
    /// reliability history carry over.
    pub fn register(&self, reg: Registration) -> Result<AgentRef, PoolError> {
        reg.validate()?;

        let id = reg
            .agent_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let max_concurrent = reg
            .max_concurrent
            .unwrap_or(self.policy.default_max_concurrent)
            .clamp(1, self.policy.max_concurrent_cap.max(1));
        let endpoint = reg.endpoint.trim_end_matches('/').to_owned();
        let now = Instant::now();

        let mut re_registered = false;
        let rec = self.store.upsert(&id, &mut |existing| {
            re_registered = existing.is_some();
            AgentRecord {
                id: id.clone(),
                name: reg.name.clone(),
                endpoint: endpoint.clone(),
                hardware: reg.hardware.clone(),
                capabilities: reg.models.clone(),
                liveness: Liveness::Online,
                last_heartbeat: Some(now),
                self_status: SelfStatus::Available,
                reported_load: 0,
                load: existing.map_or(0, |e| e.load),
                max_concurrent,
                reliability: existing.map(|e| e.reliability).unwrap_or_default(),
                registered_at_ms: existing.map_or_else(epoch_ms, |e| e.registered_at_ms),
            }
        })?;

        if re_registered {
            info!(agent_id = %rec.id, models = rec.capabilities.len(), "agent re-registered");
        } else {
            info!(
                agent_id = %rec.id,
                name = %rec.name,
                endpoint = %rec.endpoint,
                models = rec.capabilities.len(),
                "agent registered"
            );
        }
        Ok(rec.to_ref())
    }

    /// Record a heartbeat. Unknown identities are rejected so the agent
    /// re-registers instead of the registry inventing state.
    pub fn heartbeat(&self, id: &str, report: &HeartbeatReport) -> Result<HeartbeatAck, PoolError> {
        let now = Instant::now();
        let mut revived = false;
        self.store.update(id, &mut |rec| {
            revived = rec.liveness == Liveness::Offline;
            rec.last_heartbeat = Some(now);
            rec.liveness = Liveness::Online;
            rec.self_status = report.status;
            rec.reported_load = report.current_load;
            if let Some(ref hw) = report.hardware {
                rec.hardware = hw.clone();
            }
            Ok(())
        })?;

        if revived {
            info!(agent_id = %id, "agent back online");
        } else {
            debug!(agent_id = %id, status = ?report.status, "heartbeat");
        }
        Ok(HeartbeatAck { next_interval: self.policy.heartbeat_interval, revived })
    }

    /// Online, non-draining agents that can serve `model`. Unordered.
    pub fn query_capable(&self, model: &str) -> Result<Vec<AgentRef>, PoolError> {
        let fleet = self.fleet()?;
        Ok(fleet
            .iter()
            .filter(|rec| rec.accepts_work() && self.serves(rec, model))
            .map(AgentRecord::to_ref)
            .collect())
    }

    /// Whether any registered agent, online or not, could ever serve `model`.
    pub fn any_capable(&self, model: &str) -> Result<bool, PoolError> {
        let fleet = self.fleet()?;
        Ok(fleet.iter().any(|rec| self.serves(rec, model)))
    }

    /// Atomic bounded load change. An increment past `max_concurrent` fails
    /// with `CapacityExceeded` and leaves the load untouched.
    pub fn adjust_load(&self, id: &str, delta: i32) -> Result<u32, PoolError> {
        let step = delta.unsigned_abs();
        let rec = self.store.update(id, &mut |rec| {
            if delta > 0 {
                if !rec.accepts_work() {
                    return Err(PoolError::new(
                        ErrorCode::AgentOffline,
                        format!("agent {} is not accepting work", rec.id),
                    ));
                }
                let next = rec.load.saturating_add(step);
                if next > rec.max_concurrent {
                    return Err(PoolError::new(
                        ErrorCode::CapacityExceeded,
                        format!("agent {} at capacity ({}/{})", rec.id, rec.load, rec.max_concurrent),
                    ));
                }
                rec.load = next;
            } else {
                if step > rec.load {
                    return Err(PoolError::new(
                        ErrorCode::Internal,
                        format!("load underflow on agent {} ({} - {step})", rec.id, rec.load),
                    ));
                }
                rec.load -= step;
            }
            Ok(())
        })?;
        Ok(rec.load)
    }

    /// Give back one unit of load.
    ///
    /// A store failure does not lose the decrement: it is queued and applied
    /// by [`Registry::settle_releases`], so the error returned here is for
    /// logging only.
    pub fn release_load(&self, id: &str) -> Result<u32, PoolError> {
        match self.adjust_load(id, -1) {
            Ok(load) => Ok(load),
            Err(e) if e.code == ErrorCode::StoreUnavailable => {
                *self.deferred.lock().entry(id.to_owned()).or_insert(0) += 1;
                warn!(agent_id = %id, err = %e, "release deferred until the store recovers");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Apply decrements queued by [`Registry::release_load`]. Returns how
    /// many landed; the rest stay queued if the store is still failing.
    pub fn settle_releases(&self) -> u32 {
        let pending: Vec<(AgentId, u32)> = {
            let mut deferred = self.deferred.lock();
            if deferred.is_empty() {
                return 0;
            }
            deferred.drain().collect()
        };

        let mut settled = 0;
        for (id, count) in pending {
            let step = i32::try_from(count).unwrap_or(i32::MAX);
            match self.adjust_load(&id, -step) {
                Ok(load) => {
                    settled += count;
                    info!(agent_id = %id, released = count, load, "deferred release applied");
                }
                Err(e) if e.code == ErrorCode::StoreUnavailable => {
                    *self.deferred.lock().entry(id).or_insert(0) += count;
                }
                Err(e) => warn!(agent_id = %id, err = %e, "dropping deferred release"),
            }
        }
        settled
    }

    /// Decrements still waiting on the store.
    pub fn deferred_releases(&self) -> u32 {
        self.deferred.lock().values().sum()
    }

    /// Charge a relay outcome to the agent's reliability counters.
    pub fn record_outcome(&self, id: &str, success: bool) -> Result<(), PoolError> {
        self.store.update(id, &mut |rec| {
            rec.reliability.record(success);
            Ok(())
        })?;
        Ok(())
    }

    /// Demote every online agent whose last heartbeat is at least
    /// `stale_timeout` old as of `now`. Returns the demoted identities.
    pub fn sweep(&self, now: Instant) -> Result<Vec<AgentId>, PoolError> {
        let stale = self.policy.stale_timeout;
        let mut demoted = Vec::new();
        for id in self.store.ids()? {
            let mut flipped = false;
            let result = self.store.update(&id, &mut |rec| {
                flipped = false;
                let silent = rec
                    .last_heartbeat
                    .map_or(true, |t| now.saturating_duration_since(t) >= stale);
                if rec.liveness == Liveness::Online && silent {
                    rec.liveness = Liveness::Offline;
                    flipped = true;
                }
                Ok(())
            });
            match result {
                Ok(_) if flipped => demoted.push(id),
                Ok(_) => {}
                Err(e) if e.code == ErrorCode::UnknownAgent => {}
                Err(e) => return Err(e),
            }
        }
        Ok(demoted)
    }

    /// Halve every agent's reliability counters.
    pub fn decay_reliability(&self) -> Result<(), PoolError> {
        for id in self.store.ids()? {
            match self.store.update(&id, &mut |rec| {
                rec.reliability.decay();
                Ok(())
            }) {
                Ok(_) => {}
                Err(e) if e.code == ErrorCode::UnknownAgent => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<AgentRecord>, PoolError> {
        self.store.get(id)
    }

    /// Every registered agent, for introspection.
    pub fn list(&self) -> Result<Vec<AgentRecord>, PoolError> {
        self.store.snapshot()
    }

    /// Read the whole fleet, falling back to a recent cached copy when the
    /// store is unreadable.
    fn fleet(&self) -> Result<Arc<Vec<AgentRecord>>, PoolError> {
        match self.store.snapshot() {
            Ok(records) => {
                let records = Arc::new(records);
                *self.cached.write() =
                    Some(CachedFleet { taken_at: Instant::now(), records: Arc::clone(&records) });
                Ok(records)
            }
            Err(e) => {
                if let Some(cached) = self.cached.read().as_ref() {
                    let age = cached.taken_at.elapsed();
                    if age <= self.policy.snapshot_ttl {
                        warn!(err = %e, age_ms = age.as_millis() as u64, "store read failed, serving cached fleet");
                        return Ok(Arc::clone(&cached.records));
                    }
                }
                Err(e)
            }
        }
    }

    /// Capability match including the VRAM headroom check.
    ///
    /// Zero reported VRAM means unified memory or CPU inference: there is no
    /// discrete budget to check, so only the catalog context floor applies.
    fn serves(&self, rec: &AgentRecord, model: &str) -> bool {
        let spec = self.catalog.get(model);
        let unified = rec.hardware.vram_mb == 0;
        let headroom = rec.hardware.vram_mb.saturating_sub(self.policy.capacity_margin_mb);
        rec.capabilities.iter().filter(|cap| cap.model == model).any(|cap| {
            let required = spec.map_or(cap.capacity_required_mb, |s| s.capacity_required_mb);
            let min_context = spec.map_or(0, |s| s.min_context);
            cap.context_length >= min_context && (unified || headroom > required)
        })
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
