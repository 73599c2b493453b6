// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Capability store: the transactional table of agent records.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};

use crate::error::{ErrorCode, PoolError};
use crate::registry::agent::{AgentId, AgentRecord};
use crate::registry::persist::{self, PersistedAgent, PersistedRegistry};

/// Atomic read/update access to agent records.
///
/// Every mutation is a single transaction: `update` hands the closure a copy
/// of the record and commits it only if the closure returns `Ok`, so readers
/// never observe a half-applied change and a failed transaction leaves the
/// record untouched.
pub trait CapabilityStore: Send + Sync {
    /// Insert or replace a record. `build` sees the current record, if any.
    fn upsert(
        &self,
        id: &str,
        build: &mut dyn FnMut(Option<&AgentRecord>) -> AgentRecord,
    ) -> Result<AgentRecord, PoolError>;

    /// Transactionally mutate one record. Fails with `UnknownAgent` if absent.
    fn update(
        &self,
        id: &str,
        tx: &mut dyn FnMut(&mut AgentRecord) -> Result<(), PoolError>,
    ) -> Result<AgentRecord, PoolError>;

    fn get(&self, id: &str) -> Result<Option<AgentRecord>, PoolError>;

    /// Consistent-per-record copy of every agent, in registration order.
    fn snapshot(&self) -> Result<Vec<AgentRecord>, PoolError>;

    fn ids(&self) -> Result<Vec<AgentId>, PoolError>;

    /// Write any durable state. No-op for purely in-memory stores.
    fn flush(&self) -> Result<(), PoolError> {
        Ok(())
    }
}

pub(crate) fn unknown_agent(id: &str) -> PoolError {
    PoolError::new(ErrorCode::UnknownAgent, format!("agent {id} is not registered"))
}

/// Arena of agent records with per-record locks.
///
/// Record mutexes are only taken while the arena read lock is held, so an
/// arena write lock (upsert) implies no record is locked by anyone else.
///
/// Snapshot writes are serialized by `persist_gate` and never hold the arena
/// lock across disk I/O: routing reads, heartbeats and load changes keep
/// running while a registration is being written out.
pub struct MemoryStore {
    records: RwLock<IndexMap<AgentId, Arc<Mutex<AgentRecord>>>>,
    snapshot_path: Option<PathBuf>,
    persist_gate: Mutex<()>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { records: RwLock::new(IndexMap::new()), snapshot_path: None, persist_gate: Mutex::new(()) }
    }

    /// Open a store backed by a snapshot file, restoring any agents found.
    ///
    /// Restored agents are offline until they heartbeat.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let mut records = IndexMap::new();
        if path.exists() {
            let persisted = persist::load(path)?;
            for agent in persisted.agents {
                let rec = agent.into_record();
                records.insert(rec.id.clone(), Arc::new(Mutex::new(rec)));
            }
            tracing::info!(path = %path.display(), agents = records.len(), "restored registry snapshot");
        }
        Ok(Self {
            records: RwLock::new(records),
            snapshot_path: Some(path.to_owned()),
            persist_gate: Mutex::new(()),
        })
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Copy the durable view of the arena, substituting `pending` for its
    /// stored counterpart (or appending it when new).
    fn stage(&self, pending: Option<&AgentRecord>) -> PersistedRegistry {
        let records = self.records.read();
        let mut agents: Vec<PersistedAgent> = Vec::with_capacity(records.len() + 1);
        let mut replaced = false;
        for (id, slot) in records.iter() {
            match pending {
                Some(rec) if rec.id == *id => {
                    agents.push(PersistedAgent::from(rec));
                    replaced = true;
                }
                _ => agents.push(PersistedAgent::from(&*slot.lock())),
            }
        }
        if let (Some(rec), false) = (pending, replaced) {
            agents.push(PersistedAgent::from(rec));
        }
        PersistedRegistry { agents }
    }

    fn write(path: &Path, staged: &PersistedRegistry) -> Result<(), PoolError> {
        persist::save(path, staged).map_err(|e| {
            PoolError::new(ErrorCode::StoreUnavailable, format!("failed to persist registry: {e}"))
        })
    }
}

impl CapabilityStore for MemoryStore {
    /// With a snapshot file the record is written out before it is committed,
    /// so a failed write leaves the arena unchanged. Upserts are serialized
    /// by the persist gate; `build` runs once to stage and again to commit
    /// against whatever the record holds by then.
    fn upsert(
        &self,
        id: &str,
        build: &mut dyn FnMut(Option<&AgentRecord>) -> AgentRecord,
    ) -> Result<AgentRecord, PoolError> {
        let _gate = self.persist_gate.lock();
        if let Some(ref path) = self.snapshot_path {
            let current = self.get(id)?;
            let staged = self.stage(Some(&build(current.as_ref())));
            Self::write(path, &staged)?;
        }

        let mut records = self.records.write();
        match records.get(id) {
            Some(slot) => {
                let mut current = slot.lock();
                let next = build(Some(&*current));
                *current = next.clone();
                Ok(next)
            }
            None => {
                let next = build(None);
                records.insert(id.to_owned(), Arc::new(Mutex::new(next.clone())));
                Ok(next)
            }
        }
    }

    fn update(
        &self,
        id: &str,
        tx: &mut dyn FnMut(&mut AgentRecord) -> Result<(), PoolError>,
    ) -> Result<AgentRecord, PoolError> {
        let records = self.records.read();
        let slot = records.get(id).ok_or_else(|| unknown_agent(id))?;
        let mut current = slot.lock();
        let mut next = current.clone();
        tx(&mut next)?;
        *current = next.clone();
        Ok(next)
    }

    fn get(&self, id: &str) -> Result<Option<AgentRecord>, PoolError> {
        let records = self.records.read();
        Ok(records.get(id).map(|slot| slot.lock().clone()))
    }

    fn snapshot(&self) -> Result<Vec<AgentRecord>, PoolError> {
        let records = self.records.read();
        Ok(records.values().map(|slot| slot.lock().clone()).collect())
    }

    fn ids(&self) -> Result<Vec<AgentId>, PoolError> {
        Ok(self.records.read().keys().cloned().collect())
    }

    fn flush(&self) -> Result<(), PoolError> {
        let Some(ref path) = self.snapshot_path else {
            return Ok(());
        };
        let _gate = self.persist_gate.lock();
        Self::write(path, &self.stage(None))
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
