// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use crate::error::PoolError;
use crate::registry::{AgentRef, Registry};

/// One unit of load held on an agent for an in-flight request.
///
/// The matching decrement runs exactly once: either through [`release`]
/// or, if the holder is dropped or its task aborted, from `Drop`.
///
/// [`release`]: Reservation::release
#[must_use = "dropping a reservation releases it immediately"]
pub struct Reservation {
    registry: Arc<Registry>,
    agent: AgentRef,
    released: bool,
}

impl Reservation {
    /// Wrap a load increment that has already been applied.
    pub(crate) fn new(registry: Arc<Registry>, agent: AgentRef) -> Self {
        Self { registry, agent, released: false }
    }

    /// The agent as it looked when the reservation was taken.
    pub fn agent(&self) -> &AgentRef {
        &self.agent
    }

    /// Give the load back. Returns the agent's load afterwards.
    ///
    /// On a store failure the decrement is handed to the registry's deferred
    /// queue rather than lost; the error only reports that it did not land yet.
    pub fn release(mut self) -> Result<u32, PoolError> {
        self.released = true;
        self.registry.release_load(&self.agent.id)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.registry.release_load(&self.agent.id) {
            tracing::warn!(agent_id = %self.agent.id, err = %e, "failed to release reservation");
        }
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("agent", &self.agent.id)
            .field("released", &self.released)
            .finish()
    }
}
