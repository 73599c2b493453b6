// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent selection: filter, rank, reserve.

mod reservation;

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{ErrorCode, PoolError};
use crate::registry::{AgentRef, Registry};
use crate::work::WorkRequest;

pub use reservation::Reservation;

/// Picks an agent per request and reserves one unit of its capacity.
///
/// Holds no fleet state of its own beyond a per-model rotation counter used
/// to spread traffic across equally ranked agents.
pub struct Scheduler {
    registry: Arc<Registry>,
    rotation: Mutex<HashMap<String, u64>>,
    retry_after_secs: u64,
}

impl Scheduler {
    pub fn new(registry: Arc<Registry>, retry_after_secs: u64) -> Self {
        Self { registry, rotation: Mutex::new(HashMap::new()), retry_after_secs }
    }

    /// Reserve capacity on the best available agent for `model`.
    pub fn select(&self, model: &str) -> Result<Reservation, PoolError> {
        self.registry.settle_releases();
        let mut candidates = self.registry.query_capable(model)?;
        if candidates.is_empty() {
            return Err(self.nothing_online(model)?);
        }

        rank(&mut candidates, self.next_turn(model));

        for agent in candidates {
            match self.registry.adjust_load(&agent.id, 1) {
                Ok(load) => {
                    debug!(model, agent_id = %agent.id, load, "reserved agent");
                    let agent = AgentRef { load, ..agent };
                    return Ok(Reservation::new(Arc::clone(&self.registry), agent));
                }
                // Lost a race with another selection, a sweep, or a drain.
                Err(e) if is_skippable(e.code) => {
                    debug!(model, agent_id = %agent.id, code = %e.code, "candidate rejected reservation");
                }
                Err(e) => return Err(e),
            }
        }

        warn!(model, "every capable agent is at capacity");
        Err(self.no_available(model))
    }

    /// Select an agent and record it as the request's assignment.
    pub fn select_for(&self, request: &mut WorkRequest) -> Result<Reservation, PoolError> {
        let reservation = self.select(request.model())?;
        request.assign(&reservation.agent().id)?;
        Ok(reservation)
    }

    fn nothing_online(&self, model: &str) -> Result<PoolError, PoolError> {
        if self.registry.any_capable(model)? {
            warn!(model, "capable agents exist but none are online");
            Ok(self.no_available(model))
        } else {
            Ok(PoolError::new(
                ErrorCode::NoCapableAgents,
                format!("no registered agent can serve model {model}"),
            ))
        }
    }

    fn no_available(&self, model: &str) -> PoolError {
        PoolError::new(ErrorCode::NoAvailableAgents, format!("no agent available for model {model}"))
            .with_retry_after(self.retry_after_secs)
    }

    fn next_turn(&self, model: &str) -> u64 {
        let mut rotation = self.rotation.lock();
        let turn = rotation.entry(model.to_owned()).or_insert(0);
        let current = *turn;
        *turn = turn.wrapping_add(1);
        current
    }
}

fn is_skippable(code: ErrorCode) -> bool {
    matches!(code, ErrorCode::CapacityExceeded | ErrorCode::AgentOffline | ErrorCode::UnknownAgent)
}

/// Order candidates by reliability (desc), then load (asc). Agents that tie
/// on both are rotated by `turn` so repeated selections take turns.
pub fn rank(candidates: &mut [AgentRef], turn: u64) {
    candidates.sort_by(|a, b| {
        (Reverse(a.score), a.load, &a.id).cmp(&(Reverse(b.score), b.load, &b.id))
    });

    let mut start = 0;
    while start < candidates.len() {
        let key = (candidates[start].score, candidates[start].load);
        let end = candidates[start..]
            .iter()
            .position(|c| (c.score, c.load) != key)
            .map_or(candidates.len(), |n| start + n);
        let group = &mut candidates[start..end];
        let shift = (turn % group.len() as u64) as usize;
        group.rotate_left(shift);
        start = end;
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
