// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Work requests and their terminal-outcome accounting.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ErrorCode, PoolError};
use crate::registry::AgentId;

/// Lifecycle of a single client call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    Pending,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// How a relayed request ended when it did not end in error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Cancelled,
}

/// One client-initiated inference call.
///
/// The assigned agent is set at most once. Failover never reuses a request:
/// [`WorkRequest::resubmit`] makes a fresh one.
#[derive(Debug)]
pub struct WorkRequest {
    id: Uuid,
    model: String,
    payload: serde_json::Value,
    stream: bool,
    cancel: CancellationToken,
    assigned: Option<AgentId>,
    state: RequestState,
    created: Instant,
}

impl WorkRequest {
    pub fn new(
        model: impl Into<String>,
        payload: serde_json::Value,
        stream: bool,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            model: model.into(),
            payload,
            stream,
            cancel,
            assigned: None,
            state: RequestState::Pending,
            created: Instant::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Client body, forwarded to the agent verbatim.
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn is_streaming(&self) -> bool {
        self.stream
    }

    /// Caller-supplied cancellation signal.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn assigned(&self) -> Option<&str> {
        self.assigned.as_deref()
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Record the agent chosen for this request. A second assignment is a bug.
    pub fn assign(&mut self, agent: &str) -> Result<(), PoolError> {
        if let Some(ref current) = self.assigned {
            return Err(PoolError::new(
                ErrorCode::Internal,
                format!("request {} already assigned to {current}", self.id),
            ));
        }
        self.assigned = Some(agent.to_owned());
        Ok(())
    }

    pub fn mark_streaming(&mut self) {
        if self.state == RequestState::Pending {
            self.state = RequestState::Streaming;
        }
    }

    /// Record the terminal outcome. Consumes the request so it happens once.
    pub fn finish(mut self, result: &Result<Outcome, PoolError>, stats: &RequestStats) -> RequestState {
        self.state = match result {
            Ok(Outcome::Completed) => RequestState::Completed,
            Ok(Outcome::Cancelled) => RequestState::Cancelled,
            Err(_) => RequestState::Failed,
        };
        stats.record(result);

        let elapsed_ms = self.created.elapsed().as_millis() as u64;
        let agent_id = self.assigned.as_deref().unwrap_or("-");
        match result {
            Ok(_) => tracing::info!(
                request_id = %self.id,
                model = %self.model,
                agent_id,
                outcome = ?self.state,
                elapsed_ms,
                "request finished"
            ),
            Err(e) => tracing::warn!(
                request_id = %self.id,
                model = %self.model,
                agent_id,
                code = %e.code,
                err = %e.message,
                elapsed_ms,
                "request failed"
            ),
        }
        self.state
    }

    /// A brand-new request for the same call, unassigned and with a new id.
    pub fn resubmit(&self) -> WorkRequest {
        WorkRequest::new(self.model.clone(), self.payload.clone(), self.stream, self.cancel.clone())
    }
}

/// Coordinator-wide request outcome counters.
#[derive(Debug, Default)]
pub struct RequestStats {
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub completed: u64,
    /// Relay failures, timeouts included.
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    /// Requests turned away before any agent was reserved.
    pub rejected: u64,
}

impl RequestStats {
    pub fn record(&self, result: &Result<Outcome, PoolError>) {
        let counter = match result {
            Ok(Outcome::Completed) => &self.completed,
            Ok(Outcome::Cancelled) => &self.cancelled,
            Err(e) => {
                if e.code == ErrorCode::AgentTimeout {
                    self.timed_out.fetch_add(1, Ordering::Relaxed);
                }
                &self.failed
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
#[path = "work_tests.rs"]
mod tests;
