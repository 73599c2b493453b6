// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Streaming relay between a client and the agent holding its reservation.

mod sink;

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::error::{ErrorCode, PoolError};
use crate::registry::{AgentRef, Registry};
use crate::scheduler::Reservation;
use crate::work::{Outcome, RequestStats, WorkRequest};

pub use sink::{EventSink, RelayEvent};

/// Executes reserved work requests against agents.
pub struct Relay {
    client: Client,
    registry: Arc<Registry>,
    stats: Arc<RequestStats>,
    header_timeout: Duration,
    request_timeout: Duration,
    completions_path: String,
}

impl Relay {
    pub fn new(config: &PoolConfig, registry: Arc<Registry>, stats: Arc<RequestStats>) -> Self {
        crate::ensure_crypto_provider();
        let client = Client::builder()
            .connect_timeout(config.header_timeout())
            .build()
            .unwrap_or_default();
        Self {
            client,
            registry,
            stats,
            header_timeout: config.header_timeout(),
            request_timeout: config.request_timeout(),
            completions_path: config.agent_completions_path.clone(),
        }
    }

    /// Run one request to its terminal event.
    ///
    /// Chunks are forwarded in arrival order, followed by exactly one of
    /// `Done`, `Failed`, or `Cancelled`. The reservation is released before
    /// the terminal event is sent. No path retries.
    pub async fn stream<S: EventSink>(
        &self,
        reservation: Reservation,
        mut request: WorkRequest,
        sink: &mut S,
    ) -> Result<Outcome, PoolError> {
        let agent = reservation.agent().clone();
        let result = if request.assigned() == Some(agent.id.as_str()) {
            request.mark_streaming();
            self.pump(&agent, &request, sink).await
        } else {
            Err(PoolError::new(
                ErrorCode::Internal,
                format!("request {} is not assigned to agent {}", request.id(), agent.id),
            ))
        };

        if let Err(e) = reservation.release() {
            tracing::warn!(agent_id = %agent.id, err = %e, "failed to release reservation");
        }

        let charged = match result {
            Ok(Outcome::Completed) => Some(true),
            Err(ref e) if e.code.counts_against_agent() => Some(false),
            _ => None,
        };
        if let Some(success) = charged {
            if let Err(e) = self.registry.record_outcome(&agent.id, success) {
                tracing::warn!(agent_id = %agent.id, err = %e, "failed to record reliability");
            }
        }

        let terminal = match result {
            Ok(Outcome::Completed) => RelayEvent::Done,
            Ok(Outcome::Cancelled) => RelayEvent::Cancelled,
            Err(ref e) => RelayEvent::Failed(e.clone()),
        };
        let _ = sink.send(terminal).await;

        request.finish(&result, &self.stats);
        result
    }

    /// Move bytes from the agent to the sink until the body ends, the
    /// request is cancelled, or a timeout fires.
    async fn pump<S: EventSink>(
        &self,
        agent: &AgentRef,
        request: &WorkRequest,
        sink: &mut S,
    ) -> Result<Outcome, PoolError> {
        let cancel: &CancellationToken = request.cancel_token();
        let deadline = Instant::now() + self.request_timeout;
        let url = format!("{}{}", agent.endpoint, self.completions_path);

        let send = self.client.post(&url).json(request.payload()).send();
        let header_deadline = deadline.min(Instant::now() + self.header_timeout);
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Outcome::Cancelled),
            sent = tokio::time::timeout_at(header_deadline, send) => match sent {
                Err(_) => {
                    return Err(PoolError::new(
                        ErrorCode::AgentTimeout,
                        format!("agent {} did not respond within {}ms", agent.id, self.header_timeout.as_millis()),
                    ));
                }
                Ok(Err(e)) => {
                    return Err(PoolError::new(
                        ErrorCode::AgentFailed,
                        format!("agent {} unreachable: {e}", agent.id),
                    ));
                }
                Ok(Ok(resp)) => resp,
            },
        };

        let status = response.status();
        if !status.is_success() {
            return Err(PoolError::new(
                ErrorCode::AgentFailed,
                format!("agent {} answered {status}", agent.id),
            ));
        }

        let mut body = response.bytes_stream();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Outcome::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Err(self.overran(agent)),
                next = body.next() => next,
            };
            let chunk = match next {
                Some(Ok(chunk)) if chunk.is_empty() => continue,
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    return Err(PoolError::new(
                        ErrorCode::AgentFailed,
                        format!("agent {} stream broke: {e}", agent.id),
                    ));
                }
                None => return Ok(Outcome::Completed),
            };

            // A slow client only backs up this request's buffer.
            let open = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Outcome::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Err(self.overran(agent)),
                open = sink.send(RelayEvent::Chunk(chunk)) => open,
            };
            if !open {
                return Ok(Outcome::Cancelled);
            }
        }
    }

    fn overran(&self, agent: &AgentRef) -> PoolError {
        PoolError::new(
            ErrorCode::AgentTimeout,
            format!("agent {} exceeded the {}ms request timeout", agent.id, self.request_timeout.as_millis()),
        )
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
