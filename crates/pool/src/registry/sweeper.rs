// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Background liveness sweeper for all registered agents.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::registry::Registry;

/// Spawn a single background task that periodically demotes silent agents.
///
/// The sweep runs on its own timer regardless of request volume and only
/// ever removes eligibility. Reliability counters are halved once per
/// `half_life`, and the store is flushed after every tick that changed
/// durable state.
pub fn spawn_sweeper(
    registry: Arc<Registry>,
    interval: Duration,
    half_life: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_decay = Instant::now();

        tracing::info!(
            interval_ms = interval.as_millis() as u64,
            stale_ms = registry.policy().stale_timeout.as_millis() as u64,
            "liveness sweeper started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }

            registry.settle_releases();

            let now = Instant::now();
            match registry.sweep(now) {
                Ok(demoted) => {
                    for id in &demoted {
                        tracing::warn!(agent_id = %id, "agent missed heartbeats, marked offline");
                    }
                }
                Err(e) => {
                    tracing::warn!(err = %e, "liveness sweep failed");
                    continue;
                }
            }

            if !half_life.is_zero() && now.saturating_duration_since(last_decay) >= half_life {
                last_decay = now;
                if let Err(e) = registry.decay_reliability() {
                    tracing::warn!(err = %e, "reliability decay failed");
                }
                if let Err(e) = registry.store().flush() {
                    tracing::warn!(err = %e, "registry flush failed");
                }
            }
        }

        if let Err(e) = registry.store().flush() {
            tracing::warn!(err = %e, "registry flush on shutdown failed");
        }
        tracing::debug!("liveness sweeper stopped");
    })
}

#[cfg(test)]
#[path = "sweeper_tests.rs"]
mod tests;
