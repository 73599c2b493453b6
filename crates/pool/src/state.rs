// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::registry::Registry;
use crate::relay::Relay;
use crate::scheduler::Scheduler;
use crate::work::RequestStats;

/// Shared coordinator state handed to every HTTP handler.
pub struct PoolState {
    pub config: PoolConfig,
    pub registry: Arc<Registry>,
    pub scheduler: Scheduler,
    pub relay: Relay,
    pub stats: Arc<RequestStats>,
    pub shutdown: CancellationToken,
    pub started_at: Instant,
}

impl PoolState {
    pub fn new(config: PoolConfig, registry: Arc<Registry>, shutdown: CancellationToken) -> Self {
        let stats = Arc::new(RequestStats::default());
        let scheduler = Scheduler::new(Arc::clone(&registry), config.retry_after_secs());
        let relay = Relay::new(&config, Arc::clone(&registry), Arc::clone(&stats));
        Self { config, registry, scheduler, relay, stats, shutdown, started_at: Instant::now() }
    }
}

/// Return current epoch millis.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
