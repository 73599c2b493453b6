// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::atomic::Ordering;

use super::*;
use crate::registry::{CapabilityStore, HeartbeatReport, Liveness, MemoryStore, Reliability};
use crate::test_support::{memory_registry, registration, registry_with, test_policy, FlakyStore};

fn liveness(registry: &Registry, id: &str) -> Option<Liveness> {
    registry.get(id).ok().flatten().map(|r| r.liveness)
}

#[tokio::test(start_paused = true)]
async fn silent_agent_is_demoted_within_one_sweep() -> anyhow::Result<()> {
    let registry = memory_registry();
    registry.register(registration("quiet", "http://quiet:8000", &["m1"]))?;
    registry.register(registration("chatty", "http://chatty:8000", &["m1"]))?;
    let shutdown = CancellationToken::new();
    let handle =
        spawn_sweeper(Arc::clone(&registry), Duration::from_secs(1), Duration::ZERO, shutdown.clone());

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(900)).await;
        registry.heartbeat("chatty", &HeartbeatReport::default())?;
    }

    // 3.6s of silence against a 3s stale timeout and 1s sweep period.
    assert_eq!(liveness(&registry, "quiet"), Some(Liveness::Offline));
    assert_eq!(liveness(&registry, "chatty"), Some(Liveness::Online));

    shutdown.cancel();
    handle.await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn reliability_halves_each_half_life() -> anyhow::Result<()> {
    let registry = memory_registry();
    registry.register(registration("a1", "http://a1:8000", &["m1"]))?;
    for _ in 0..8 {
        registry.record_outcome("a1", true)?;
    }
    let shutdown = CancellationToken::new();
    let handle = spawn_sweeper(
        Arc::clone(&registry),
        Duration::from_secs(1),
        Duration::from_secs(2),
        shutdown.clone(),
    );

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    let rec = registry.get("a1")?.map(|r| r.reliability);
    assert_eq!(rec, Some(Reliability { successes: 4, failures: 0 }));

    shutdown.cancel();
    handle.await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn shutdown_flushes_reliability_to_disk() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("registry.json");
    let registry = registry_with(Arc::new(MemoryStore::open(&path)?), test_policy());
    registry.register(registration("a1", "http://a1:8000", &["m1"]))?;
    registry.record_outcome("a1", false)?;

    let shutdown = CancellationToken::new();
    let handle =
        spawn_sweeper(Arc::clone(&registry), Duration::from_secs(1), Duration::ZERO, shutdown.clone());
    shutdown.cancel();
    handle.await?;

    let restored = MemoryStore::open(&path)?;
    let rec = restored.get("a1")?.map(|r| r.reliability);
    assert_eq!(rec, Some(Reliability { successes: 0, failures: 1 }));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn sweep_tick_settles_deferred_releases() -> anyhow::Result<()> {
    let store = Arc::new(FlakyStore::default());
    let registry = registry_with(store.clone(), test_policy());
    registry.register(registration("a1", "http://a1:8000", &["m1"]))?;
    registry.adjust_load("a1", 1)?;
    store.fail_writes.store(true, Ordering::SeqCst);
    assert!(registry.release_load("a1").is_err());
    store.fail_writes.store(false, Ordering::SeqCst);

    let shutdown = CancellationToken::new();
    let handle =
        spawn_sweeper(Arc::clone(&registry), Duration::from_millis(500), Duration::ZERO, shutdown.clone());
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(registry.deferred_releases(), 0);
    assert_eq!(registry.get("a1")?.map(|r| r.load), Some(0));

    shutdown.cancel();
    handle.await?;
    Ok(())
}
