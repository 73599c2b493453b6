// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::atomic::Ordering;

use proptest::prelude::*;

use super::*;
use crate::config::ModelSpec;
use crate::test_support::{memory_registry, registration, registry_with, test_policy, FlakyStore};

fn ids(refs: &[AgentRef]) -> Vec<&str> {
    let mut ids: Vec<&str> = refs.iter().map(|r| r.id.as_str()).collect();
    ids.sort_unstable();
    ids
}

#[tokio::test(start_paused = true)]
async fn register_then_query() -> anyhow::Result<()> {
    let registry = memory_registry();
    let agent = registry.register(registration("a1", "http://a1:8000/", &["llama3-8b"]))?;

    assert_eq!(agent.id, "a1");
    assert_eq!(agent.endpoint, "http://a1:8000");
    assert_eq!(agent.max_concurrent, 1);
    assert_eq!(ids(&registry.query_capable("llama3-8b")?), vec!["a1"]);
    assert!(registry.query_capable("mistral-7b")?.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn register_without_id_mints_one() -> anyhow::Result<()> {
    let registry = memory_registry();
    let mut reg = registration("anon", "http://anon:8000", &["llama3-8b"]);
    reg.agent_id = None;

    let first = registry.register(reg.clone())?;
    assert!(!first.id.is_empty());
    assert_ne!(first.id, "anon");

    reg.agent_id = Some(first.id.clone());
    let again = registry.register(reg)?;
    assert_eq!(again.id, first.id);
    assert_eq!(registry.list()?.len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn reregistration_replaces_capabilities_and_keeps_load() -> anyhow::Result<()> {
    let registry = memory_registry();
    let mut reg = registration("a1", "http://a1:8000", &["llama3-8b"]);
    reg.max_concurrent = Some(4);
    registry.register(reg.clone())?;
    registry.adjust_load("a1", 1)?;
    registry.record_outcome("a1", false)?;

    reg.models = registration("a1", "http://a1:8000", &["mistral-7b"]).models;
    let agent = registry.register(reg)?;

    assert_eq!(agent.load, 1);
    assert!(registry.query_capable("llama3-8b")?.is_empty());
    assert_eq!(ids(&registry.query_capable("mistral-7b")?), vec!["a1"]);
    let rec = registry.get("a1")?.ok_or_else(|| anyhow::anyhow!("missing"))?;
    assert_eq!(rec.reliability.failures, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn advertised_concurrency_is_clamped() -> anyhow::Result<()> {
    let registry = memory_registry();
    let mut reg = registration("a1", "http://a1:8000", &["llama3-8b"]);
    reg.max_concurrent = Some(10_000);
    assert_eq!(registry.register(reg.clone())?.max_concurrent, 64);
    reg.max_concurrent = Some(0);
    assert_eq!(registry.register(reg)?.max_concurrent, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn invalid_capability_set_stores_nothing() -> anyhow::Result<()> {
    let registry = memory_registry();
    let err = registry.register(registration("a1", "http://a1:8000", &[])).err();
    assert_eq!(err.map(|e| e.code), Some(ErrorCode::InvalidCapability));
    assert!(registry.get("a1")?.is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn heartbeat_from_unknown_agent_is_rejected() -> anyhow::Result<()> {
    let registry = memory_registry();
    let err = registry.heartbeat("ghost", &HeartbeatReport::default()).err();
    assert_eq!(err.map(|e| e.code), Some(ErrorCode::UnknownAgent));
    assert!(registry.list()?.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn silent_agent_goes_offline_and_heartbeat_revives() -> anyhow::Result<()> {
    let registry = memory_registry();
    registry.register(registration("a1", "http://a1:8000", &["llama3-8b"]))?;

    tokio::time::advance(Duration::from_millis(2_999)).await;
    assert!(registry.sweep(Instant::now())?.is_empty());

    tokio::time::advance(Duration::from_millis(1)).await;
    assert_eq!(registry.sweep(Instant::now())?, vec!["a1".to_owned()]);
    assert!(registry.query_capable("llama3-8b")?.is_empty());
    assert!(registry.any_capable("llama3-8b")?);
    // Already offline: a second sweep reports nothing new.
    assert!(registry.sweep(Instant::now())?.is_empty());

    let ack = registry.heartbeat("a1", &HeartbeatReport::default())?;
    assert!(ack.revived);
    assert_eq!(ack.next_interval, Duration::from_secs(1));
    assert_eq!(ids(&registry.query_capable("llama3-8b")?), vec!["a1"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn heartbeat_resets_the_stale_clock() -> anyhow::Result<()> {
    let registry = memory_registry();
    registry.register(registration("a1", "http://a1:8000", &["llama3-8b"]))?;

    for _ in 0..5 {
        tokio::time::advance(Duration::from_millis(2_000)).await;
        let ack = registry.heartbeat("a1", &HeartbeatReport::default())?;
        assert!(!ack.revived);
        assert!(registry.sweep(Instant::now())?.is_empty());
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn draining_agent_is_not_eligible() -> anyhow::Result<()> {
    let registry = memory_registry();
    registry.register(registration("a1", "http://a1:8000", &["llama3-8b"]))?;
    registry.heartbeat("a1", &HeartbeatReport { status: SelfStatus::Draining, ..Default::default() })?;

    assert!(registry.query_capable("llama3-8b")?.is_empty());
    let err = registry.adjust_load("a1", 1).err();
    assert_eq!(err.map(|e| e.code), Some(ErrorCode::AgentOffline));

    registry.heartbeat("a1", &HeartbeatReport { status: SelfStatus::Busy, current_load: 3, hardware: None })?;
    assert_eq!(ids(&registry.query_capable("llama3-8b")?), vec!["a1"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn headroom_below_requirement_excludes_agent() -> anyhow::Result<()> {
    let registry = memory_registry();
    let mut reg = registration("small", "http://small:8000", &["llama3-70b"]);
    reg.hardware.vram_mb = 4_400;
    registry.register(reg)?;

    // 4400 - 512 margin leaves 3888 MB, short of the 4000 MB the model needs.
    assert!(registry.query_capable("llama3-70b")?.is_empty());
    assert!(!registry.any_capable("llama3-70b")?);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn zero_vram_agent_skips_headroom_check() -> anyhow::Result<()> {
    let registry = memory_registry();
    let mut reg = registration("mac", "http://mac:8000", &["llama3-8b"]);
    reg.hardware = Hardware { gpu_vendor: "apple".to_owned(), ..Hardware::default() };
    registry.register(reg)?;

    assert_eq!(ids(&registry.query_capable("llama3-8b")?), vec!["mac"]);
    assert!(registry.any_capable("llama3-8b")?);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn heartbeat_refreshes_reported_hardware() -> anyhow::Result<()> {
    let registry = memory_registry();
    registry.register(registration("a1", "http://a1:8000", &["llama3-8b"]))?;
    assert_eq!(registry.query_capable("llama3-8b")?.len(), 1);

    // Another process grabbed most of the card.
    let shrunk = Hardware { vram_mb: 4_096, ..Hardware::default() };
    registry.heartbeat("a1", &HeartbeatReport { hardware: Some(shrunk), ..Default::default() })?;
    assert!(registry.query_capable("llama3-8b")?.is_empty());

    // A heartbeat without a probe keeps the last one.
    registry.heartbeat("a1", &HeartbeatReport::default())?;
    assert_eq!(registry.get("a1")?.map(|r| r.hardware.vram_mb), Some(4_096));

    let freed = Hardware { vram_mb: 24_000, ..Hardware::default() };
    registry.heartbeat("a1", &HeartbeatReport { hardware: Some(freed), ..Default::default() })?;
    assert_eq!(ids(&registry.query_capable("llama3-8b")?), vec!["a1"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn catalog_requirements_override_agent_claims() -> anyhow::Result<()> {
    let catalog = ModelCatalog::new(vec![
        ModelSpec { name: "big".to_owned(), capacity_required_mb: 30_000, min_context: 0 },
        ModelSpec { name: "long".to_owned(), capacity_required_mb: 0, min_context: 32_768 },
    ]);
    let registry = Registry::new(Arc::new(MemoryStore::new()), catalog, test_policy());
    registry.register(registration("a1", "http://a1:8000", &["big", "long", "plain"]))?;

    assert!(registry.query_capable("big")?.is_empty());
    assert!(registry.query_capable("long")?.is_empty());
    assert_eq!(ids(&registry.query_capable("plain")?), vec!["a1"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn adjust_load_respects_bounds() -> anyhow::Result<()> {
    let registry = memory_registry();
    let mut reg = registration("a1", "http://a1:8000", &["llama3-8b"]);
    reg.max_concurrent = Some(2);
    registry.register(reg)?;

    assert_eq!(registry.adjust_load("a1", 1)?, 1);
    assert_eq!(registry.adjust_load("a1", 1)?, 2);
    let err = registry.adjust_load("a1", 1).err();
    assert_eq!(err.map(|e| e.code), Some(ErrorCode::CapacityExceeded));
    assert_eq!(registry.get("a1")?.map(|r| r.load), Some(2));

    assert_eq!(registry.adjust_load("a1", -1)?, 1);
    assert_eq!(registry.adjust_load("a1", -1)?, 0);
    let err = registry.adjust_load("a1", -1).err();
    assert_eq!(err.map(|e| e.code), Some(ErrorCode::Internal));
    assert_eq!(registry.get("a1")?.map(|r| r.load), Some(0));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn release_still_works_after_agent_goes_offline() -> anyhow::Result<()> {
    let registry = memory_registry();
    registry.register(registration("a1", "http://a1:8000", &["llama3-8b"]))?;
    registry.adjust_load("a1", 1)?;

    tokio::time::advance(Duration::from_secs(10)).await;
    registry.sweep(Instant::now())?;

    let err = registry.adjust_load("a1", 1).err();
    assert_eq!(err.map(|e| e.code), Some(ErrorCode::AgentOffline));
    assert_eq!(registry.adjust_load("a1", -1)?, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn reliability_is_recorded_and_decays() -> anyhow::Result<()> {
    let registry = memory_registry();
    registry.register(registration("a1", "http://a1:8000", &["llama3-8b"]))?;
    for ok in [true, true, true, false] {
        registry.record_outcome("a1", ok)?;
    }
    let score_before = registry.query_capable("llama3-8b")?[0].score;
    assert_eq!(score_before, 4 * 1000 / 6);

    registry.decay_reliability()?;
    let rec = registry.get("a1")?.ok_or_else(|| anyhow::anyhow!("missing"))?;
    assert_eq!(rec.reliability, Reliability { successes: 1, failures: 0 });
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn read_failure_serves_recent_cache_then_gives_up() -> anyhow::Result<()> {
    let store = Arc::new(FlakyStore::default());
    let registry = registry_with(store.clone(), test_policy());
    registry.register(registration("a1", "http://a1:8000", &["llama3-8b"]))?;
    assert_eq!(registry.query_capable("llama3-8b")?.len(), 1);

    store.fail_reads.store(true, Ordering::SeqCst);
    tokio::time::advance(Duration::from_secs(4)).await;
    assert_eq!(registry.query_capable("llama3-8b")?.len(), 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    let err = registry.query_capable("llama3-8b").err();
    assert_eq!(err.map(|e| e.code), Some(ErrorCode::StoreUnavailable));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failed_release_is_applied_once_the_store_recovers() -> anyhow::Result<()> {
    let store = Arc::new(FlakyStore::default());
    let registry = registry_with(store.clone(), test_policy());
    registry.register(registration("a1", "http://a1:8000", &["llama3-8b"]))?;
    registry.adjust_load("a1", 1)?;

    store.fail_writes.store(true, Ordering::SeqCst);
    let err = registry.release_load("a1").err();
    assert_eq!(err.map(|e| e.code), Some(ErrorCode::StoreUnavailable));
    assert_eq!(registry.deferred_releases(), 1);
    assert_eq!(registry.settle_releases(), 0);
    assert_eq!(registry.deferred_releases(), 1);

    store.fail_writes.store(false, Ordering::SeqCst);
    assert_eq!(registry.get("a1")?.map(|r| r.load), Some(1));
    assert_eq!(registry.settle_releases(), 1);
    assert_eq!(registry.deferred_releases(), 0);
    assert_eq!(registry.get("a1")?.map(|r| r.load), Some(0));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn underflowing_release_is_not_deferred() -> anyhow::Result<()> {
    let registry = memory_registry();
    registry.register(registration("a1", "http://a1:8000", &["llama3-8b"]))?;

    let err = registry.release_load("a1").err();
    assert_eq!(err.map(|e| e.code), Some(ErrorCode::Internal));
    assert_eq!(registry.deferred_releases(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn write_failure_rejects_registration() -> anyhow::Result<()> {
    let store = Arc::new(FlakyStore::default());
    let registry = registry_with(store.clone(), test_policy());
    store.fail_writes.store(true, Ordering::SeqCst);

    let err = registry.register(registration("a1", "http://a1:8000", &["llama3-8b"])).err();
    assert_eq!(err.map(|e| e.code), Some(ErrorCode::StoreUnavailable));

    store.fail_writes.store(false, Ordering::SeqCst);
    assert!(registry.get("a1")?.is_none());
    Ok(())
}

proptest! {
    #[test]
    fn load_never_leaves_bounds(max in 1u32..6, ops in proptest::collection::vec(any::<bool>(), 0..64)) {
        let registry = memory_registry();
        let mut reg = registration("a1", "http://a1:8000", &["m"]);
        reg.max_concurrent = Some(max);
        let _ = registry.register(reg);

        let mut expected = 0u32;
        for up in ops {
            let result = registry.adjust_load("a1", if up { 1 } else { -1 });
            match (up, result) {
                (true, Ok(n)) => { expected += 1; prop_assert_eq!(n, expected); }
                (false, Ok(n)) => { expected -= 1; prop_assert_eq!(n, expected); }
                (true, Err(e)) => {
                    prop_assert_eq!(e.code, ErrorCode::CapacityExceeded);
                    prop_assert_eq!(expected, max);
                }
                (false, Err(e)) => {
                    prop_assert_eq!(e.code, ErrorCode::Internal);
                    prop_assert_eq!(expected, 0);
                }
            }
            let load = registry.get("a1").ok().flatten().map(|r| r.load);
            prop_assert_eq!(load, Some(expected));
            prop_assert!(expected <= max);
        }
    }
}
