mod support;

use coexa_engine::{EngineConfig, PrunePolicy};
use std::time::Duration;
use support::*;

fn warm_test_config() -> EngineConfig {
    EngineConfig {
        cache_stringency: 1,
        warm_queue_capacity: 64,
        warm_poll_interval: Duration::from_millis(10),
        warm_pause: Duration::from_millis(1),
        ..Default::default()
    }
}

/// Probe with a quick query: quick results are never written back, so any
/// cache hit observed must have been produced by someone else.
async fn probe_from_cache(engine: &coexa_engine::CoexpressionEngine, gene_id: u64) -> bool {
    let mut req = request(&[gene_id], &[1, 2], 1);
    req.quick = true;
    let results = engine.query(&req).await.expect("probe query");
    results
        .get(&gene(gene_id))
        .map(|list| !list.is_empty() && list.iter().all(|r| r.is_from_cache()))
        .unwrap_or(false)
}

#[tokio::test]
async fn warm_worker_populates_the_result_cache() {
    let (_dir, engine) = engine_with(PrunePolicy::KeepDormant, warm_test_config());
    engine
        .ingest(TAXON, experiment(1), vec![link(1, 2, true)], genes(&[1, 2]))
        .await
        .expect("e1");
    engine
        .ingest(TAXON, experiment(2), vec![link(1, 2, true)], genes(&[1, 2]))
        .await
        .expect("e2");

    assert!(!probe_from_cache(&engine, 1).await);

    assert_eq!(engine.enqueue_for_warm(TAXON, &[gene(1)]).await, 1);
    let handle = engine.spawn_warm_worker().expect("first spawn");

    let mut warmed = false;
    for _ in 0..100 {
        if probe_from_cache(&engine, 1).await {
            warmed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    handle.shutdown().await;
    assert!(warmed, "warm worker never populated the cache");
}

#[tokio::test]
async fn warm_worker_drains_genes_with_no_links() {
    let (_dir, engine) = engine_with(PrunePolicy::KeepDormant, warm_test_config());
    engine
        .ingest(TAXON, experiment(1), vec![link(1, 2, true)], genes(&[1, 2, 7]))
        .await
        .expect("e1");

    engine.enqueue_for_warm(TAXON, &[gene(7)]).await;
    let handle = engine.spawn_warm_worker().expect("spawn");
    let mut drained = false;
    for _ in 0..100 {
        if engine.warm_backlog().await == 0 {
            drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    handle.shutdown().await;
    assert!(drained, "queue never drained");

    // Gene 7 truly has no coexpression; the query still answers cleanly.
    let results = engine
        .query(&request(&[7], &[1], 1))
        .await
        .expect("query");
    assert!(results.is_empty());
}

#[tokio::test]
async fn enqueue_drops_silently_once_full() {
    let cfg = EngineConfig {
        warm_queue_capacity: 2,
        ..warm_test_config()
    };
    let (_dir, engine) = engine_with(PrunePolicy::KeepDormant, cfg);
    let accepted = engine
        .enqueue_for_warm(TAXON, &[gene(1), gene(2), gene(3), gene(4), gene(5)])
        .await;
    assert_eq!(accepted, 2);
    assert_eq!(engine.warm_backlog().await, 2);

    // Duplicates are not queued twice.
    let again = engine.enqueue_for_warm(TAXON, &[gene(1)]).await;
    assert_eq!(again, 0);
}

#[tokio::test]
async fn dequeue_removes_pending_entries() {
    let (_dir, engine) = engine_with(PrunePolicy::KeepDormant, warm_test_config());
    engine
        .enqueue_for_warm(TAXON, &[gene(1), gene(2), gene(3)])
        .await;
    engine.dequeue_warm(TAXON, &[gene(2)]).await;
    assert_eq!(engine.warm_backlog().await, 2);
}

#[tokio::test]
async fn only_one_warm_worker_is_spawned() {
    let (_dir, engine) = engine_with(PrunePolicy::KeepDormant, warm_test_config());
    let handle = engine.spawn_warm_worker().expect("first spawn");
    assert!(engine.spawn_warm_worker().is_none());
    handle.shutdown().await;
}

#[tokio::test]
async fn ingest_evicts_stale_cache_entries_and_pending_warmups() {
    let (_dir, engine) = engine(PrunePolicy::KeepDormant);
    engine
        .ingest(TAXON, experiment(1), vec![link(1, 2, true)], genes(&[1, 2]))
        .await
        .expect("e1");
    engine
        .ingest(TAXON, experiment(2), vec![link(1, 2, true)], genes(&[1, 2]))
        .await
        .expect("e2");

    // Non-quick, uncapped query at cache stringency populates the cache.
    engine
        .query(&request(&[1], &[1, 2], 1))
        .await
        .expect("warm-up query");
    assert!(probe_from_cache(&engine, 1).await);

    engine.enqueue_for_warm(TAXON, &[gene(1), gene(9)]).await;
    engine
        .ingest(TAXON, experiment(3), vec![link(1, 5, true)], genes(&[1, 5]))
        .await
        .expect("e3");

    assert!(
        !probe_from_cache(&engine, 1).await,
        "ingest must evict the touched gene"
    );
    // Gene 1's pending warm-up went stale and was dequeued; gene 9 stays.
    assert_eq!(engine.warm_backlog().await, 1);
}

#[tokio::test]
async fn retract_evicts_affected_genes() {
    let (_dir, engine) = engine(PrunePolicy::KeepDormant);
    engine
        .ingest(TAXON, experiment(1), vec![link(1, 2, true)], genes(&[1, 2]))
        .await
        .expect("e1");
    engine
        .ingest(TAXON, experiment(2), vec![link(1, 2, true)], genes(&[1, 2]))
        .await
        .expect("e2");
    engine
        .query(&request(&[1], &[1, 2], 1))
        .await
        .expect("warm-up query");
    assert!(probe_from_cache(&engine, 1).await);

    engine.retract(TAXON, experiment(2)).await.expect("retract");
    assert!(!probe_from_cache(&engine, 1).await);
}

#[tokio::test]
async fn shutdown_disables_both_caches() {
    let (_dir, engine) = engine(PrunePolicy::KeepDormant);
    engine
        .ingest(TAXON, experiment(1), vec![link(1, 2, true)], genes(&[1, 2]))
        .await
        .expect("e1");
    engine
        .ingest(TAXON, experiment(2), vec![link(1, 2, true)], genes(&[1, 2]))
        .await
        .expect("e2");

    engine.shutdown().await;
    engine
        .query(&request(&[1], &[1, 2], 1))
        .await
        .expect("query after shutdown");
    // Nothing was cached: the follow-up query still comes from the store.
    assert!(!probe_from_cache(&engine, 1).await);

    // Queries keep working; shutdown only silences the caches.
    let results = engine
        .query(&request(&[1], &[1, 2], 2))
        .await
        .expect("query");
    assert_eq!(results[&gene(1)].len(), 1);
}
