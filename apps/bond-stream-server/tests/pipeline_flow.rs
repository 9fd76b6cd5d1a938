//! Pipeline Integration Tests
//!
//! Exercises the full analytics → cache → batch → registry path with real
//! components end to end.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use bond_stream_server::{
    BatchSink, Bond, CacheError, CoalescingMode, EnrichedBond, OverflowPolicy, Pipeline,
    PipelineConfig, PipelineError, StatusCache, SubscriberRegistry, enrich,
};
use chrono::Utc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn make_bond(id: &str, price: i64) -> Bond {
    Bond {
        id: id.to_string(),
        price,
        face_value: 100,
        coupon: 4,
        duration_days: 730,
    }
}

fn make_enriched(id: &str, price: i64) -> EnrichedBond {
    enrich(&make_bond(id, price), Utc::now())
}

fn setup(
    capacity: usize,
    threshold: usize,
) -> (
    Arc<StatusCache>,
    Arc<SubscriberRegistry>,
    Pipeline,
    CancellationToken,
) {
    let cache = Arc::new(StatusCache::new(capacity));
    let registry = Arc::new(SubscriberRegistry::new(32));
    let token = CancellationToken::new();

    let config = PipelineConfig {
        queue_capacity: 64,
        overflow: OverflowPolicy::Block,
        batch_threshold: threshold,
        batch_mode: CoalescingMode::RawCount,
    };
    let sink: Arc<dyn BatchSink> = Arc::clone(&registry) as Arc<dyn BatchSink>;
    let pipeline = Pipeline::spawn(Arc::clone(&cache), sink, &config, token.clone());

    (cache, registry, pipeline, token)
}

fn parse_lines(batch: &str) -> Vec<EnrichedBond> {
    batch
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test]
async fn coalesced_batch_and_snapshot_after_mixed_updates() {
    let (cache, registry, pipeline, _token) = setup(16, 3);

    // Seed A and B before anything reads or streams.
    cache
        .initialize(vec![make_enriched("A", 1000), make_enriched("B", 900)])
        .unwrap();

    let (_id, mut batches) = registry.register();
    let sender = pipeline.sender();

    sender.send(make_bond("A", 1010)).await;
    sender.send(make_bond("B", 890)).await;
    sender.send(make_bond("A", 1020)).await;

    let batch = timeout(Duration::from_secs(5), batches.recv())
        .await
        .expect("batch not delivered in time")
        .unwrap();

    let entries = parse_lines(&batch);
    assert_eq!(entries.len(), 2);
    // A keeps its first-seen position with the intermediate 1010 dropped.
    assert_eq!(entries[0].id, "A");
    assert_eq!(entries[0].price, 1020);
    assert_eq!(entries[1].id, "B");
    assert_eq!(entries[1].price, 890);

    // The window reset: no further batch is pending.
    let idle = timeout(Duration::from_millis(200), batches.recv()).await;
    assert!(idle.is_err(), "unexpected second batch");

    // Snapshot holds exactly the latest state of both bonds.
    let snapshot: Vec<EnrichedBond> = cache
        .snapshot()
        .iter()
        .map(|s| serde_json::from_str(s).unwrap())
        .collect();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].id, "A");
    assert_eq!(snapshot[0].price, 1020);
    assert_eq!(snapshot[1].id, "B");
    assert_eq!(snapshot[1].price, 890);

    drop(sender);
    pipeline.join().await.unwrap();
}

#[tokio::test]
async fn batch_accounting_matches_apply_completions() {
    let (_cache, registry, pipeline, _token) = setup(64, 5);
    let (_id, mut batches) = registry.register();
    let sender = pipeline.sender();

    // 17 updates with threshold 5: three full windows, two left open.
    for i in 0..17 {
        sender.send(make_bond(&format!("B{i:02}"), 1000 + i)).await;
    }

    let mut received = Vec::new();
    for _ in 0..3 {
        let batch = timeout(Duration::from_secs(5), batches.recv())
            .await
            .expect("batch not delivered in time")
            .unwrap();
        received.push(batch);
    }

    for batch in &received {
        let distinct = parse_lines(batch).len();
        assert!((1..=5).contains(&distinct));
    }

    // The open window never flushes on its own.
    let idle = timeout(Duration::from_millis(200), batches.recv()).await;
    assert!(idle.is_err());

    let stats = pipeline.stats();
    assert_eq!(stats.updates_applied(), 17);
    assert_eq!(stats.batches_published(), 3);
    assert_eq!(stats.updates_dropped(), 0);

    drop(sender);
    pipeline.join().await.unwrap();
}

#[tokio::test]
async fn duplicate_heavy_window_dedupes_to_latest() {
    let (_cache, registry, pipeline, _token) = setup(16, 4);
    let (_id, mut batches) = registry.register();
    let sender = pipeline.sender();

    // Same bond three times, then one other: one batch, two entries.
    sender.send(make_bond("X", 1000)).await;
    sender.send(make_bond("X", 1005)).await;
    sender.send(make_bond("X", 1010)).await;
    sender.send(make_bond("Y", 950)).await;

    let batch = timeout(Duration::from_secs(5), batches.recv())
        .await
        .expect("batch not delivered in time")
        .unwrap();

    let entries = parse_lines(&batch);
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].id, "X");
    assert_eq!(entries[0].price, 1010);
    assert_eq!(entries[1].id, "Y");

    drop(sender);
    pipeline.join().await.unwrap();
}

#[tokio::test]
async fn streaming_past_capacity_halts_the_pipeline() {
    let (cache, _registry, pipeline, token) = setup(2, 100);

    cache
        .initialize(vec![make_enriched("A", 1000), make_enriched("B", 900)])
        .unwrap();

    let sender = pipeline.sender();
    // Updates to known bonds are fine at full capacity.
    sender.send(make_bond("A", 1010)).await;
    // A never-seen bond cannot get a slot.
    sender.send(make_bond("C", 1200)).await;

    timeout(Duration::from_secs(5), token.cancelled())
        .await
        .expect("capacity error did not cancel shutdown token");

    drop(sender);
    let err = pipeline.join().await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Cache(CacheError::CapacityExceeded { capacity: 2 })
    ));

    // The cache stays consistent at its bound.
    assert_eq!(cache.len(), 2);
}

#[tokio::test]
async fn distinct_count_mode_flushes_on_distinct_bonds() {
    let cache = Arc::new(StatusCache::new(16));
    let registry = Arc::new(SubscriberRegistry::new(32));
    let token = CancellationToken::new();

    let config = PipelineConfig {
        queue_capacity: 64,
        overflow: OverflowPolicy::Block,
        batch_threshold: 2,
        batch_mode: CoalescingMode::DistinctCount,
    };
    let sink: Arc<dyn BatchSink> = Arc::clone(&registry) as Arc<dyn BatchSink>;
    let pipeline = Pipeline::spawn(Arc::clone(&cache), sink, &config, token);

    let (_id, mut batches) = registry.register();
    let sender = pipeline.sender();

    // Duplicates alone never close a distinct-count window.
    sender.send(make_bond("X", 1000)).await;
    sender.send(make_bond("X", 1001)).await;
    sender.send(make_bond("X", 1002)).await;
    let idle = timeout(Duration::from_millis(200), batches.recv()).await;
    assert!(idle.is_err());

    sender.send(make_bond("Y", 900)).await;
    let batch = timeout(Duration::from_secs(5), batches.recv())
        .await
        .expect("batch not delivered in time")
        .unwrap();

    let entries = parse_lines(&batch);
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].price, 1002);

    drop(sender);
    pipeline.join().await.unwrap();
}
