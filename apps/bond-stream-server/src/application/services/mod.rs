//! Pipeline Service
//!
//! Wires the three stage workers (analytics, cache, batch) into a
//! unidirectional pipeline over bounded mpsc channels. Each stage is one
//! dedicated task draining its input channel until the channel closes, so
//! shutting the feed down drains the whole pipeline end to end.
//!
//! # Backpressure
//!
//! Inter-stage queues are bounded with an explicit overflow policy:
//! [`OverflowPolicy::Block`] (producers await space, nothing is lost) or
//! [`OverflowPolicy::Drop`] (the newest update is shed and counted).
//! There is no silent unbounded growth.
//!
//! # Failure semantics
//!
//! An update that cannot be serialized is skipped with a warning. Cache
//! capacity exhaustion is fatal: the cache worker cancels the shutdown
//! token and surfaces the error through [`Pipeline::join`]. A sink failure
//! is logged at batch level and the next window proceeds normally.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::ports::BatchSink;
use crate::domain::analytics::enrich;
use crate::domain::batch::{BatchMessage, CoalescingMode, CoalescingWindow};
use crate::domain::bond::{Bond, BondUpdate, EnrichedBond};
use crate::domain::cache::{CacheError, StatusCache};

// =============================================================================
// Configuration
// =============================================================================

/// What producers do when an inter-stage queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Await queue space; end-to-end delivery is preserved.
    #[default]
    Block,
    /// Shed the newest update and count it.
    Drop,
}

impl OverflowPolicy {
    /// Parse a policy from a config string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "drop" => Self::Drop,
            _ => Self::Block,
        }
    }

    /// Get the policy name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Drop => "drop",
        }
    }
}

/// Pipeline tuning knobs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Capacity of each inter-stage queue.
    pub queue_capacity: usize,
    /// Producer behavior when a queue is full.
    pub overflow: OverflowPolicy,
    /// Coalescing window threshold.
    pub batch_threshold: usize,
    /// What the window threshold counts.
    pub batch_mode: CoalescingMode,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 8192,
            overflow: OverflowPolicy::Block,
            batch_threshold: 1000,
            batch_mode: CoalescingMode::RawCount,
        }
    }
}

// =============================================================================
// Stats
// =============================================================================

/// Live pipeline counters, shared with the health endpoint.
#[derive(Debug, Default)]
pub struct PipelineStats {
    updates_ingested: AtomicU64,
    updates_dropped: AtomicU64,
    updates_applied: AtomicU64,
    batches_published: AtomicU64,
    sink_errors: AtomicU64,
}

impl PipelineStats {
    /// Updates accepted at ingress.
    pub fn updates_ingested(&self) -> u64 {
        self.updates_ingested.load(Ordering::Relaxed)
    }

    /// Updates shed under the `drop` overflow policy.
    pub fn updates_dropped(&self) -> u64 {
        self.updates_dropped.load(Ordering::Relaxed)
    }

    /// Updates applied to the cache.
    pub fn updates_applied(&self) -> u64 {
        self.updates_applied.load(Ordering::Relaxed)
    }

    /// Batches handed to the broadcast sink.
    pub fn batches_published(&self) -> u64 {
        self.batches_published.load(Ordering::Relaxed)
    }

    /// Batch deliveries that failed at the sink.
    pub fn sink_errors(&self) -> u64 {
        self.sink_errors.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Fatal pipeline failures surfaced by [`Pipeline::join`].
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The cache stage hit an unrecoverable error.
    #[error("cache stage failed: {0}")]
    Cache(#[from] CacheError),

    /// A stage worker panicked or was aborted.
    #[error("pipeline worker failed: {0}")]
    Worker(String),
}

// =============================================================================
// Ingress Sender
// =============================================================================

/// Handle for pushing raw bond updates into the pipeline.
///
/// Cheap to clone; applies the configured overflow policy on every send.
#[derive(Clone)]
pub struct BondSender {
    tx: mpsc::Sender<Bond>,
    overflow: OverflowPolicy,
    stats: Arc<PipelineStats>,
}

impl BondSender {
    /// Push one raw update into the analytics stage.
    pub async fn send(&self, bond: Bond) {
        self.stats.updates_ingested.fetch_add(1, Ordering::Relaxed);
        counter!("bondstream_updates_ingested_total").increment(1);

        match self.overflow {
            OverflowPolicy::Block => {
                if self.tx.send(bond).await.is_err() {
                    tracing::debug!("pipeline closed; discarding inbound update");
                }
            }
            OverflowPolicy::Drop => match self.tx.try_send(bond) {
                Ok(()) => {}
                Err(TrySendError::Full(bond)) => {
                    self.stats.updates_dropped.fetch_add(1, Ordering::Relaxed);
                    counter!("bondstream_updates_dropped_total", "stage" => "ingest")
                        .increment(1);
                    tracing::trace!(bond_id = %bond.id, "ingest queue full; shedding update");
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!("pipeline closed; discarding inbound update");
                }
            },
        }
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// The running three-stage pipeline.
pub struct Pipeline {
    sender: BondSender,
    stats: Arc<PipelineStats>,
    workers: Vec<JoinHandle<Result<(), PipelineError>>>,
}

impl Pipeline {
    /// Spawn the stage workers.
    ///
    /// The pipeline runs until every ingress [`BondSender`] (including the
    /// one held internally, released by [`join`](Self::join)) is dropped,
    /// at which point the stages drain in order and exit.
    #[must_use]
    pub fn spawn(
        cache: Arc<StatusCache>,
        sink: Arc<dyn BatchSink>,
        config: &PipelineConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let stats = Arc::new(PipelineStats::default());

        let (ingest_tx, ingest_rx) = mpsc::channel::<Bond>(config.queue_capacity);
        let (enriched_tx, enriched_rx) = mpsc::channel::<EnrichedBond>(config.queue_capacity);
        let (update_tx, update_rx) = mpsc::channel::<BondUpdate>(config.queue_capacity);

        let overflow = config.overflow;

        let analytics_stats = Arc::clone(&stats);
        let analytics = tokio::spawn(async move {
            run_analytics_stage(ingest_rx, enriched_tx, overflow, analytics_stats).await;
            Ok(())
        });

        let cache_stats = Arc::clone(&stats);
        let cache_worker = tokio::spawn(run_cache_stage(
            enriched_rx,
            update_tx,
            cache,
            overflow,
            cache_stats,
            shutdown,
        ));

        let batch_stats = Arc::clone(&stats);
        let threshold = config.batch_threshold;
        let mode = config.batch_mode;
        let batch = tokio::spawn(async move {
            run_batch_stage(update_rx, sink, threshold, mode, batch_stats).await;
            Ok(())
        });

        tracing::info!(
            queue_capacity = config.queue_capacity,
            overflow = overflow.as_str(),
            batch_threshold = threshold,
            batch_mode = mode.as_str(),
            "Pipeline stages started"
        );

        Self {
            sender: BondSender {
                tx: ingest_tx,
                overflow,
                stats: Arc::clone(&stats),
            },
            stats,
            workers: vec![analytics, cache_worker, batch],
        }
    }

    /// Get an ingress handle.
    #[must_use]
    pub fn sender(&self) -> BondSender {
        self.sender.clone()
    }

    /// Get the shared stats counters.
    #[must_use]
    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Release the internal ingress handle and wait for the stages to
    /// drain. Returns the first fatal stage error, if any.
    pub async fn join(self) -> Result<(), PipelineError> {
        let Self {
            sender, workers, ..
        } = self;
        drop(sender);

        let mut result = Ok(());
        for worker in workers {
            match worker.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
                Err(join_err) => {
                    if result.is_ok() {
                        result = Err(PipelineError::Worker(join_err.to_string()));
                    }
                }
            }
        }
        result
    }
}

// =============================================================================
// Stage Workers
// =============================================================================

/// Forward a value downstream under the overflow policy.
///
/// Returns `false` when the downstream stage is gone.
async fn forward<T: Send>(
    tx: &mpsc::Sender<T>,
    value: T,
    overflow: OverflowPolicy,
    stats: &PipelineStats,
    stage: &'static str,
) -> bool {
    match overflow {
        OverflowPolicy::Block => tx.send(value).await.is_ok(),
        OverflowPolicy::Drop => match tx.try_send(value) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                stats.updates_dropped.fetch_add(1, Ordering::Relaxed);
                counter!("bondstream_updates_dropped_total", "stage" => stage).increment(1);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        },
    }
}

async fn run_analytics_stage(
    mut rx: mpsc::Receiver<Bond>,
    tx: mpsc::Sender<EnrichedBond>,
    overflow: OverflowPolicy,
    stats: Arc<PipelineStats>,
) {
    while let Some(bond) = rx.recv().await {
        let enriched = enrich(&bond, chrono::Utc::now());
        if !forward(&tx, enriched, overflow, &stats, "analytics").await {
            break;
        }
    }
    tracing::debug!("Analytics stage drained");
}

async fn run_cache_stage(
    mut rx: mpsc::Receiver<EnrichedBond>,
    tx: mpsc::Sender<BondUpdate>,
    cache: Arc<StatusCache>,
    overflow: OverflowPolicy,
    stats: Arc<PipelineStats>,
    shutdown: CancellationToken,
) -> Result<(), PipelineError> {
    while let Some(enriched) = rx.recv().await {
        match cache.apply(enriched) {
            Ok(update) => {
                stats.updates_applied.fetch_add(1, Ordering::Relaxed);
                counter!("bondstream_updates_applied_total").increment(1);
                gauge!("bondstream_cache_entries").set(cache.len() as f64);

                if !forward(&tx, update, overflow, &stats, "cache").await {
                    break;
                }
            }
            Err(err @ CacheError::CapacityExceeded { .. }) => {
                tracing::error!(error = %err, "Cache capacity exhausted; halting pipeline");
                shutdown.cancel();
                return Err(err.into());
            }
            Err(err) => {
                tracing::warn!(error = %err, "Skipping unserializable update");
            }
        }
    }
    tracing::debug!("Cache stage drained");
    Ok(())
}

async fn run_batch_stage(
    mut rx: mpsc::Receiver<BondUpdate>,
    sink: Arc<dyn BatchSink>,
    threshold: usize,
    mode: CoalescingMode,
    stats: Arc<PipelineStats>,
) {
    let mut window = CoalescingWindow::new(threshold, mode);

    while let Some(update) = rx.recv().await {
        if let Some(batch) = window.push(update) {
            publish_batch(sink.as_ref(), batch, &stats).await;
        }
    }

    if !window.is_empty() {
        tracing::debug!(
            distinct = window.distinct_len(),
            raw = window.raw_count(),
            "Batch stage drained with open window discarded"
        );
    }
}

async fn publish_batch(sink: &dyn BatchSink, batch: BatchMessage, stats: &PipelineStats) {
    let started = Instant::now();
    let payload: Arc<str> = batch.payload.into();

    match sink.deliver(payload).await {
        Ok(delivered) => {
            stats.batches_published.fetch_add(1, Ordering::Relaxed);
            counter!("bondstream_batches_published_total").increment(1);
            histogram!("bondstream_batch_flush_duration_seconds")
                .record(started.elapsed().as_secs_f64());
            tracing::debug!(
                distinct = batch.distinct,
                raw = batch.raw,
                delivered,
                "Batch published"
            );
        }
        Err(err) => {
            stats.sink_errors.fetch_add(1, Ordering::Relaxed);
            counter!("bondstream_sink_errors_total").increment(1);
            tracing::warn!(
                error = %err,
                distinct = batch.distinct,
                "Batch delivery failed; next window proceeds"
            );
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::application::ports::MockBatchSink;

    fn make_bond(id: &str, price: i64) -> Bond {
        Bond {
            id: id.to_string(),
            price,
            face_value: 100,
            coupon: 4,
            duration_days: 730,
        }
    }

    fn capturing_sink() -> (Arc<MockBatchSink>, Arc<Mutex<Vec<String>>>) {
        let captured: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_captured = Arc::clone(&captured);

        let mut mock = MockBatchSink::new();
        mock.expect_deliver().returning(move |batch| {
            sink_captured.lock().push(batch.to_string());
            Ok(1)
        });

        (Arc::new(mock), captured)
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn pipeline_coalesces_and_publishes() {
        let cache = Arc::new(StatusCache::new(16));
        let (sink, captured) = capturing_sink();
        let config = PipelineConfig {
            batch_threshold: 3,
            ..PipelineConfig::default()
        };

        let pipeline = Pipeline::spawn(
            Arc::clone(&cache),
            sink,
            &config,
            CancellationToken::new(),
        );
        let sender = pipeline.sender();

        sender.send(make_bond("A", 1010)).await;
        sender.send(make_bond("B", 890)).await;
        sender.send(make_bond("A", 1020)).await;

        wait_for(|| !captured.lock().is_empty()).await;

        let batches = captured.lock();
        assert_eq!(batches.len(), 1);
        let lines: Vec<&str> = batches[0].lines().collect();
        // A first (first seen), coalesced to its latest value; B second.
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"id\":\"A\"") && lines[0].contains("\"price\":1020"));
        assert!(lines[1].contains("\"id\":\"B\"") && lines[1].contains("\"price\":890"));
        drop(batches);

        assert_eq!(cache.len(), 2);
        drop(sender);
        pipeline.join().await.unwrap();
    }

    #[tokio::test]
    async fn capacity_exhaustion_is_fatal_and_cancels_shutdown() {
        let cache = Arc::new(StatusCache::new(1));
        let (sink, _captured) = capturing_sink();
        let shutdown = CancellationToken::new();

        let pipeline = Pipeline::spawn(
            cache,
            sink,
            &PipelineConfig::default(),
            shutdown.clone(),
        );
        let sender = pipeline.sender();

        sender.send(make_bond("A", 1000)).await;
        sender.send(make_bond("B", 900)).await;

        shutdown.cancelled().await;

        drop(sender);
        let err = pipeline.join().await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Cache(CacheError::CapacityExceeded { capacity: 1 })
        ));
    }

    #[tokio::test]
    async fn drop_policy_sheds_when_queue_full() {
        let stats = Arc::new(PipelineStats::default());
        let (tx, _rx) = mpsc::channel::<Bond>(1);
        let sender = BondSender {
            tx,
            overflow: OverflowPolicy::Drop,
            stats: Arc::clone(&stats),
        };

        // Nothing drains `_rx`, so only the first send fits.
        for i in 0..5 {
            sender.send(make_bond("A", 1000 + i)).await;
        }

        assert_eq!(stats.updates_ingested(), 5);
        assert_eq!(stats.updates_dropped(), 4);
    }

    #[tokio::test]
    async fn block_policy_delivers_everything() {
        let cache = Arc::new(StatusCache::new(64));
        let (sink, captured) = capturing_sink();
        let config = PipelineConfig {
            queue_capacity: 2,
            batch_threshold: 10,
            ..PipelineConfig::default()
        };

        let pipeline = Pipeline::spawn(
            Arc::clone(&cache),
            sink,
            &config,
            CancellationToken::new(),
        );
        let sender = pipeline.sender();

        for i in 0..40 {
            sender.send(make_bond(&format!("B{i:02}"), 1000 + i)).await;
        }

        wait_for(|| captured.lock().len() == 4).await;
        let stats = pipeline.stats();
        assert_eq!(stats.updates_applied(), 40);
        assert_eq!(stats.updates_dropped(), 0);
        assert_eq!(stats.batches_published(), 4);
        drop(sender);
        pipeline.join().await.unwrap();
    }

    #[tokio::test]
    async fn sink_failure_does_not_stop_windows() {
        let cache = Arc::new(StatusCache::new(16));
        let calls: Arc<Mutex<Vec<Result<(), ()>>>> = Arc::new(Mutex::new(Vec::new()));

        let sink_calls = Arc::clone(&calls);
        let mut mock = MockBatchSink::new();
        let mut first = true;
        mock.expect_deliver().returning(move |_| {
            if first {
                first = false;
                sink_calls.lock().push(Err(()));
                Err(crate::application::ports::SinkError::Unavailable(
                    "test".to_string(),
                ))
            } else {
                sink_calls.lock().push(Ok(()));
                Ok(1)
            }
        });

        let config = PipelineConfig {
            batch_threshold: 2,
            ..PipelineConfig::default()
        };
        let pipeline = Pipeline::spawn(
            cache,
            Arc::new(mock),
            &config,
            CancellationToken::new(),
        );
        let sender = pipeline.sender();

        for i in 0..4 {
            sender.send(make_bond(&format!("B{i}"), 1000)).await;
        }

        wait_for(|| calls.lock().len() == 2).await;
        let stats = pipeline.stats();
        assert_eq!(stats.sink_errors(), 1);
        assert_eq!(stats.batches_published(), 1);
        drop(sender);
        pipeline.join().await.unwrap();
    }

    #[test]
    fn overflow_policy_parsing() {
        assert_eq!(
            OverflowPolicy::from_str_case_insensitive("drop"),
            OverflowPolicy::Drop
        );
        assert_eq!(
            OverflowPolicy::from_str_case_insensitive("BLOCK"),
            OverflowPolicy::Block
        );
        assert_eq!(
            OverflowPolicy::from_str_case_insensitive("unknown"),
            OverflowPolicy::Block
        );
    }
}
