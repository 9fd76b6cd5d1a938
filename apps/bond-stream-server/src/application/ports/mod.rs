//! Port Interfaces
//!
//! Interfaces (ports) between the pipeline and the outside world,
//! following the Hexagonal Architecture pattern.
//!
//! The batch stage does not know about subscribers, sockets, or connection
//! health; it depends only on the [`BatchSink`] capability. The transport
//! adapter behind it owns registration and dead-peer pruning.

use std::sync::Arc;

use async_trait::async_trait;

/// Errors surfaced by a batch sink.
///
/// Delivery is best-effort: a sink failure is logged by the batch stage
/// and the next window proceeds normally. There is no retry; a later batch
/// naturally carries the latest state.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The sink cannot accept batches at all.
    #[error("broadcast sink unavailable: {0}")]
    Unavailable(String),
}

/// Capability to deliver one opaque batch to all current subscribers.
///
/// Implementations must isolate per-subscriber failures (one slow or dead
/// subscriber must not block the rest) and must return within bounded
/// time; enqueue-and-forget dispatch is acceptable.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Fan the batch out to every registered subscriber.
    ///
    /// Returns the number of subscribers the batch was handed to.
    async fn deliver(&self, batch: Arc<str>) -> Result<usize, SinkError>;
}
