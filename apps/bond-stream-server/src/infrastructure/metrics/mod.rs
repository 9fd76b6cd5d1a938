//! Prometheus Metrics Module
//!
//! Exposes application metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Pipeline**: updates ingested/applied/dropped, batch publish counts
//! - **Subscribers**: connected gauge, prune counts by reason
//! - **Cache**: live entry count
//! - **Latency**: batch flush-and-dispatch duration
//!
//! Metric values are recorded at the call sites through the `metrics`
//! facade macros; this module installs the recorder and registers the
//! metric descriptions. Rendered at `/metrics` on the health server port.

use std::sync::OnceLock;

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            let handle = builder
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

fn register_metrics() {
    // Pipeline counters
    describe_counter!(
        "bondstream_updates_ingested_total",
        "Raw bond updates accepted at pipeline ingress"
    );
    describe_counter!(
        "bondstream_updates_applied_total",
        "Enriched updates applied to the latest-state cache"
    );
    describe_counter!(
        "bondstream_updates_dropped_total",
        "Updates shed under the drop overflow policy, by stage"
    );
    describe_counter!(
        "bondstream_batches_published_total",
        "Coalesced batches handed to the broadcast sink"
    );
    describe_counter!(
        "bondstream_sink_errors_total",
        "Batch deliveries that failed at the sink"
    );

    // Subscriber metrics
    describe_gauge!(
        "bondstream_subscribers_connected",
        "Currently registered batch subscribers"
    );
    describe_counter!(
        "bondstream_subscribers_pruned_total",
        "Subscribers removed during fan-out, by reason"
    );

    // Cache gauge
    describe_gauge!(
        "bondstream_cache_entries",
        "Distinct bonds held in the latest-state cache"
    );

    // Latency histograms
    describe_histogram!(
        "bondstream_batch_flush_duration_seconds",
        "Time to format and dispatch one coalesced batch"
    );
}
