//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, pipeline status reporting, and
//! Prometheus metrics. Used by container orchestrators, load balancers,
//! and monitoring systems.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /readyz` - Kubernetes readiness probe (checks cache seeding)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::PipelineStats;
use crate::domain::cache::StatusCache;
use crate::infrastructure::broadcast::SubscriberRegistry;
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Server version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Pipeline throughput counters.
    pub pipeline: PipelineStatus,
    /// Latest-state cache occupancy.
    pub cache: CacheStatus,
    /// Subscriber counts.
    pub subscribers: SubscriberStatus,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational.
    Healthy,
    /// Some systems degraded but functional.
    Degraded,
    /// Critical systems unavailable.
    Unhealthy,
}

/// Pipeline throughput counters.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    /// Updates accepted at ingress.
    pub updates_ingested: u64,
    /// Updates applied to the cache.
    pub updates_applied: u64,
    /// Updates shed under the drop overflow policy.
    pub updates_dropped: u64,
    /// Batches handed to the broadcast sink.
    pub batches_published: u64,
    /// Batch deliveries that failed at the sink.
    pub sink_errors: u64,
}

/// Cache occupancy.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    /// Distinct bonds currently cached.
    pub entries: usize,
    /// Configured slot capacity.
    pub capacity: usize,
}

/// Subscriber counts.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriberStatus {
    /// Currently registered batch subscribers.
    pub connected: usize,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    cache: Arc<StatusCache>,
    stats: Arc<PipelineStats>,
    registry: Arc<SubscriberRegistry>,
    shutdown: CancellationToken,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(
        version: String,
        cache: Arc<StatusCache>,
        stats: Arc<PipelineStats>,
        registry: Arc<SubscriberRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            cache,
            stats,
            registry,
            shutdown,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = Router::new()
            .route("/health", get(health_handler))
            .route("/healthz", get(liveness_handler))
            .route("/readyz", get(readiness_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    // Ready once the cache has been seeded with the starting universe.
    if state.cache.is_empty() {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    } else {
        (StatusCode::OK, "READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let status = determine_health_status(state.shutdown.is_cancelled(), state.cache.is_empty());

    HealthResponse {
        status,
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        pipeline: PipelineStatus {
            updates_ingested: state.stats.updates_ingested(),
            updates_applied: state.stats.updates_applied(),
            updates_dropped: state.stats.updates_dropped(),
            batches_published: state.stats.batches_published(),
            sink_errors: state.stats.sink_errors(),
        },
        cache: CacheStatus {
            entries: state.cache.len(),
            capacity: state.cache.capacity(),
        },
        subscribers: SubscriberStatus {
            connected: state.registry.subscriber_count(),
        },
    }
}

const fn determine_health_status(shutting_down: bool, cache_empty: bool) -> HealthStatus {
    if shutting_down {
        HealthStatus::Unhealthy
    } else if cache_empty {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================
