#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::default_trait_access,
        clippy::items_after_statements
    )
)]

//! Bond Stream Server - Real-Time Bond Analytics
//!
//! A streaming service that ingests a continuous feed of bond price
//! updates, enriches each update with derived analytics, keeps an
//! always-current in-memory snapshot of every bond's latest state, and
//! pushes changes to WebSocket subscribers in coalesced batches instead
//! of one message per update.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pipeline types and logic with no I/O
//!   - `bond`: Raw, enriched, and change-notification types
//!   - `analytics`: Pure per-update enrichment
//!   - `cache`: Stable-slot latest-state table
//!   - `batch`: Coalescing window
//!
//! - **Application**: Orchestration and port definitions
//!   - `ports`: The `BatchSink` capability the batch stage depends on
//!   - `services`: Stage workers, queues, and backpressure policy
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `broadcast`: Subscriber registry with per-subscriber queues
//!   - `feed`: Synthetic tiered-universe inventory feed
//!   - `api`: Query endpoints and the WebSocket subscriber endpoint
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!   - `metrics` / `telemetry`: Prometheus and OpenTelemetry wiring
//!
//! # Data Flow
//!
//! ```text
//! Inventory Feed ──► Analytics ──► Cache ──► Batch ──► Subscriber ──► WS Client 1
//!                     Stage        Stage     Stage     Registry   ──► WS Client N
//!                                    │
//!                                    └── snapshot() ──► Query API (/bonds, /status)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core pipeline types and logic with no I/O dependencies.
pub mod domain;

/// Application layer - Pipeline orchestration and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::analytics::enrich;
pub use domain::batch::{BatchMessage, CoalescingMode, CoalescingWindow};
pub use domain::bond::{Bond, BondUpdate, EnrichedBond};
pub use domain::cache::{CacheError, StatusCache};

// Ports
pub use application::ports::{BatchSink, SinkError};

// Pipeline
pub use application::services::{
    BondSender, OverflowPolicy, Pipeline, PipelineConfig, PipelineError, PipelineStats,
};

// Infrastructure config
pub use infrastructure::config::{
    BatchSettings, CacheSettings, ConfigError, QueueSettings, ServerConfig, ServerSettings,
    SubscriberSettings,
};

// Subscriber registry (for integration tests)
pub use infrastructure::broadcast::{SubscriberId, SubscriberRegistry};

// Synthetic feed
pub use infrastructure::feed::{FeedSettings, SyntheticFeed, generate_universe};

// API server (for integration tests)
pub use infrastructure::api::{
    ApiServer, ApiState, BondPageResponse, BondQuery, BondSummary, router,
};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
