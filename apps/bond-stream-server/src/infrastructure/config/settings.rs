//! Server Configuration Settings
//!
//! Configuration types for the bond stream server, loaded from environment
//! variables with sensible defaults. Nothing is required: a bare
//! `cargo run` starts a self-contained server with a synthetic feed.
//!
//! # Environment Variables
//!
//! - `BOND_SERVER_HTTP_PORT`: query/stream API port (default: 8080)
//! - `BOND_SERVER_HEALTH_PORT`: health/metrics port (default: 8082)
//! - `BOND_SERVER_CACHE_CAPACITY`: max distinct bonds (default: 1000000)
//! - `BOND_SERVER_BATCH_SIZE`: coalescing threshold (default: 1000)
//! - `BOND_SERVER_BATCH_MODE`: "raw-count" | "distinct-count"
//! - `BOND_SERVER_QUEUE_CAPACITY`: inter-stage queue size (default: 8192)
//! - `BOND_SERVER_QUEUE_POLICY`: "block" | "drop"
//! - `BOND_SERVER_SUBSCRIBER_QUEUE_CAPACITY`: per-subscriber outbound
//!   queue (default: 32)
//! - `BOND_SERVER_UNIVERSE_SIZE`: synthetic universe size (default: 500000)
//! - `BOND_SERVER_FEED_UPDATES_PER_TICK`: updates per burst (default: 550)
//! - `BOND_SERVER_FEED_TICK_MS`: burst interval (default: 250)

use std::time::Duration;

use crate::application::services::OverflowPolicy;
use crate::domain::batch::CoalescingMode;
use crate::infrastructure::feed::FeedSettings;

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Query/stream API HTTP port.
    pub http_port: u16,
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            http_port: 8080,
            health_port: 8082,
        }
    }
}

/// Cache sizing settings.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Maximum number of distinct bonds the cache will ever hold.
    pub capacity: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: 1_000_000,
        }
    }
}

/// Batch stage settings.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    /// Coalescing window threshold.
    pub threshold: usize,
    /// What the threshold counts.
    pub mode: CoalescingMode,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            threshold: 1000,
            mode: CoalescingMode::RawCount,
        }
    }
}

/// Inter-stage queue settings.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Capacity of each inter-stage queue.
    pub capacity: usize,
    /// Producer behavior when a queue is full.
    pub overflow: OverflowPolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: 8192,
            overflow: OverflowPolicy::Block,
        }
    }
}

/// Subscriber fan-out settings.
#[derive(Debug, Clone)]
pub struct SubscriberSettings {
    /// Per-subscriber outbound queue capacity; a subscriber that falls
    /// this many batches behind is pruned.
    pub queue_capacity: usize,
}

impl Default for SubscriberSettings {
    fn default() -> Self {
        Self { queue_capacity: 32 }
    }
}

/// Complete server configuration.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Server port settings.
    pub server: ServerSettings,
    /// Cache sizing settings.
    pub cache: CacheSettings,
    /// Batch stage settings.
    pub batch: BatchSettings,
    /// Inter-stage queue settings.
    pub queue: QueueSettings,
    /// Subscriber fan-out settings.
    pub subscribers: SubscriberSettings,
    /// Synthetic feed settings.
    pub feed: FeedSettings,
}

impl ServerConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error when the combination of settings cannot work
    /// (e.g. a universe larger than the cache capacity).
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            server: ServerSettings {
                http_port: parse_env_u16("BOND_SERVER_HTTP_PORT", ServerSettings::default().http_port),
                health_port: parse_env_u16(
                    "BOND_SERVER_HEALTH_PORT",
                    ServerSettings::default().health_port,
                ),
            },
            cache: CacheSettings {
                capacity: parse_env_usize(
                    "BOND_SERVER_CACHE_CAPACITY",
                    CacheSettings::default().capacity,
                ),
            },
            batch: BatchSettings {
                threshold: parse_env_usize(
                    "BOND_SERVER_BATCH_SIZE",
                    BatchSettings::default().threshold,
                ),
                mode: std::env::var("BOND_SERVER_BATCH_MODE")
                    .map(|s| CoalescingMode::from_str_case_insensitive(&s))
                    .unwrap_or_default(),
            },
            queue: QueueSettings {
                capacity: parse_env_usize(
                    "BOND_SERVER_QUEUE_CAPACITY",
                    QueueSettings::default().capacity,
                ),
                overflow: std::env::var("BOND_SERVER_QUEUE_POLICY")
                    .map(|s| OverflowPolicy::from_str_case_insensitive(&s))
                    .unwrap_or_default(),
            },
            subscribers: SubscriberSettings {
                queue_capacity: parse_env_usize(
                    "BOND_SERVER_SUBSCRIBER_QUEUE_CAPACITY",
                    SubscriberSettings::default().queue_capacity,
                ),
            },
            feed: FeedSettings {
                universe_size: parse_env_usize(
                    "BOND_SERVER_UNIVERSE_SIZE",
                    FeedSettings::default().universe_size,
                ),
                updates_per_tick: parse_env_usize(
                    "BOND_SERVER_FEED_UPDATES_PER_TICK",
                    FeedSettings::default().updates_per_tick,
                ),
                tick_interval: parse_env_duration_millis(
                    "BOND_SERVER_FEED_TICK_MS",
                    FeedSettings::default().tick_interval,
                ),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject setting combinations that cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "BOND_SERVER_CACHE_CAPACITY".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        if self.feed.universe_size > self.cache.capacity {
            return Err(ConfigError::InvalidValue {
                key: "BOND_SERVER_UNIVERSE_SIZE".to_string(),
                reason: format!(
                    "universe of {} bonds exceeds cache capacity {}",
                    self.feed.universe_size, self.cache.capacity
                ),
            });
        }

        if self.server.http_port == self.server.health_port {
            return Err(ConfigError::InvalidValue {
                key: "BOND_SERVER_HEALTH_PORT".to_string(),
                reason: "health port must differ from the HTTP port".to_string(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A setting (or combination of settings) cannot work.
    #[error("invalid configuration for {key}: {reason}")]
    InvalidValue {
        /// The offending environment variable.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },
}

fn parse_env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_duration_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
