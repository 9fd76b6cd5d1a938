//! Configuration Module
//!
//! Configuration loading for the bond stream server.

mod settings;

pub use settings::{
    BatchSettings, CacheSettings, ConfigError, QueueSettings, ServerConfig, ServerSettings,
    SubscriberSettings,
};
