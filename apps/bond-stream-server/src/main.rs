//! Bond Stream Server Binary
//!
//! Starts the bond analytics pipeline, the synthetic inventory feed, and
//! the HTTP/WebSocket servers.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin bond-stream-server
//! ```
//!
//! # Environment Variables
//!
//! All optional; see `infrastructure::config` for the full list.
//!
//! - `BOND_SERVER_HTTP_PORT`: query/stream API port (default: 8080)
//! - `BOND_SERVER_HEALTH_PORT`: health check HTTP port (default: 8082)
//! - `BOND_SERVER_CACHE_CAPACITY`: max distinct bonds (default: 1000000)
//! - `BOND_SERVER_BATCH_SIZE`: coalescing threshold (default: 1000)
//! - `BOND_SERVER_UNIVERSE_SIZE`: synthetic universe size (default: 500000)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::{Duration, Instant};

use bond_stream_server::infrastructure::telemetry;
use bond_stream_server::{
    ApiServer, ApiState, BatchSink, EnrichedBond, HealthServer, HealthServerState, Pipeline,
    PipelineConfig, ServerConfig, StatusCache, SubscriberRegistry, SyntheticFeed, enrich,
    init_metrics,
};
use chrono::Utc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Bond Stream Server");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = ServerConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Shared cache and subscriber registry
    let cache = Arc::new(StatusCache::new(config.cache.capacity));
    let registry = Arc::new(SubscriberRegistry::new(config.subscribers.queue_capacity));

    // Spawn the pipeline stages
    let pipeline_config = PipelineConfig {
        queue_capacity: config.queue.capacity,
        overflow: config.queue.overflow,
        batch_threshold: config.batch.threshold,
        batch_mode: config.batch.mode,
    };
    let sink: Arc<dyn BatchSink> = Arc::clone(&registry) as Arc<dyn BatchSink>;
    let pipeline = Pipeline::spawn(
        Arc::clone(&cache),
        sink,
        &pipeline_config,
        shutdown_token.clone(),
    );

    // Generate the universe and bulk-load the cache before anything reads it
    let feed = SyntheticFeed::new(
        config.feed.clone(),
        pipeline.sender(),
        shutdown_token.clone(),
    );
    let seed_started = Instant::now();
    let seed: Vec<EnrichedBond> = feed
        .universe()
        .iter()
        .map(|bond| enrich(bond, Utc::now()))
        .collect();
    cache.initialize(seed)?;
    tracing::info!(
        bonds = cache.len(),
        elapsed_ms = seed_started.elapsed().as_millis() as u64,
        "Cache seeded"
    );

    // Start the feed
    tokio::spawn(feed.run());

    // Spawn API server
    let api_state = Arc::new(ApiState::new(Arc::clone(&cache), Arc::clone(&registry)));
    let api_server = ApiServer::new(config.server.http_port, api_state, shutdown_token.clone());
    tokio::spawn(async move {
        if let Err(e) = api_server.run().await {
            tracing::error!(error = %e, "API server error");
        }
    });

    // Spawn health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&cache),
        pipeline.stats(),
        Arc::clone(&registry),
        shutdown_token.clone(),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!("Bond stream server ready");

    await_shutdown(shutdown_token).await;

    // Drain the pipeline; surface a fatal stage error if that is why we
    // stopped.
    if let Err(e) = pipeline.join().await {
        tracing::error!(error = %e, "Pipeline terminated with error");
        return Err(e.into());
    }

    tracing::info!("Bond stream server stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &ServerConfig) {
    tracing::info!(
        http_port = config.server.http_port,
        health_port = config.server.health_port,
        cache_capacity = config.cache.capacity,
        batch_threshold = config.batch.threshold,
        batch_mode = config.batch.mode.as_str(),
        queue_capacity = config.queue.capacity,
        queue_policy = config.queue.overflow.as_str(),
        universe_size = config.feed.universe_size,
        "Configuration loaded"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for a shutdown signal (SIGTERM, SIGINT, or internal cancellation).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
        () = shutdown_token.cancelled() => {
            tracing::warn!("Internal shutdown requested");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
