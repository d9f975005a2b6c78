//! # Forrest Agent
//!
//! Headless process running the gateway and one sync engine per configured
//! collection until interrupted.
//!
//! ## Startup
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  1. tracing (RUST_LOG, default info,forrest=debug,sqlx=warn)           │
//! │  2. SyncConfig::load(argv[1] or platform config dir)                   │
//! │  3. Database::new (migrations run on open)                             │
//! │  4. SyncContext: persisted watermark + pending queue                   │
//! │  5. SyncEngine per [[collections]] entry (bootstrap if stale)          │
//! │  6. Gateway::spawn: catch-up, then live stream                         │
//! │  7. Ctrl+C / SIGTERM ──► gateway, engines, state flushed, db closed    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```text
//! forrest-agent [path/to/sync.toml]
//! ```

use std::path::PathBuf;
use std::time::Duration;

use forrest_db::{Database, DbConfig};
use forrest_sync::{
    CollectionOptions, ConnectionState, Gateway, GatewayConfig, RestClient, SyncConfig,
    SyncContext, SyncEngine,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How long shutdown waits for the gateway to close its stream.
const GATEWAY_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!("Starting Forrest sync agent...");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = SyncConfig::load(config_path)?;
    let endpoints = config.endpoints()?;
    info!(
        events = %endpoints.events_base(),
        tree = %endpoints.tree_base(),
        username = %config.username(),
        collections = config.collections.len(),
        "Configuration loaded"
    );

    if config.collections.is_empty() {
        warn!("No collections configured; only the event stream will be followed");
    }

    // Open database
    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    info!(?db_path, "Opening database");
    let db = Database::new(DbConfig::new(&db_path)).await?;
    if !db.health_check().await {
        return Err(format!("database at {} is not usable", db_path.display()).into());
    }

    // Shared state and clients
    let ctx = SyncContext::open(&db, config.engine.persist_debounce()).await?;
    let client = RestClient::new(endpoints, config.gateway.connect_timeout())?;

    let mut engines = Vec::with_capacity(config.collections.len());
    for collection in &config.collections {
        let engine = SyncEngine::open(
            ctx.clone(),
            client.clone(),
            &db,
            &config.engine,
            CollectionOptions::from_config(collection),
        )
        .await?;
        engines.push(engine);
    }

    let gateway = Gateway::spawn(GatewayConfig::from_sync_config(&config), client, ctx.clone());

    shutdown_signal().await;

    // Stop the producer first so no new events arrive mid-shutdown
    if let Err(e) = gateway.shutdown().await {
        warn!(error = %e, "Gateway already stopped");
    }
    let mut state = gateway.subscribe_state();
    let stopped = tokio::time::timeout(
        GATEWAY_STOP_TIMEOUT,
        state.wait_for(|s| *s == ConnectionState::Disconnected),
    )
    .await;
    if stopped.is_err() {
        warn!("Gateway did not stop in time");
    }

    for engine in &engines {
        if let Err(e) = engine.shutdown().await {
            warn!(collection = %engine.name(), error = %e, "Engine shutdown failed");
        }
    }

    ctx.flush().await?;
    db.close().await;

    info!("Agent shutdown complete");
    Ok(())
}

/// Initializes the tracing subscriber for structured logging.
///
/// ## Log Levels
/// - `RUST_LOG=debug` - Show debug messages
/// - `RUST_LOG=forrest=trace` - Trace the forrest crates only
/// - Default: INFO, DEBUG for forrest, WARN for sqlx
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,forrest=debug,sqlx=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown...");
}
