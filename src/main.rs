//! FFS Server
//!
//! Content-addressed file transfer service with resumable, deduplicated
//! uploads and path-based access rules.

use std::net::SocketAddr;

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ffs_server::access::{load_rules_file, AccessRuleRepository};
use ffs_server::config::Config;
use ffs_server::db;
use ffs_server::routes;
use ffs_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "ffs_server=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("Invalid configuration")?;

    tracing::info!("Starting FFS Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("File root: {}", config.storage.fs_root.display());
    tracing::info!("Packet root: {}", config.storage.packet_root.display());
    tracing::info!(
        block_size = config.transfer.block_size,
        packet_ttl_hours = config.transfer.packet_ttl_hours,
        "Transfer settings"
    );

    tokio::fs::create_dir_all(&config.storage.fs_root)
        .await
        .context("Failed to create file root")?;
    tokio::fs::create_dir_all(&config.storage.packet_root)
        .await
        .context("Failed to create packet root")?;

    // Initialize database
    let db_pool = db::create_pool(&config.database.url)
        .await
        .context("Failed to initialize database")?;
    tracing::info!("Database initialized at {}", config.database.url);

    // Seed access rules
    let rules = AccessRuleRepository::new(&db_pool);
    if let Some(path) = &config.transfer.access_rules_file {
        let seed = load_rules_file(path)
            .await
            .with_context(|| format!("Failed to read access rules from {}", path.display()))?;
        rules.replace_all(&seed).await.context("Failed to seed access rules")?;
    }
    let policy = rules.policy().await.context("Stored access rules are invalid")?;
    tracing::info!("Loaded {} access rules", policy.len());

    // Create application state
    let app_state = AppState::new(config.clone(), db_pool);

    if let Some(period) = config.transfer.sweep_interval() {
        tracing::info!("Background packet sweep every {:?}", period);
        app_state.transfer().clone().start_sweep_task(period);
    }

    let app = routes::app(app_state);

    // Start server with graceful shutdown
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid listen address")?;
    tracing::info!("FFS Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
