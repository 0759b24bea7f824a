//! Progress Tracking (lumen-pt) - Main entry point
//!
//! Serves tier-partitioned module progress, points, levels, streaks and
//! enrollment summaries over HTTP, with progress events as SSE.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use lumen_common::catalog::{CatalogProvider, StaticCatalog};
use lumen_common::config::{resolve_root_folder, TomlConfig, ROOT_FOLDER_ENV};
use lumen_common::db::init_database;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lumen_pt::{build_router, AppState};

/// Default listening port when neither CLI, env nor config names one
const DEFAULT_PORT: u16 = 5810;

/// Command-line arguments for lumen-pt
#[derive(Parser, Debug)]
#[command(name = "lumen-pt")]
#[command(about = "Progress tracking microservice for Lumen")]
#[command(version)]
struct Args {
    /// Port to listen on (overrides config)
    #[arg(short, long, env = "LUMEN_PT_PORT")]
    port: Option<u16>,

    /// Root folder holding the database
    #[arg(short, long, env = "LUMEN_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,

    /// Config file (default: ~/.config/lumen/config.toml, then /etc/lumen/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = TomlConfig::load_or_default(args.config.as_deref());

    // RUST_LOG wins over the configured level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("lumen_pt={0},lumen_common={0},tower_http=info", config.logging.level)
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting Lumen Progress Tracking (lumen-pt) v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let root_folder = resolve_root_folder(args.root_folder.as_deref(), ROOT_FOLDER_ENV, &config);
    let db_path = config.database_path(&root_folder);
    info!("Root folder: {}", root_folder.display());
    info!("Database path: {}", db_path.display());

    let pool = init_database(&db_path)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;

    let catalog: Arc<dyn CatalogProvider> = match &config.catalog_path {
        Some(path) => Arc::new(
            StaticCatalog::load(path)
                .with_context(|| format!("Failed to load catalog {}", path.display()))?,
        ),
        None => {
            info!("No catalog_path configured, using built-in catalog");
            Arc::new(StaticCatalog::builtin())
        }
    };

    info!(
        "Default tier '{}', duplicate policy {:?}",
        config.tiers.default, config.tiers.duplicate_policy
    );

    let state = AppState::new(pool.clone(), catalog, &config)
        .context("Invalid level curve configuration")?;
    let app = build_router(state);

    let port = args.port.or(config.port).unwrap_or(DEFAULT_PORT);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("lumen-pt listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    pool.close().await;
    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
