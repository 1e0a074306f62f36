use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

mod app;
mod auth;
mod http;
mod sse;
mod sync;
mod turn;

#[cfg(test)]
mod tests;

#[derive(Parser)]
#[command(name = "arbor-gateway", about = "Arbor chat backend gateway")]
struct Args {
    /// Path to arbor.toml (default: ~/.arbor/arbor.toml)
    #[arg(long)]
    config: Option<String>,
    /// Override the SQLite database path.
    #[arg(long)]
    db: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "arbor_gateway=info,tower_http=debug".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = arbor_core::config::ArborConfig::load(args.config.as_deref())
        .unwrap_or_else(|e| {
            warn!("config load failed ({e}), using defaults");
            arbor_core::config::ArborConfig::default()
        });
    if let Some(db) = args.db {
        config.database.path = db;
    }

    if let Some(dir) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(dir)?;
    }
    let store = Arc::new(arbor_store::Store::open(&config.database.path)?);

    // Recover placeholders left behind by a previous crash mid-stream.
    let swept = store.sweep_stale_streaming(arbor_core::config::RECOVERY_GRACE_SECS)?;
    if swept > 0 {
        info!(swept, "marked stale streaming messages as errored");
    }

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;
    let state = Arc::new(app::AppState::new(
        config,
        store,
        Arc::new(arbor_agent::registry::HttpClientRegistry::new()),
    ));
    let router = app::build_router(Arc::clone(&state));

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!("arbor gateway listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Teardown: close subscriber channels and MCP sessions.
    state.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
