//! lazy-mirror - a lazy caching mirror for npm package registries

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod config;

use config::FileConfig;
use mirror_api::{AppState, create_router};
use mirror_core::{FreshnessMemo, PackageResolver};
use mirror_proxy::RegistryClient;
use mirror_storage::CacheStore;

/// Lazy caching mirror for npm package registries
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/default.toml")]
    config: String,

    /// Bind address
    #[arg(long, env = "LAZY_MIRROR_BIND")]
    bind: Option<String>,

    /// Port
    #[arg(short, long, env = "LAZY_MIRROR_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let file = FileConfig::load(&args.config)?;
    init_logging(&file.logging.level);

    info!("Starting lazy-mirror v{}", env!("CARGO_PKG_VERSION"));

    let bind_address = args.bind.unwrap_or_else(|| file.server.bind_address.clone());
    let port = args.port.unwrap_or(file.server.port);

    // Resolve the full configuration, including outbound proxy discovery,
    // before any request-handling component exists.
    let (mirror_config, client_config) = config::resolve(&file, port)?;
    let mirror_config = Arc::new(mirror_config);
    let upstream_host = client_config.host.clone();

    tokio::fs::create_dir_all(&mirror_config.cache_dir).await?;

    let store = Arc::new(CacheStore::new(
        &mirror_config.cache_dir,
        mirror_config.cache_expiry,
    ));
    let memo = Arc::new(FreshnessMemo::new(mirror_config.cache_expiry));
    let client = Arc::new(RegistryClient::new(client_config)?);
    let resolver = Arc::new(PackageResolver::new(
        store.clone(),
        memo.clone(),
        client.clone(),
        mirror_config.clone(),
    ));

    let state = AppState::new(resolver, store, memo, client, mirror_config.clone());
    let app = create_router(state).layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", bind_address, port).parse()?;
    info!(
        "Lazy mirror is listening @ {} (external host: {}:{})",
        addr, mirror_config.server_address, mirror_config.real_external_port
    );
    info!("Upstream registry: {}", upstream_host);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

/// Initialize logging
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C handler");
    info!("Shutdown signal received");
}
