//! relay - real-time WebSocket relay
//!
//! Pushes live change feeds from an embedded document store to browser
//! clients, one cancellable subscription per topic per connection.

use clap::Parser;
use relay_server::metrics::run_metrics_server;
use relay_server::{handlers, CommandRouter, Config, Metrics, Server, ServerConfig};
use relay_store::Store;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Real-time WebSocket relay backed by a live document store")]
#[command(version)]
struct Args {
    /// Path to a YAML config file
    #[arg(short, long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match Config::load(args.config.as_deref()) {
        Ok(c) => {
            if let Some(ref path) = args.config {
                tracing::info!("Loaded config from {}", path.display());
            }
            c
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    tracing::info!("Starting relay");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Max connections: {}", config.network.max_connections);
    tracing::info!("  Database: {}", config.store.database);
    match config.store.data_dir {
        Some(ref dir) => tracing::info!("  Data directory: {}", dir.display()),
        None => tracing::info!("  Data directory: none (memory only)"),
    }

    let store = match Store::open(config.store.store_config()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!("Failed to open store: {}", e);
            return Err(e.into());
        }
    };

    let mut router = CommandRouter::new();
    handlers::register_all(&mut router);

    let mut server_config = ServerConfig::new(config.network.bind_addr)
        .with_max_connections(config.network.max_connections)
        .with_outbound_capacity(config.network.outbound_capacity);

    let metrics = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        server_config = server_config.with_metrics(metrics.clone());
        tracing::info!("  Metrics: enabled on {}", config.metrics.bind_addr);
        Some(metrics)
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    let server = Arc::new(Server::new(server_config, store.clone(), Arc::new(router)));

    let metrics_handle = metrics.map(|metrics| {
        let addr = config.metrics.bind_addr;
        let shutdown = server.shutdown_token();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown).await {
                tracing::error!("Metrics server error: {}", e);
            }
        })
    });

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Blocks until shutdown and every connection has been torn down
    let result = server.run().await;
    // Stops the metrics server when the listener failed to bind
    server.shutdown();

    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    if let Err(e) = store.flush() {
        tracing::error!("Failed to flush store on shutdown: {}", e);
    }

    result?;
    tracing::info!("Server stopped");
    Ok(())
}
