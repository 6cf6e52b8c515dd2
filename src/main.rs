//! waltz - partitioned transaction log server
//!
//! Serves the Waltz data plane from memory, enforcing optimistic locking
//! against each partition's high-water mark.

use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use waltz_server::{Config, Server, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if WALTZ_CONFIG is set, then env overrides)
    let config_path = std::env::var("WALTZ_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(ref path) = config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // An explicitly named file must load
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            let config = Config::from_env();
            config.validate()?;
            config
        }
    };

    tracing::info!("Starting waltz server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Partitions: {}", config.cluster.num_partitions);
    tracing::info!("  Feed batch size: {}", config.cluster.feed_batch_size);
    if !config.cluster.unavailable_partitions.is_empty() {
        tracing::info!(
            "  Unavailable partitions: {:?}",
            config.cluster.unavailable_partitions
        );
    }

    let server = Arc::new(Server::new(ServerConfig::from(&config)));

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Blocks until shutdown
    server.run().await?;

    tracing::info!("Server stopped");
    Ok(())
}
