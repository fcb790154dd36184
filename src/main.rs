// src/main.rs

//! The main entry point for the Ringmaster control plane.

use anyhow::Result;
use ringmaster::config::Config;
use ringmaster::core::client::{CachedProvider, HttpClientFactory};
use ringmaster::core::cluster;
use ringmaster::core::healthcheck;
use ringmaster::core::store::{MemorySecretStore, MemoryStore};
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::filter::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("Ringmaster version {VERSION}");
        return Ok(());
    }

    // The configuration path can be provided via a --config flag; otherwise
    // it defaults to "config.toml". A missing default file runs on defaults.
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("config.toml");

    let config = if Path::new(config_path).exists() {
        match Config::from_file(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load configuration from \"{config_path}\": {e}");
                std::process::exit(1);
            }
        }
    } else {
        Config::default()
    };

    let log_level = env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .compact()
        .with_ansi(true)
        .init();

    info!("Starting Ringmaster {VERSION}");

    // The document and secret stores are in-memory placeholders; production
    // deployments plug persistent implementations behind the same traits.
    let store = MemoryStore::new();
    let secrets = MemorySecretStore::new();

    let factory = Arc::new(HttpClientFactory::new(config.client.clone()));
    let provider = Arc::new(CachedProvider::new(
        store.clone(),
        secrets.clone(),
        factory.clone(),
    ));
    let registry = Arc::new(cluster::Service::new(
        store.clone(),
        secrets.clone(),
        provider.clone(),
        factory,
    ));
    let health = Arc::new(healthcheck::Service::new(
        provider.clone(),
        secrets.clone(),
        config.healthcheck.clone(),
    ));
    registry.add_listener(health.clone());

    // Repair and backup runs are driven through the scheduler seam; the
    // process itself keeps probing registered clusters until shutdown.
    let mut timer = tokio::time::interval(Duration::from_secs(15));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            _ = timer.tick() => {
                let clusters = match registry.list_clusters(None).await {
                    Ok(clusters) => clusters,
                    Err(e) => {
                        warn!(error = %e, "Listing clusters failed");
                        continue;
                    }
                };
                for c in clusters {
                    match health.status(c.id).await {
                        Ok(statuses) => {
                            for s in statuses {
                                info!(
                                    cluster = %c.label(),
                                    dc = %s.dc,
                                    host = %s.host,
                                    status = %s.cql_status,
                                    rtt_ms = s.rtt_ms,
                                    "Node status"
                                );
                            }
                        }
                        Err(e) => {
                            warn!(cluster = %c.label(), error = %e, "Health check failed");
                        }
                    }
                }
            }
        }
    }

    Ok(())
}
