//! SysBus register gateway.
//!
//! Owns the bus to the heating controller, keeps a persistent mirror of its
//! registers and serves them over HTTP.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use sysbus_gateway::http::HttpServer;
use sysbus_gateway::{
    BusScheduler, BusSettings, Gateway, GatewayConfig, Reconciler, RegisterMap, RegisterStore,
};
use tokio::sync::watch;
use tracing::{error, info};

/// Register gateway between a SysBus heating controller and a REST API.
#[derive(Parser, Debug)]
#[command(name = "sysbus-gateway")]
#[command(about = "Mirrors SysBus controller registers and serves them over HTTP")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "gateway.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = GatewayConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    // Initialize logging
    let mut log_config = config.logging.clone();
    if let Some(level) = args.log_level {
        log_config.level = level;
    }
    sysbus_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting sysbus-gateway");
    info!("Loaded configuration from {:?}", args.config);

    let map = Arc::new(RegisterMap::from_config(&config));
    let store = Arc::new(
        RegisterStore::open(&config.store.path, &map.store_keys())
            .await
            .with_context(|| format!("Failed to open register store {:?}", config.store.path))?,
    );

    let bus = Arc::new(BusScheduler::new(
        config.bus.connection.clone(),
        BusSettings::from(&config.bus),
    ));
    let settings = bus.settings();
    info!(
        timeout_ms = settings.timeout.as_millis() as u64,
        max_retries = settings.max_retries,
        "Bus on {:?}, slave(s) {:?}",
        config.bus.connection,
        config.bus.slave_ids
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler = Reconciler::new(
        bus.clone(),
        store.clone(),
        map.clone(),
        config.bus.poll_interval(),
        shutdown_rx.clone(),
    );
    let gateway = Gateway::new(store.clone(), map, bus, &reconciler);
    let engine = tokio::spawn(reconciler.run());

    let http = if config.http.enabled {
        let addr: SocketAddr = config
            .http
            .listen
            .parse()
            .with_context(|| format!("Invalid HTTP listen address '{}'", config.http.listen))?;
        let server = HttpServer::new(gateway, addr);
        Some(tokio::spawn(server.run(shutdown_rx)))
    } else {
        info!("HTTP API disabled");
        None
    };

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    let _ = shutdown_tx.send(true);

    // The current bus transaction completes; unsent writes stay dirty
    if let Err(e) = engine.await {
        error!("Reconciler task failed: {}", e);
    }

    if let Some(http) = http {
        match http.await {
            Ok(Err(e)) => error!("HTTP server error: {}", e),
            Err(e) => error!("HTTP server task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }

    store.close().await;
    info!(path = %store.path().display(), "Register store closed");
    info!("sysbus-gateway stopped");

    Ok(())
}
