//! Edge router
//!
//! Accepts TCP connections on configured entry points and routes each one
//! by SNI, ALPN and client IP before any byte is consumed.
//!
//! # Architecture Overview
//!
//! ```text
//! Client
//!   → net::listener (entry point, connection limit)
//!   → net::starttls (optional preamble)
//!   → net::sniff (SNI, ALPN; bytes replayed)
//!   → routing::router
//!       ├─ plain TCP route ──────→ TCP proxy ──→ backend
//!       ├─ TLS passthrough ──────→ TCP proxy ──→ backend (still encrypted)
//!       ├─ TLS terminate ────────→ TCP proxy ──→ backend
//!       └─ HTTP / HTTPS host ────→ http::forwarder ──→ HTTP service
//!
//! Around it: config (TOML, watch), tls (stores, options),
//! lifecycle (startup, reload, drain), observability (logging).
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use edge_router::config::{load_config, ConfigWatcher};
use edge_router::lifecycle::{shutdown_signal, EdgeRouter, Shutdown};
use edge_router::net::UpgraderRegistry;
use edge_router::observability::init_logging;

#[derive(Debug, Parser)]
#[command(name = "edge-router", version, about = "TCP/TLS edge router")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "edge-router.toml")]
    config: PathBuf,

    /// Reload the configuration when the file changes.
    #[arg(short, long)]
    watch: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    init_logging(&config.observability).context("failed to initialize logging")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        entry_points = config.entry_points.len(),
        tcp_routers = config.tcp.routers.len(),
        http_routers = config.http.routers.len(),
        "edge-router starting"
    );

    let mut edge = EdgeRouter::start(config, UpgraderRegistry::with_defaults()).await?;
    let shutdown = Shutdown::new();
    let accept_loops = edge.serve(&shutdown);
    let edge = Arc::new(edge);

    // Keep the watcher alive for the life of the process.
    let _watcher = if cli.watch {
        let (watcher, mut updates) = ConfigWatcher::new(&cli.config);
        let handle = watcher.run().context("failed to watch configuration")?;
        let edge = Arc::clone(&edge);
        tokio::spawn(async move {
            while let Some(config) = updates.recv().await {
                if let Err(e) = edge.reload(config) {
                    tracing::error!(error = %e, "Reload failed, keeping current configuration");
                }
            }
        });
        Some(handle)
    } else {
        None
    };

    let signal = shutdown_signal().await;
    tracing::info!(signal, "Shutdown requested");

    let deadline = Duration::from_secs(edge.config().timeouts.shutdown_secs);
    shutdown.trigger();
    for handle in accept_loops {
        let _ = handle.await;
    }
    shutdown.drain(edge.tracker(), deadline).await;

    tracing::info!("Shutdown complete");
    Ok(())
}
