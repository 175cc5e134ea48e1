//! kerf-gateway: encrypted, attested, multiplexed request gateway.
//!
//! Clients hold one long-lived binary websocket, complete a Noise-XX
//! handshake bound to a TEE attestation, and issue many concurrent
//! HTTP-like requests through the tunnel.

mod attestation;
mod config;
mod connection;
mod handlers;
mod noise;
mod router;
mod server;
mod streaming;

use clap::Parser;
use config::GatewayConfig;
use server::GatewayServer;
use std::path::PathBuf;
use tracing::{error, info};

/// kerf-gateway — encrypted request gateway
#[derive(Parser, Debug)]
#[command(name = "kerf-gateway", version, about = "Encrypted request gateway")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "/etc/kerf/gateway.toml")]
    config: String,

    /// Bearer token secret (overrides the config file)
    #[arg(long)]
    jwt_secret: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting kerf-gateway");

    let config_path = PathBuf::from(&cli.config);
    let config = match GatewayConfig::load(
        Some(&config_path),
        cli.port,
        cli.jwt_secret.as_deref(),
    ) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let gateway = match GatewayServer::new(config) {
        Ok(gateway) => gateway,
        Err(e) => {
            error!(error = %e, "failed to create server");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = gateway.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("kerf-gateway stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
