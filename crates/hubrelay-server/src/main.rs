//! hubrelay-server: cloud relay for hubs behind NAT.
//!
//! Hubs keep a WebSocket open to the relay; HTTP requests arriving at the
//! relay are tunneled over that connection and answered with the hub's
//! reply.

mod auth;
mod config;
mod connector;
mod server;
mod transport;
mod tunnel;

use clap::Parser;
use config::ServerConfig;
use server::RelayServer;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// hubrelay-server: tunnel HTTP requests to connected hubs
#[derive(Parser, Debug)]
#[command(name = "hubrelay-server", version, about = "Cloud relay for hubs behind NAT")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.hubrelay/config.toml")]
    config: String,

    /// Bind address (overrides config)
    #[arg(long)]
    bind: Option<String>,

    /// Listen port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting hubrelay-server");

    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(Some(&config_path), cli.bind.as_deref(), cli.port)
    {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let relay = match RelayServer::new(server_config) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to create server");
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            info!("received shutdown signal");
            shutdown.cancel();
        }
    });

    if let Err(e) = relay.run(shutdown).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("hubrelay-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
