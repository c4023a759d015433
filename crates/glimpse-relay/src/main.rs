use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use glimpse_relay::{config, server};

/// Relay service for glimpse sessions.
///
/// Issues presenter credentials, owns the authoritative session state,
/// and routes opaque messages between a presenter and its viewers with
/// per-viewer frame coalescing.
#[derive(Parser, Debug)]
#[command(name = "glimpse-relay", version, about)]
struct Cli {
    /// Address to bind the relay to (overrides the config file).
    #[arg(long)]
    bind: Option<String>,

    /// Path to the relay configuration file (TOML).
    #[arg(long, short)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = config::load(cli.config.as_deref())?;
    if let Some(bind) = cli.bind {
        cfg.bind = bind;
    }

    tracing::info!(bind = %cfg.bind, "Starting glimpse-relay");
    let server = server::RelayServer::bind(&cfg.bind).await?;

    let shutdown = async {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, shutting down");
            }
        }
    };

    tokio::select! {
        result = server.serve() => {
            result.context("relay accept loop error")?;
        }
        () = shutdown => {
            tracing::info!("Relay stopped");
        }
    }

    Ok(())
}
