use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use glimpse_protocol::credentials::parse_credentials;
use glimpse_viewer::app;

/// Headless viewing client for glimpse sessions.
///
/// Joins a session with pasted presenter credentials, composites the
/// incoming frame stream, and can write periodic canvas snapshots for
/// inspection.
#[derive(Parser, Debug)]
#[command(name = "glimpse-viewer", version, about)]
struct Cli {
    /// Relay address (host:port).
    #[arg(long, default_value = "127.0.0.1:9550")]
    relay: String,

    /// Presenter credentials ("ID: x / Password: y", "id password",
    /// or two lines). Read from stdin when omitted.
    #[arg(long)]
    credentials: Option<String>,

    /// Display id to watch; the primary display when omitted.
    #[arg(long)]
    display: Option<String>,

    /// Directory to write periodic canvas snapshots into.
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,

    /// Seconds between snapshots.
    #[arg(long, default_value_t = 5)]
    snapshot_interval: u64,

    /// Paint red borders around applied delta rectangles.
    #[arg(long)]
    debug_overlay: bool,

    /// Display name shown to the presenter.
    #[arg(long, default_value = "glimpse-viewer")]
    name: String,
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

    let raw = match cli.credentials {
        Some(raw) => raw,
        None => {
            tracing::info!("Paste the presenter credentials, then close stdin (Ctrl-D)");
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("reading credentials from stdin")?;
            buf
        }
    };
    let Some(credentials) = parse_credentials(&raw) else {
        bail!("could not parse credentials; expected an id and a password");
    };

    tracing::info!(relay = %cli.relay, "Starting glimpse-viewer");

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
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
        signal_token.cancel();
    });

    app::run(
        app::ViewerOptions {
            relay: cli.relay,
            display_name: cli.name,
            credentials,
            display_id: cli.display,
            snapshot_dir: cli.snapshot_dir,
            snapshot_interval: Duration::from_secs(cli.snapshot_interval.max(1)),
            debug_overlay: cli.debug_overlay,
        },
        shutdown,
    )
    .await
    .context("viewer main loop error")
}
