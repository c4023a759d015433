use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use glimpse_presenter::{app, config};

/// Screen sharing presenter for glimpse.
///
/// Captures displays, encodes changed regions as JPEG tiles, and
/// streams them through a glimpse-relay to connected viewers. Viewer
/// mouse and keyboard input comes back over the same session.
#[derive(Parser, Debug)]
#[command(name = "glimpse-presenter", version, about)]
struct Cli {
    /// Relay address (host:port); overrides the config file.
    #[arg(long)]
    relay: Option<String>,

    /// Display name shown to viewers.
    #[arg(long)]
    name: Option<String>,

    /// Target capture rate in frames per second.
    #[arg(long)]
    fps: Option<u32>,

    /// Path to the presenter configuration file (TOML).
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
    if let Some(relay) = cli.relay {
        cfg.relay = relay;
    }
    if let Some(name) = cli.name {
        cfg.display_name = name;
    }
    if let Some(fps) = cli.fps {
        cfg.capture.target_fps = fps;
    }

    tracing::info!(relay = %cfg.relay, fps = cfg.capture.target_fps, "Starting glimpse-presenter");

    let stack = if cfg.recorder.session_id.is_empty() {
        app::CaptureStack::with_test_pattern(cfg.encode.jpeg_quality)
    } else {
        match app::CaptureStack::with_recorder(
            &cfg.recorder.session_id,
            &cfg.recorder.pipe_dir,
            cfg.encode.jpeg_quality,
        )
        .await
        {
            Ok(stack) => {
                tracing::info!(session = %cfg.recorder.session_id, "Recorder capture active");
                stack
            }
            Err(e) => {
                tracing::warn!("Recorder unavailable: {e:#}");
                tracing::info!("Falling back to the built-in test pattern");
                app::CaptureStack::with_test_pattern(cfg.encode.jpeg_quality)
            }
        }
    };

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

    app::run(cfg, stack, shutdown)
        .await
        .context("presenter main loop error")
}
