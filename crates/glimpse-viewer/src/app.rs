//! Viewer session driving.
//!
//! Connects with pasted presenter credentials, picks a display, feeds
//! received frames to the compositor, and (optionally) writes periodic
//! canvas snapshots to disk. The GUI shell lives elsewhere; this app
//! is the headless core it drives.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use glimpse_capture::pacing::IntervalEstimator;
use glimpse_capture::pool::BufferPool;
use glimpse_protocol::client::{RelayClient, RelayClientConfig, RelayClientEvent};
use glimpse_protocol::connection::{Connection, ConnectionEvent};
use glimpse_protocol::credentials::Credentials;
use glimpse_protocol::messages::DisplayDescriptor;
use glimpse_protocol::rpc::ServerEvent;

use crate::compositor::FrameCompositor;

/// Viewer behavior knobs.
pub struct ViewerOptions {
    pub relay: String,
    pub display_name: String,
    pub credentials: Credentials,
    /// Preferred display id; primary wins when absent.
    pub display_id: Option<String>,
    /// Directory for periodic canvas snapshots; disabled when absent.
    pub snapshot_dir: Option<PathBuf>,
    pub snapshot_interval: Duration,
    pub debug_overlay: bool,
}

/// Run the viewer until `shutdown` fires or the session stops.
pub async fn run(options: ViewerOptions, shutdown: CancellationToken) -> Result<()> {
    let (client, mut relay_events) = RelayClient::connect(RelayClientConfig {
        addr: options.relay.clone(),
        display_name: options.display_name.clone(),
    });

    // Wait for our own credentials; they carry our client id.
    let client_id = wait_for_client_id(&mut relay_events, &shutdown)
        .await
        .context("relay never assigned credentials")?;

    let connection_id = match client
        .connect_to(&options.credentials.username, &options.credentials.password)
        .await
        .context("relay request failed")?
    {
        Ok(connection_id) => connection_id,
        Err(e) => bail!("connect failed: {e:?}"),
    };
    tracing::info!(%connection_id, "Joined session");

    let (connection, mut session_events) = Connection::viewer(
        connection_id,
        client_id,
        Arc::clone(&client) as Arc<dyn glimpse_protocol::connection::MessageOutlet>,
    );
    connection.request_display_list().await.context("display list request")?;

    let compositor = FrameCompositor::new(BufferPool::new(), options.debug_overlay);
    let mut intervals = IntervalEstimator::new();
    let mut snapshot_tick = tokio::time::interval(options.snapshot_interval);
    snapshot_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut frames_seen: u64 = 0;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,

            event = relay_events.recv() => {
                let Some(event) = event else { break };
                match event {
                    RelayClientEvent::Event(ServerEvent::MessageReceived {
                        sender_client_id,
                        data,
                        ..
                    }) => connection.handle_message(&sender_client_id, &data),
                    RelayClientEvent::Event(ServerEvent::ConnectionStopped { .. }) => {
                        tracing::info!("Presenter stopped the session");
                        break;
                    }
                    RelayClientEvent::Disconnected => {
                        tracing::warn!("Relay connection lost, reconnecting");
                    }
                    _ => {}
                }
            }

            event = session_events.recv() => {
                let Some(event) = event else { break };
                match event {
                    ConnectionEvent::DisplaysChanged(displays) => {
                        select_display(&connection, &displays, options.display_id.as_deref())
                            .await?;
                    }
                    ConnectionEvent::FrameReceived(frame) => {
                        frames_seen += 1;
                        match compositor.apply_frame(&frame) {
                            Ok(true) => {
                                if let Some(ms) = intervals.tick() {
                                    if frames_seen % 100 == 0 {
                                        tracing::debug!(
                                            frame = frame.frame_number,
                                            interval_ms = format!("{ms:.1}"),
                                            "Frame cadence"
                                        );
                                    }
                                }
                            }
                            Ok(false) => {}
                            Err(e) => tracing::warn!("Frame apply failed: {e}"),
                        }
                    }
                    ConnectionEvent::Closed => break,
                    _ => {}
                }
            }

            _ = snapshot_tick.tick() => {
                if let Some(dir) = options.snapshot_dir.as_deref() {
                    if let Err(e) = write_snapshot(&compositor, dir) {
                        tracing::warn!("Snapshot failed: {e}");
                    }
                }
            }
        }
    }

    connection.close();
    client.stop();
    Ok(())
}

async fn wait_for_client_id(
    events: &mut mpsc::UnboundedReceiver<RelayClientEvent>,
    shutdown: &CancellationToken,
) -> Option<String> {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => return None,
            event = events.recv() => match event? {
                RelayClientEvent::Event(ServerEvent::CredentialsAssigned { client_id, .. }) => {
                    return Some(client_id);
                }
                _ => {}
            },
        }
    }
}

/// Pick the requested display, or the primary, or the first.
async fn select_display(
    connection: &Connection,
    displays: &[DisplayDescriptor],
    preferred: Option<&str>,
) -> Result<()> {
    if connection.selected_display().is_some() {
        return Ok(());
    }
    let chosen = preferred
        .and_then(|id| displays.iter().find(|d| d.id == id))
        .or_else(|| displays.iter().find(|d| d.is_primary))
        .or_else(|| displays.first());
    let Some(display) = chosen else {
        tracing::warn!("Presenter advertised no displays");
        return Ok(());
    };
    let display_id = &display.id;
    let display_name = &display.friendly_name;
    tracing::info!(display = %display_id, name = %display_name, "Selecting display");
    connection
        .select_display(&display.id)
        .await
        .context("display selection")?;
    Ok(())
}

/// Write the current canvas as a JPEG into `dir`.
fn write_snapshot(compositor: &FrameCompositor, dir: &std::path::Path) -> Result<()> {
    let Some((bgra, width, height)) = compositor.canvas_snapshot() else {
        return Ok(());
    };

    let mut rgb = vec![0u8; (width * height) as usize * 3];
    for (src, dst) in bgra.chunks_exact(4).zip(rgb.chunks_exact_mut(3)) {
        dst[0] = src[2];
        dst[1] = src[1];
        dst[2] = src[0];
    }

    std::fs::create_dir_all(dir)?;
    let path = dir.join("canvas.jpg");
    let file = std::fs::File::create(&path)?;
    let mut writer = std::io::BufWriter::new(file);
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut writer, 85).encode(
        &rgb,
        width,
        height,
        image::ExtendedColorType::Rgb8,
    )?;
    tracing::debug!(path = %path.display(), "Snapshot written");
    Ok(())
}
