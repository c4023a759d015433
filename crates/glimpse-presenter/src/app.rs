//! Presenter application wiring.
//!
//! Connects the relay client, answers session events, and supervises
//! capture through the [`CaptureManager`]. One session is active at a
//! time; a new `ConnectionStarted` after a stop builds a fresh one.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use glimpse_capture::cpu::CpuGrabber;
use glimpse_capture::frame::DisplayInfo;
use glimpse_capture::grabber::ScreenGrabber;
use glimpse_capture::pool::BufferPool;
use glimpse_capture::service::ScreenshotService;
use glimpse_encode::FrameEncoder;
use glimpse_input::{dispatch_input, InputSink};
use glimpse_protocol::client::{RelayClient, RelayClientConfig, RelayClientEvent};
use glimpse_protocol::connection::{Connection, ConnectionEvent};
use glimpse_protocol::messages::{DisplayDescriptor, KeyModifiers, MouseButton};
use glimpse_protocol::rpc::ServerEvent;

use crate::config::PresenterConfig;
use crate::manager::CaptureManager;
use crate::testpattern::TestPatternSource;

/// Input sink that only logs, for hosts without an injection backend.
pub struct LogInputSink;

impl InputSink for LogInputSink {
    fn mouse_move(&self, x: i32, y: i32) {
        tracing::trace!(x, y, "Mouse move (not injected)");
    }
    fn mouse_button(&self, button: MouseButton, pressed: bool, x: i32, y: i32) {
        tracing::debug!(?button, pressed, x, y, "Mouse button (not injected)");
    }
    fn mouse_wheel(&self, dx: f32, dy: f32, x: i32, y: i32) {
        tracing::trace!(dx, dy, x, y, "Mouse wheel (not injected)");
    }
    fn key(&self, scan_code: u16, extended: bool, _modifiers: KeyModifiers, pressed: bool) {
        tracing::debug!(scan_code, extended, pressed, "Key (not injected)");
    }
}

fn descriptor(display: &DisplayInfo) -> DisplayDescriptor {
    DisplayDescriptor {
        id: display.id.clone(),
        friendly_name: display.friendly_name.clone(),
        is_primary: display.is_primary,
        left: display.bounds.left,
        top: display.bounds.top,
        width: display.width(),
        height: display.height(),
    }
}

struct ActiveSession {
    connection: Arc<Connection>,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    manager: CaptureManager,
}

/// Capture dependencies shared across sessions.
pub struct CaptureStack {
    pub pool: Arc<BufferPool>,
    pub service: Arc<ScreenshotService>,
    pub encoder: Arc<FrameEncoder>,
    pub displays: Vec<DisplayInfo>,
    pub input: Arc<dyn InputSink>,
}

impl CaptureStack {
    /// Default stack: CPU grabbing over the built-in test pattern.
    /// Real OS frame sources and the recorder grabber slot in here.
    #[must_use]
    pub fn with_test_pattern(jpeg_quality: u8) -> Self {
        let pool = BufferPool::new();
        let grabbers: Vec<Arc<dyn ScreenGrabber>> = vec![Arc::new(CpuGrabber::new(
            Arc::new(TestPatternSource::new()),
            Arc::clone(&pool),
        ))];
        Self {
            service: Arc::new(ScreenshotService::new(grabbers)),
            encoder: Arc::new(FrameEncoder::new(jpeg_quality, Arc::clone(&pool))),
            pool,
            displays: vec![TestPatternSource::display()],
            input: Arc::new(LogInputSink),
        }
    }

    /// Stack delegating capture and input injection to a privileged
    /// recorder over its session pipe.
    pub async fn with_recorder(
        session_id: &str,
        pipe_dir: &str,
        jpeg_quality: u8,
    ) -> Result<Self> {
        use anyhow::Context;
        use glimpse_protocol::ipc::session_pipe_name;

        use crate::recorder::{PipeRecorderChannel, RecorderChannel, RecorderGrabber, RecorderInputSink};

        let path = std::path::Path::new(pipe_dir).join(session_pipe_name(session_id));
        let stream = tokio::net::UnixStream::connect(&path)
            .await
            .with_context(|| format!("connecting recorder pipe {}", path.display()))?;
        let channel: Arc<dyn RecorderChannel> = Arc::new(PipeRecorderChannel::new(stream));

        let pool = BufferPool::new();
        let grabber = Arc::new(RecorderGrabber::new(
            Arc::clone(&channel),
            Arc::clone(&pool),
            None,
        ));
        let displays: Vec<DisplayInfo> = grabber
            .displays()
            .await
            .context("recorder display enumeration")?
            .iter()
            .map(|d| DisplayInfo {
                id: d.id.clone(),
                friendly_name: d.friendly_name.clone(),
                is_primary: d.is_primary,
                bounds: glimpse_capture::frame::Rect::from_size(d.left, d.top, d.width, d.height),
            })
            .collect();
        if displays.is_empty() {
            anyhow::bail!("recorder reported no displays");
        }

        Ok(Self {
            service: Arc::new(ScreenshotService::new(vec![
                grabber as Arc<dyn ScreenGrabber>
            ])),
            encoder: Arc::new(FrameEncoder::new(jpeg_quality, Arc::clone(&pool))),
            pool,
            displays,
            input: Arc::new(RecorderInputSink::new(channel)),
        })
    }
}

/// Run the presenter until `shutdown` fires.
pub async fn run(
    config: PresenterConfig,
    stack: CaptureStack,
    shutdown: CancellationToken,
) -> Result<()> {
    let (client, mut relay_events) = RelayClient::connect(RelayClientConfig {
        addr: config.relay.clone(),
        display_name: config.display_name.clone(),
    });

    let mut client_id = String::new();
    let mut session: Option<ActiveSession> = None;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,

            event = relay_events.recv() => {
                let Some(event) = event else { break };
                match event {
                    RelayClientEvent::Connected => {}
                    RelayClientEvent::Disconnected => {
                        // The relay drops our session with the socket.
                        if let Some(active) = session.take() {
                            active.connection.close();
                            active.manager.dispose().await;
                        }
                    }
                    RelayClientEvent::Event(event) => {
                        handle_server_event(
                            event,
                            &client,
                            &config,
                            &stack,
                            &mut client_id,
                            &mut session,
                        )
                        .await;
                    }
                }
            }

            event = next_session_event(&mut session) => {
                let Some(event) = event else { continue };
                handle_session_event(event, &stack, &session).await;
            }
        }
    }

    if let Some(active) = session.take() {
        active.connection.close();
        active.manager.dispose().await;
    }
    client.stop();
    let metrics = stack.pool.metrics();
    tracing::debug!(?metrics, "Buffer pool at shutdown");
    Ok(())
}

async fn next_session_event(session: &mut Option<ActiveSession>) -> Option<ConnectionEvent> {
    match session {
        Some(active) => active.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn handle_server_event(
    event: ServerEvent,
    client: &Arc<RelayClient>,
    config: &PresenterConfig,
    stack: &CaptureStack,
    client_id: &mut String,
    session: &mut Option<ActiveSession>,
) {
    match event {
        ServerEvent::CredentialsAssigned {
            client_id: id,
            username,
            password,
        } => {
            *client_id = id;
            // The operator reads these off the log to hand to viewers.
            tracing::info!(%username, %password, "Session credentials assigned");
        }

        ServerEvent::ConnectionStarted {
            connection_id,
            is_presenter,
        } => {
            if !is_presenter {
                tracing::warn!(%connection_id, "Viewer-role session on a presenter, ignoring");
                return;
            }
            let (connection, events) = Connection::presenter(
                connection_id,
                client_id.clone(),
                Arc::clone(client) as Arc<dyn glimpse_protocol::connection::MessageOutlet>,
            );
            let manager = CaptureManager::start(
                stack.displays.clone(),
                Arc::clone(&stack.service),
                Arc::clone(&stack.encoder),
                Arc::clone(&connection),
                config.capture.target_fps,
            );
            *session = Some(ActiveSession {
                connection,
                events,
                manager,
            });
            tracing::info!("Presenting started");
        }

        ServerEvent::ConnectionChanged { info } => {
            if let Some(active) = session.as_ref() {
                active.connection.apply_connection_info(&info);
            }
        }

        ServerEvent::ConnectionStopped { connection_id } => {
            if let Some(active) = session.take() {
                tracing::info!(%connection_id, "Session stopped");
                active.connection.close();
                active.manager.dispose().await;
            }
        }

        ServerEvent::MessageReceived {
            sender_client_id,
            data,
            ..
        } => {
            if let Some(active) = session.as_ref() {
                active.connection.handle_message(&sender_client_id, &data);
            }
        }

        ServerEvent::Reply { request_id, .. } => {
            tracing::debug!(request_id, "Unsolicited reply ignored");
        }
    }
}

async fn handle_session_event(
    event: ConnectionEvent,
    stack: &CaptureStack,
    session: &Option<ActiveSession>,
) {
    let Some(active) = session.as_ref() else { return };
    let descriptors: Vec<DisplayDescriptor> = stack.displays.iter().map(descriptor).collect();

    match event {
        ConnectionEvent::DisplayListRequested { viewer_id } => {
            if let Err(e) = active
                .connection
                .send_display_list(&viewer_id, descriptors)
                .await
            {
                tracing::warn!(%viewer_id, "Display list send failed: {e}");
            }
        }

        ConnectionEvent::ViewersChanged(viewers) => {
            // Keep every viewer's picker current after joins/leaves.
            for viewer in &viewers {
                if let Err(e) = active
                    .connection
                    .send_display_list(&viewer.client_id, descriptors.clone())
                    .await
                {
                    tracing::warn!(viewer = %viewer.client_id, "Display list send failed: {e}");
                }
            }
        }

        ConnectionEvent::InputReceived { viewer_id, message } => {
            let selected = active
                .connection
                .viewers()
                .ok()
                .and_then(|viewers| {
                    viewers
                        .into_iter()
                        .find(|v| v.client_id == viewer_id)
                        .and_then(|v| v.selected_display_id)
                });
            let Some(display_id) = selected else {
                tracing::debug!(%viewer_id, "Input from viewer without a selected display");
                return;
            };
            let Some(display) = stack.displays.iter().find(|d| d.id == display_id) else {
                return;
            };
            dispatch_input(stack.input.as_ref(), display, &message);
        }

        ConnectionEvent::Closed => {}

        ConnectionEvent::DisplaysChanged(_) | ConnectionEvent::FrameReceived(_) => {
            // Viewer-side events; never emitted for a presenter role.
        }
    }
}
