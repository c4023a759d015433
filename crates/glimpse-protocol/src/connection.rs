//! Client-side session object.
//!
//! One `Connection` exists per joined session and is the only place
//! that understands the typed envelopes: inbound payloads are decoded,
//! session state updated, and an event emitted; outbound operations
//! encode and hand off to the relay. The role is fixed at construction,
//! so viewer operations simply do not exist on a presenter connection's
//! state and vice versa.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::messages::{
    decode_message, encode_message, ChannelMessage, ClientId, CodecError, ConnectionId,
    DisplayDescriptor, FrameMessage, MessageDestination, MessageKind,
};
use crate::rpc::ConnectionInfo;

#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The operation does not exist for this connection's role.
    #[error("operation invalid for this role")]
    InvalidRole,
    #[error("connection is closed")]
    Closed,
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The relay transport rejected the send.
    #[error("relay send failed: {0}")]
    Send(String),
}

/// Sink for outbound session messages; implemented by the relay client.
#[async_trait]
pub trait MessageOutlet: Send + Sync {
    async fn send_message(
        &self,
        connection_id: &str,
        kind: MessageKind,
        data: Vec<u8>,
        destination: MessageDestination,
        targets: Option<Vec<ClientId>>,
    ) -> Result<(), ConnectionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Presenter,
    Viewer,
}

/// A viewer as tracked by the presenter side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerInfo {
    pub client_id: ClientId,
    pub display_name: String,
    /// Set once the viewer picked a display; frames for other displays
    /// are not sent to this viewer.
    pub selected_display_id: Option<String>,
}

/// Session happenings surfaced to the application layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Closed,
    ViewersChanged(Vec<ViewerInfo>),
    DisplaysChanged(Vec<DisplayDescriptor>),
    DisplayListRequested { viewer_id: ClientId },
    FrameReceived(FrameMessage),
    InputReceived { viewer_id: ClientId, message: ChannelMessage },
}

enum RoleState {
    Presenter {
        viewers: Mutex<Vec<ViewerInfo>>,
    },
    Viewer {
        displays: Mutex<Vec<DisplayDescriptor>>,
        selected: Mutex<Option<String>>,
    },
}

pub struct Connection {
    connection_id: ConnectionId,
    local_client_id: ClientId,
    outlet: Arc<dyn MessageOutlet>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    closed: AtomicBool,
    role: RoleState,
}

impl Connection {
    pub fn presenter(
        connection_id: ConnectionId,
        local_client_id: ClientId,
        outlet: Arc<dyn MessageOutlet>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                connection_id,
                local_client_id,
                outlet,
                events,
                closed: AtomicBool::new(false),
                role: RoleState::Presenter {
                    viewers: Mutex::new(Vec::new()),
                },
            }),
            rx,
        )
    }

    pub fn viewer(
        connection_id: ConnectionId,
        local_client_id: ClientId,
        outlet: Arc<dyn MessageOutlet>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                connection_id,
                local_client_id,
                outlet,
                events,
                closed: AtomicBool::new(false),
                role: RoleState::Viewer {
                    displays: Mutex::new(Vec::new()),
                    selected: Mutex::new(None),
                },
            }),
            rx,
        )
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    #[must_use]
    pub fn local_client_id(&self) -> &str {
        &self.local_client_id
    }

    #[must_use]
    pub fn role(&self) -> ConnectionRole {
        match self.role {
            RoleState::Presenter { .. } => ConnectionRole::Presenter,
            RoleState::Viewer { .. } => ConnectionRole::Viewer,
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark closed and fire `Closed`. Further operations fail.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.emit(ConnectionEvent::Closed);
        }
    }

    fn ensure_open(&self) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        Ok(())
    }

    fn emit(&self, event: ConnectionEvent) {
        // A dropped receiver only means the app is shutting down.
        let _ = self.events.send(event);
    }

    // ---- presenter operations ----

    /// Snapshot of the current viewer list.
    pub fn viewers(&self) -> Result<Vec<ViewerInfo>, ConnectionError> {
        match &self.role {
            RoleState::Presenter { viewers } => Ok(viewers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone()),
            RoleState::Viewer { .. } => Err(ConnectionError::InvalidRole),
        }
    }

    /// Send the display list to one viewer.
    pub async fn send_display_list(
        &self,
        viewer_id: &str,
        displays: Vec<DisplayDescriptor>,
    ) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        let RoleState::Presenter { .. } = &self.role else {
            return Err(ConnectionError::InvalidRole);
        };
        let message = ChannelMessage::DisplayList { displays };
        self.outlet
            .send_message(
                &self.connection_id,
                message.kind(),
                encode_message(&message)?,
                MessageDestination::SpecificClients,
                Some(vec![viewer_id.to_string()]),
            )
            .await
    }

    /// Send a frame to every viewer watching its display. A frame with
    /// no audience is silently skipped.
    pub async fn send_frame(&self, frame: FrameMessage) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        let RoleState::Presenter { viewers } = &self.role else {
            return Err(ConnectionError::InvalidRole);
        };
        let targets: Vec<ClientId> = viewers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .filter(|v| v.selected_display_id.as_deref() == Some(frame.display_id.as_str()))
            .map(|v| v.client_id.clone())
            .collect();
        if targets.is_empty() {
            return Ok(());
        }
        let message = ChannelMessage::ScreenFrame(frame);
        self.outlet
            .send_message(
                &self.connection_id,
                message.kind(),
                encode_message(&message)?,
                MessageDestination::SpecificClients,
                Some(targets),
            )
            .await
    }

    /// Rebuild the viewer list from an authoritative session snapshot,
    /// preserving display selections of surviving viewers.
    pub fn apply_connection_info(&self, info: &ConnectionInfo) {
        let RoleState::Presenter { viewers } = &self.role else {
            return;
        };
        let snapshot = {
            let mut viewers = viewers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let rebuilt: Vec<ViewerInfo> = info
                .viewers
                .iter()
                .map(|p| ViewerInfo {
                    client_id: p.client_id.clone(),
                    display_name: p.display_name.clone(),
                    selected_display_id: viewers
                        .iter()
                        .find(|v| v.client_id == p.client_id)
                        .and_then(|v| v.selected_display_id.clone()),
                })
                .collect();
            *viewers = rebuilt.clone();
            rebuilt
        };
        self.emit(ConnectionEvent::ViewersChanged(snapshot));
    }

    // ---- viewer operations ----

    /// Snapshot of the advertised display list.
    pub fn displays(&self) -> Result<Vec<DisplayDescriptor>, ConnectionError> {
        match &self.role {
            RoleState::Viewer { displays, .. } => Ok(displays
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone()),
            RoleState::Presenter { .. } => Err(ConnectionError::InvalidRole),
        }
    }

    #[must_use]
    pub fn selected_display(&self) -> Option<String> {
        match &self.role {
            RoleState::Viewer { selected, .. } => selected
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone(),
            RoleState::Presenter { .. } => None,
        }
    }

    /// Ask the presenter for its display list.
    pub async fn request_display_list(&self) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        let RoleState::Viewer { .. } = &self.role else {
            return Err(ConnectionError::InvalidRole);
        };
        self.send_to_presenter(&ChannelMessage::DisplayRequestList).await
    }

    /// Pick the display to watch.
    pub async fn select_display(&self, display_id: &str) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        let RoleState::Viewer { selected, .. } = &self.role else {
            return Err(ConnectionError::InvalidRole);
        };
        *selected
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(display_id.to_string());
        self.send_to_presenter(&ChannelMessage::DisplaySelect {
            display_id: display_id.to_string(),
        })
        .await
    }

    /// Forward one input message to the presenter.
    pub async fn send_input(&self, message: ChannelMessage) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        let RoleState::Viewer { .. } = &self.role else {
            return Err(ConnectionError::InvalidRole);
        };
        if !message.kind().is_input() {
            return Err(ConnectionError::InvalidRole);
        }
        self.send_to_presenter(&message).await
    }

    async fn send_to_presenter(&self, message: &ChannelMessage) -> Result<(), ConnectionError> {
        self.outlet
            .send_message(
                &self.connection_id,
                message.kind(),
                encode_message(message)?,
                MessageDestination::PresenterOnly,
                None,
            )
            .await
    }

    // ---- inbound dispatch ----

    /// Decode and apply one relayed payload. Malformed or role-foreign
    /// messages are logged and ignored; the session stays up.
    pub fn handle_message(&self, sender_client_id: &str, data: &[u8]) {
        if self.is_closed() {
            return;
        }
        let message = match decode_message(data) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(
                    connection = %self.connection_id,
                    sender = %sender_client_id,
                    "Dropping malformed message: {e}"
                );
                return;
            }
        };

        match &self.role {
            RoleState::Presenter { viewers } => match message {
                ChannelMessage::DisplayRequestList => {
                    self.emit(ConnectionEvent::DisplayListRequested {
                        viewer_id: sender_client_id.to_string(),
                    });
                }
                ChannelMessage::DisplaySelect { display_id } => {
                    let snapshot = {
                        let mut viewers = viewers
                            .lock()
                            .unwrap_or_else(std::sync::PoisonError::into_inner);
                        if let Some(v) =
                            viewers.iter_mut().find(|v| v.client_id == sender_client_id)
                        {
                            v.selected_display_id = Some(display_id);
                        }
                        viewers.clone()
                    };
                    self.emit(ConnectionEvent::ViewersChanged(snapshot));
                }
                message if message.kind().is_input() => {
                    self.emit(ConnectionEvent::InputReceived {
                        viewer_id: sender_client_id.to_string(),
                        message,
                    });
                }
                other => {
                    tracing::warn!(
                        connection = %self.connection_id,
                        kind = ?other.kind(),
                        "Unexpected message for presenter role"
                    );
                }
            },
            RoleState::Viewer { displays, .. } => match message {
                ChannelMessage::DisplayList { displays: list } => {
                    *displays
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner) = list.clone();
                    self.emit(ConnectionEvent::DisplaysChanged(list));
                }
                ChannelMessage::ScreenFrame(frame) => {
                    self.emit(ConnectionEvent::FrameReceived(frame));
                }
                other => {
                    tracing::warn!(
                        connection = %self.connection_id,
                        kind = ?other.kind(),
                        "Unexpected message for viewer role"
                    );
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::FrameCodec;
    use crate::rpc::ParticipantInfo;
    use std::collections::HashMap;

    #[derive(Default)]
    struct RecordingOutlet {
        sent: Mutex<Vec<(MessageKind, MessageDestination, Option<Vec<ClientId>>)>>,
    }

    #[async_trait]
    impl MessageOutlet for RecordingOutlet {
        async fn send_message(
            &self,
            _connection_id: &str,
            kind: MessageKind,
            _data: Vec<u8>,
            destination: MessageDestination,
            targets: Option<Vec<ClientId>>,
        ) -> Result<(), ConnectionError> {
            self.sent.lock().unwrap().push((kind, destination, targets));
            Ok(())
        }
    }

    fn info(viewers: &[(&str, &str)]) -> ConnectionInfo {
        ConnectionInfo {
            connection_id: "s1".into(),
            presenter: ParticipantInfo {
                client_id: "c1".into(),
                display_name: "Host".into(),
            },
            viewers: viewers
                .iter()
                .map(|(id, name)| ParticipantInfo {
                    client_id: (*id).into(),
                    display_name: (*name).into(),
                })
                .collect(),
            properties: HashMap::new(),
        }
    }

    fn frame(display_id: &str, n: u64) -> FrameMessage {
        FrameMessage {
            display_id: display_id.into(),
            frame_number: n,
            timestamp_ms: 0,
            codec: FrameCodec::Jpeg,
            width: 64,
            height: 64,
            quality: 75,
            regions: vec![],
        }
    }

    #[tokio::test]
    async fn role_invalid_operations_fail() {
        let outlet = Arc::new(RecordingOutlet::default());
        let (presenter, _rx) = Connection::presenter("s1".into(), "c1".into(), outlet.clone());
        let (viewer, _rx2) = Connection::viewer("s1".into(), "c2".into(), outlet);

        assert!(matches!(
            presenter.select_display("d0").await,
            Err(ConnectionError::InvalidRole)
        ));
        assert!(matches!(viewer.viewers(), Err(ConnectionError::InvalidRole)));
        assert!(matches!(
            viewer.send_frame(frame("d0", 1)).await,
            Err(ConnectionError::InvalidRole)
        ));
    }

    #[tokio::test]
    async fn viewers_changed_preserves_selections() {
        let outlet = Arc::new(RecordingOutlet::default());
        let (presenter, mut rx) = Connection::presenter("s1".into(), "c1".into(), outlet);

        presenter.apply_connection_info(&info(&[("c2", "A"), ("c3", "B")]));
        let select = encode_message(&ChannelMessage::DisplaySelect {
            display_id: "d0".into(),
        })
        .unwrap();
        presenter.handle_message("c2", &select);

        // c3 leaves, c4 joins; c2's selection must survive.
        presenter.apply_connection_info(&info(&[("c2", "A"), ("c4", "C")]));
        let viewers = presenter.viewers().unwrap();
        assert_eq!(viewers.len(), 2);
        assert_eq!(viewers[0].selected_display_id.as_deref(), Some("d0"));
        assert_eq!(viewers[1].selected_display_id, None);

        // Three ViewersChanged events were emitted along the way.
        let mut changes = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, ConnectionEvent::ViewersChanged(_)) {
                changes += 1;
            }
        }
        assert_eq!(changes, 3);
    }

    #[tokio::test]
    async fn frames_go_only_to_watching_viewers() {
        let outlet = Arc::new(RecordingOutlet::default());
        let (presenter, _rx) = Connection::presenter("s1".into(), "c1".into(), outlet.clone());
        presenter.apply_connection_info(&info(&[("c2", "A"), ("c3", "B")]));

        let select = encode_message(&ChannelMessage::DisplaySelect {
            display_id: "d0".into(),
        })
        .unwrap();
        presenter.handle_message("c2", &select);

        presenter.send_frame(frame("d0", 1)).await.unwrap();
        // Nobody watches d1: nothing is sent.
        presenter.send_frame(frame("d1", 2)).await.unwrap();

        let sent = outlet.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, MessageKind::ScreenFrame);
        assert_eq!(sent[0].1, MessageDestination::SpecificClients);
        assert_eq!(sent[0].2, Some(vec!["c2".to_string()]));
    }

    #[tokio::test]
    async fn viewer_dispatch_updates_displays_and_frames() {
        let outlet = Arc::new(RecordingOutlet::default());
        let (viewer, mut rx) = Connection::viewer("s1".into(), "c2".into(), outlet);

        let list = encode_message(&ChannelMessage::DisplayList {
            displays: vec![DisplayDescriptor {
                id: "d0".into(),
                friendly_name: "Primary".into(),
                is_primary: true,
                left: 0,
                top: 0,
                width: 1920,
                height: 1080,
            }],
        })
        .unwrap();
        viewer.handle_message("c1", &list);
        assert_eq!(viewer.displays().unwrap().len(), 1);
        assert!(matches!(
            rx.try_recv().unwrap(),
            ConnectionEvent::DisplaysChanged(_)
        ));

        let f = encode_message(&ChannelMessage::ScreenFrame(frame("d0", 5))).unwrap();
        viewer.handle_message("c1", &f);
        assert!(matches!(
            rx.try_recv().unwrap(),
            ConnectionEvent::FrameReceived(_)
        ));
    }

    #[tokio::test]
    async fn input_routes_to_presenter_only() {
        let outlet = Arc::new(RecordingOutlet::default());
        let (viewer, _rx) = Connection::viewer("s1".into(), "c2".into(), outlet.clone());
        viewer
            .send_input(ChannelMessage::MouseMove { x: 0.5, y: 0.5 })
            .await
            .unwrap();
        // Non-input payloads are rejected at the seam.
        assert!(viewer
            .send_input(ChannelMessage::DisplayRequestList)
            .await
            .is_err());

        let sent = outlet.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, MessageDestination::PresenterOnly);
    }

    #[tokio::test]
    async fn close_fires_once_and_disables_operations() {
        let outlet = Arc::new(RecordingOutlet::default());
        let (viewer, mut rx) = Connection::viewer("s1".into(), "c2".into(), outlet);
        viewer.close();
        viewer.close();
        assert!(matches!(rx.try_recv().unwrap(), ConnectionEvent::Closed));
        assert!(rx.try_recv().is_err());
        assert!(matches!(
            viewer.request_display_list().await,
            Err(ConnectionError::Closed)
        ));

        // Inbound traffic after close is ignored.
        let f = encode_message(&ChannelMessage::ScreenFrame(frame("d0", 5))).unwrap();
        viewer.handle_message("c1", &f);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_payload_does_not_close_session() {
        let outlet = Arc::new(RecordingOutlet::default());
        let (viewer, mut rx) = Connection::viewer("s1".into(), "c2".into(), outlet);
        viewer.handle_message("c1", &[0xDE, 0xAD]);
        assert!(!viewer.is_closed());
        assert!(rx.try_recv().is_err());
    }
}
