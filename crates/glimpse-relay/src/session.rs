//! Authoritative session state and message routing.
//!
//! One task owns each session: commands arrive through a mailbox and
//! are applied one at a time, so there is exactly one writer and no
//! locks around membership. Frame deliveries are handed to each
//! recipient's [`ClientSender`] coalescing slot; everything else goes
//! through the FIFO path.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use glimpse_protocol::messages::{ClientId, ConnectionId, MessageDestination, MessageKind};
use glimpse_protocol::rpc::{ConnectionInfo, ParticipantInfo, ServerEvent};

use crate::send::ClientSender;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session already has a presenter")]
    PresenterAlreadyInitialized,
    #[error("session task is gone")]
    Destroyed,
}

/// A session member plus its delivery path.
#[derive(Clone)]
pub struct Participant {
    pub client_id: ClientId,
    pub display_name: String,
    pub sender: Arc<ClientSender>,
}

impl Participant {
    fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            client_id: self.client_id.clone(),
            display_name: self.display_name.clone(),
        }
    }
}

enum Command {
    InitPresenter {
        participant: Participant,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    AddViewer {
        participant: Participant,
    },
    RemoveClient {
        client_id: ClientId,
    },
    SendMessage {
        sender_client_id: ClientId,
        kind: MessageKind,
        data: Vec<u8>,
        destination: MessageDestination,
        targets: Option<Vec<ClientId>>,
    },
    UpdateProperties {
        sender_client_id: ClientId,
        properties: HashMap<String, String>,
    },
    IsPresenter {
        client_id: ClientId,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<Option<ConnectionInfo>>,
    },
}

/// Handle to one session's mailbox task.
#[derive(Clone)]
pub struct SessionHandle {
    connection_id: ConnectionId,
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    /// Spawn the session task.
    #[must_use]
    pub fn spawn(connection_id: ConnectionId) -> Self {
        let (commands, mailbox) = mpsc::unbounded_channel();
        tokio::spawn(session_task(connection_id.clone(), mailbox));
        Self {
            connection_id,
            commands,
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Install the presenter. Errors when called twice.
    pub async fn init_presenter(&self, participant: Participant) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::InitPresenter { participant, reply })
            .map_err(|_| SessionError::Destroyed)?;
        rx.await.map_err(|_| SessionError::Destroyed)?
    }

    pub fn add_viewer(&self, participant: Participant) {
        let _ = self.commands.send(Command::AddViewer { participant });
    }

    /// Remove a member. Removing the presenter stops the session.
    pub fn remove_client(&self, client_id: &str) {
        let _ = self.commands.send(Command::RemoveClient {
            client_id: client_id.to_string(),
        });
    }

    /// Route one opaque message.
    pub fn send_message(
        &self,
        sender_client_id: &str,
        kind: MessageKind,
        data: Vec<u8>,
        destination: MessageDestination,
        targets: Option<Vec<ClientId>>,
    ) {
        let _ = self.commands.send(Command::SendMessage {
            sender_client_id: sender_client_id.to_string(),
            kind,
            data,
            destination,
            targets,
        });
    }

    pub fn update_properties(&self, sender_client_id: &str, properties: HashMap<String, String>) {
        let _ = self.commands.send(Command::UpdateProperties {
            sender_client_id: sender_client_id.to_string(),
            properties,
        });
    }

    pub async fn is_presenter(&self, client_id: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::IsPresenter {
                client_id: client_id.to_string(),
                reply,
            })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Current membership snapshot; `None` once destroyed.
    pub async fn snapshot(&self) -> Option<ConnectionInfo> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(Command::Snapshot { reply }).ok()?;
        rx.await.ok().flatten()
    }
}

struct SessionState {
    connection_id: ConnectionId,
    presenter: Option<Participant>,
    viewers: Vec<Participant>,
    properties: HashMap<String, String>,
}

impl SessionState {
    fn info(&self) -> Option<ConnectionInfo> {
        let presenter = self.presenter.as_ref()?;
        Some(ConnectionInfo {
            connection_id: self.connection_id.clone(),
            presenter: presenter.info(),
            viewers: self.viewers.iter().map(Participant::info).collect(),
            properties: self.properties.clone(),
        })
    }

    fn member(&self, client_id: &str) -> Option<&Participant> {
        if let Some(p) = self.presenter.as_ref().filter(|p| p.client_id == client_id) {
            return Some(p);
        }
        self.viewers.iter().find(|v| v.client_id == client_id)
    }

    fn is_presenter(&self, client_id: &str) -> bool {
        self.presenter
            .as_ref()
            .is_some_and(|p| p.client_id == client_id)
    }

    fn everyone(&self) -> impl Iterator<Item = &Participant> {
        self.presenter.iter().chain(self.viewers.iter())
    }

    fn broadcast_changed(&self) {
        let Some(info) = self.info() else { return };
        for member in self.everyone() {
            member.sender.enqueue(ServerEvent::ConnectionChanged {
                info: info.clone(),
            });
        }
    }

    fn deliver(&self, recipient: &Participant, kind: MessageKind, sender: &str, data: Vec<u8>) {
        let event = ServerEvent::MessageReceived {
            connection_id: self.connection_id.clone(),
            sender_client_id: sender.to_string(),
            kind,
            data,
        };
        if kind.is_frame() {
            recipient.sender.enqueue_frame(&self.connection_id, event);
        } else {
            recipient.sender.enqueue(event);
        }
    }

    fn route(
        &self,
        sender_client_id: &str,
        kind: MessageKind,
        data: Vec<u8>,
        destination: MessageDestination,
        targets: Option<Vec<ClientId>>,
    ) {
        // The sender is resolved against local membership only.
        if self.member(sender_client_id).is_none() {
            tracing::warn!(
                connection = %self.connection_id,
                sender = %sender_client_id,
                "Message from non-member dropped"
            );
            return;
        }

        match destination {
            MessageDestination::PresenterOnly => {
                if self.is_presenter(sender_client_id) {
                    return;
                }
                if let Some(p) = &self.presenter {
                    self.deliver(p, kind, sender_client_id, data);
                }
            }
            MessageDestination::AllViewers => {
                for viewer in &self.viewers {
                    self.deliver(viewer, kind, sender_client_id, data.clone());
                }
            }
            MessageDestination::All => {
                for member in self.everyone() {
                    self.deliver(member, kind, sender_client_id, data.clone());
                }
            }
            MessageDestination::AllExceptSender => {
                for member in self.everyone() {
                    if member.client_id != sender_client_id {
                        self.deliver(member, kind, sender_client_id, data.clone());
                    }
                }
            }
            MessageDestination::SpecificClients => {
                let Some(targets) = targets else {
                    tracing::warn!(
                        connection = %self.connection_id,
                        "SpecificClients without targets"
                    );
                    return;
                };
                for member in self.everyone() {
                    if targets.contains(&member.client_id) {
                        self.deliver(member, kind, sender_client_id, data.clone());
                    }
                }
            }
        }
    }
}

async fn session_task(connection_id: ConnectionId, mut mailbox: mpsc::UnboundedReceiver<Command>) {
    let mut state = SessionState {
        connection_id: connection_id.clone(),
        presenter: None,
        viewers: Vec::new(),
        properties: HashMap::new(),
    };

    while let Some(command) = mailbox.recv().await {
        match command {
            Command::InitPresenter { participant, reply } => {
                let result = if state.presenter.is_some() {
                    Err(SessionError::PresenterAlreadyInitialized)
                } else {
                    tracing::info!(
                        connection = %connection_id,
                        presenter = %participant.client_id,
                        "Session initialized"
                    );
                    state.presenter = Some(participant);
                    Ok(())
                };
                let _ = reply.send(result);
            }
            Command::AddViewer { participant } => {
                if state
                    .viewers
                    .iter()
                    .any(|v| v.client_id == participant.client_id)
                {
                    continue;
                }
                tracing::info!(
                    connection = %connection_id,
                    viewer = %participant.client_id,
                    "Viewer joined"
                );
                state.viewers.push(participant);
                state.broadcast_changed();
            }
            Command::RemoveClient { client_id } => {
                if state.is_presenter(&client_id) {
                    tracing::info!(connection = %connection_id, "Presenter left, stopping session");
                    for member in state.everyone() {
                        member.sender.enqueue(ServerEvent::ConnectionStopped {
                            connection_id: connection_id.clone(),
                        });
                        member.sender.drop_session(&connection_id);
                    }
                    // Self-destroy: the mailbox closes with this task.
                    return;
                }
                let Some(idx) = state.viewers.iter().position(|v| v.client_id == client_id)
                else {
                    continue;
                };
                let leaver = state.viewers.remove(idx);
                tracing::info!(connection = %connection_id, viewer = %client_id, "Viewer left");
                leaver.sender.enqueue(ServerEvent::ConnectionStopped {
                    connection_id: connection_id.clone(),
                });
                leaver.sender.drop_session(&connection_id);
                state.broadcast_changed();
            }
            Command::SendMessage {
                sender_client_id,
                kind,
                data,
                destination,
                targets,
            } => {
                state.route(&sender_client_id, kind, data, destination, targets);
            }
            Command::UpdateProperties {
                sender_client_id,
                properties,
            } => {
                if !state.is_presenter(&sender_client_id) {
                    tracing::warn!(
                        connection = %connection_id,
                        sender = %sender_client_id,
                        "Property update rejected: not the presenter"
                    );
                    continue;
                }
                state.properties = properties;
                state.broadcast_changed();
            }
            Command::IsPresenter { client_id, reply } => {
                let _ = reply.send(state.is_presenter(&client_id));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(state.info());
            }
        }
    }
}
