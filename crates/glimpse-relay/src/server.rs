//! Relay accept loop and per-client request handling.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};

use glimpse_protocol::framing::{frame_duplex, recv_value};
use glimpse_protocol::messages::{CodecError, ConnectionId, TryConnectError};
use glimpse_protocol::rpc::{ClientRequest, ReplyBody, ServerEvent};

use crate::clients::{ClientDirectory, ClientState};
use crate::identity::{AuthSessionStore, IdentityStore};
use crate::send::ClientSender;
use crate::session::{Participant, SessionHandle};
use crate::username::UsernameRegistry;

/// Shared relay state.
pub struct Relay {
    clients: ClientDirectory,
    usernames: UsernameRegistry,
    identities: IdentityStore,
    auth_sessions: AuthSessionStore,
    sessions: Mutex<HashMap<ConnectionId, SessionHandle>>,
    next_session: AtomicU64,
}

impl Relay {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            clients: ClientDirectory::new(),
            usernames: UsernameRegistry::new(),
            identities: IdentityStore::new(),
            auth_sessions: AuthSessionStore::new(),
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
        })
    }

    fn session(&self, connection_id: &str) -> Option<SessionHandle> {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(connection_id)
            .cloned()
    }

    fn insert_session(&self, handle: SessionHandle) {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(handle.connection_id().to_string(), handle);
    }

    fn remove_session(&self, connection_id: &str) {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(connection_id);
    }
}

/// A bound relay listener.
pub struct RelayServer {
    listener: TcpListener,
    relay: Arc<Relay>,
}

impl RelayServer {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind relay to {addr}"))?;
        Ok(Self {
            listener,
            relay: Relay::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("no local address")
    }

    /// Accept connections until cancelled by dropping the future.
    pub async fn serve(self) -> Result<()> {
        tracing::info!(addr = %self.local_addr()?, "Relay listening");
        loop {
            let (stream, peer_addr) = self
                .listener
                .accept()
                .await
                .context("failed to accept connection")?;
            tracing::info!(%peer_addr, "New client connection");

            let relay = Arc::clone(&self.relay);
            tokio::spawn(async move {
                handle_client(stream, relay).await;
                tracing::info!(%peer_addr, "Client connection closed");
            });
        }
    }
}

async fn handle_client(stream: TcpStream, relay: Arc<Relay>) {
    let (sink, mut reader) = futures::StreamExt::split(frame_duplex(stream));
    let sender = ClientSender::spawn(sink);
    let client = relay.clients.register(Arc::clone(&sender), &relay.usernames);

    // Credentials are issued on every (re)connection.
    sender.enqueue(ServerEvent::CredentialsAssigned {
        client_id: client.client_id.clone(),
        username: client.username(),
        password: client
            .password
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone(),
    });
    tracing::info!(client = %client.client_id, username = %client.username(), "Credentials assigned");

    loop {
        let request: Option<ClientRequest> = match recv_value(&mut reader).await {
            Ok(request) => request,
            Err(CodecError::Io(e)) => {
                tracing::debug!(client = %client.client_id, "Client read failed: {e}");
                break;
            }
            Err(e) => {
                // Malformed request: log and keep the connection.
                tracing::warn!(client = %client.client_id, "Undecodable request: {e}");
                continue;
            }
        };
        let Some(request) = request else { break };
        handle_request(&relay, &client, request).await;
    }

    disconnect_client(&relay, &client).await;
}

async fn handle_request(relay: &Arc<Relay>, client: &Arc<ClientState>, request: ClientRequest) {
    match request {
        ClientRequest::SetDisplayName { display_name } => {
            *client
                .display_name
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = display_name;
        }

        ClientRequest::ConnectTo {
            request_id,
            username,
            password,
        } => {
            let body = connect_to(relay, client, &username, &password).await;
            client.sender.enqueue(ServerEvent::Reply {
                request_id,
                body,
            });
        }

        ClientRequest::SendMessage {
            connection_id,
            kind,
            data,
            destination,
            targets,
        } => {
            match relay.session(&connection_id) {
                Some(session) => {
                    session.send_message(&client.client_id, kind, data, destination, targets);
                }
                None => {
                    tracing::warn!(
                        client = %client.client_id,
                        connection = %connection_id,
                        "Message for unknown session dropped"
                    );
                }
            }
        }

        ClientRequest::Disconnect { connection_id } => {
            leave_session(relay, client, &connection_id).await;
        }

        ClientRequest::RegeneratePassword { request_id } => {
            let password = client.regenerate_password();
            tracing::info!(client = %client.client_id, "Password regenerated");
            client.sender.enqueue(ServerEvent::Reply {
                request_id,
                body: ReplyBody::PasswordRegenerated { password },
            });
        }

        ClientRequest::UpdateProperties {
            connection_id,
            properties,
        } => {
            if let Some(session) = relay.session(&connection_id) {
                session.update_properties(&client.client_id, properties);
            }
        }

        ClientRequest::RegisterIdentity {
            request_id,
            client_guid,
            public_key,
            key_format,
        } => {
            let result = relay
                .identities
                .register(&client_guid, &public_key, &key_format);
            if let Err(ref e) = result {
                tracing::warn!(client = %client.client_id, "Identity registration failed: {e}");
            }
            client.sender.enqueue(ServerEvent::Reply {
                request_id,
                body: ReplyBody::IdentityRegistered {
                    ok: result.is_ok(),
                },
            });
        }

        ClientRequest::IssueNonce {
            request_id,
            session_id,
            client_guid,
        } => {
            let nonce = relay.auth_sessions.issue_nonce(&session_id, &client_guid);
            client.sender.enqueue(ServerEvent::Reply {
                request_id,
                body: ReplyBody::Nonce {
                    nonce_base64: Some(nonce),
                },
            });
        }

        ClientRequest::CompleteAuth {
            request_id,
            session_id,
            client_guid,
            signature_base64,
        } => {
            let ok = relay.auth_sessions.try_complete(
                &session_id,
                &client_guid,
                &signature_base64,
                &relay.identities,
            );
            client.sender.enqueue(ServerEvent::Reply {
                request_id,
                body: ReplyBody::AuthCompleted { ok },
            });
        }
    }
}

/// Validate presenter credentials and join (or create) its session.
async fn connect_to(
    relay: &Arc<Relay>,
    viewer: &Arc<ClientState>,
    username: &str,
    password: &str,
) -> ReplyBody {
    let error = |error| ReplyBody::Connect {
        error: Some(error),
        connection_id: None,
    };

    if let Some(existing) = viewer.session() {
        if relay.session(&existing).is_some() {
            return error(TryConnectError::AlreadyConnected);
        }
        // The session died (presenter left); the stale reference heals.
        viewer.set_session(None);
    }

    let Some(presenter) = relay.clients.find_by_username(username) else {
        tracing::info!(username, "ConnectTo: unknown username");
        return error(TryConnectError::NotFound);
    };
    if presenter.client_id == viewer.client_id {
        return error(TryConnectError::AlreadyConnected);
    }
    if !presenter.password_matches(password) {
        tracing::info!(username, "ConnectTo: password mismatch");
        return error(TryConnectError::InvalidCredentials);
    }

    // Return the presenter's existing session or start a new one.
    let session = match presenter.session().and_then(|id| relay.session(&id)) {
        Some(session) => session,
        None => {
            let connection_id = format!(
                "s-{}",
                relay.next_session.fetch_add(1, Ordering::Relaxed)
            );
            let session = SessionHandle::spawn(connection_id.clone());
            if session
                .init_presenter(Participant {
                    client_id: presenter.client_id.clone(),
                    display_name: presenter.display_name(),
                    sender: Arc::clone(&presenter.sender),
                })
                .await
                .is_err()
            {
                return error(TryConnectError::Internal);
            }
            relay.insert_session(session.clone());
            presenter.set_session(Some(connection_id.clone()));
            presenter.sender.enqueue(ServerEvent::ConnectionStarted {
                connection_id,
                is_presenter: true,
            });
            session
        }
    };

    let connection_id = session.connection_id().to_string();
    viewer.set_session(Some(connection_id.clone()));
    viewer.sender.enqueue(ServerEvent::ConnectionStarted {
        connection_id: connection_id.clone(),
        is_presenter: false,
    });
    session.add_viewer(Participant {
        client_id: viewer.client_id.clone(),
        display_name: viewer.display_name(),
        sender: Arc::clone(&viewer.sender),
    });

    ReplyBody::Connect {
        error: None,
        connection_id: Some(connection_id),
    }
}

/// Remove `client` from a session it participates in.
async fn leave_session(relay: &Arc<Relay>, client: &Arc<ClientState>, connection_id: &str) {
    if client.session().as_deref() != Some(connection_id) {
        return;
    }
    client.set_session(None);
    let Some(session) = relay.session(connection_id) else {
        return;
    };
    if session.is_presenter(&client.client_id).await {
        // Stopping the presenter tears the whole session down.
        relay.remove_session(connection_id);
    }
    session.remove_client(&client.client_id);
}

/// Transport gone: release everything the client held.
async fn disconnect_client(relay: &Arc<Relay>, client: &Arc<ClientState>) {
    if let Some(connection_id) = client.session() {
        leave_session(relay, client, &connection_id).await;
    }
    relay.usernames.release(&client.username(), &client.client_guid);
    relay.clients.remove(&client.client_id);
    client.sender.shutdown().await;
}
