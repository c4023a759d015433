//! Reconnecting relay client.
//!
//! Owns one TCP connection to the relay, re-established with capped
//! exponential backoff whenever it drops. Requests carrying a
//! `request_id` are matched to their [`ReplyBody`] here; everything
//! else is forwarded to the application as events. The relay reissues
//! credentials on every successful (re)connection, so the application
//! simply consumes the next `CredentialsAssigned`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnectionError, MessageOutlet};
use crate::framing::{frame_duplex, recv_value, send_value};
use crate::messages::{
    ClientId, CodecError, ConnectionId, MessageDestination, MessageKind, TryConnectError,
};
use crate::rpc::{ClientRequest, ReplyBody, ServerEvent};

/// Initial reconnect delay; doubled per attempt up to [`RECONNECT_CAP`].
pub const RECONNECT_BASE: Duration = Duration::from_millis(500);
pub const RECONNECT_CAP: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("relay client stopped")]
    Stopped,
    #[error("connection lost before the reply arrived")]
    Disconnected,
    #[error("unexpected reply body")]
    UnexpectedReply,
}

/// What the application sees from the client.
#[derive(Debug)]
pub enum RelayClientEvent {
    /// Transport (re)established.
    Connected,
    /// Transport lost; a reconnect attempt follows.
    Disconnected,
    Event(ServerEvent),
}

pub struct RelayClientConfig {
    pub addr: String,
    /// Free-text display name announced after each connect.
    pub display_name: String,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<ReplyBody>>>>;

/// Handle to the background transport task.
pub struct RelayClient {
    requests: mpsc::UnboundedSender<ClientRequest>,
    pending: PendingMap,
    next_request_id: AtomicU64,
    shutdown: CancellationToken,
}

impl RelayClient {
    /// Spawn the transport task and return the handle plus the event
    /// stream.
    pub fn connect(
        config: RelayClientConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<RelayClientEvent>) {
        let (requests, requests_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();

        tokio::spawn(io_task(
            config,
            requests_rx,
            events_tx,
            Arc::clone(&pending),
            shutdown.clone(),
        ));

        (
            Arc::new(Self {
                requests,
                pending,
                next_request_id: AtomicU64::new(1),
                shutdown,
            }),
            events_rx,
        )
    }

    /// Stop the transport task. In-flight requests fail.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    fn enqueue(&self, request: ClientRequest) -> Result<(), RequestError> {
        self.requests.send(request).map_err(|_| RequestError::Stopped)
    }

    fn register_reply(&self) -> (u64, oneshot::Receiver<ReplyBody>) {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(request_id, tx);
        (request_id, rx)
    }

    async fn await_reply(
        &self,
        rx: oneshot::Receiver<ReplyBody>,
    ) -> Result<ReplyBody, RequestError> {
        rx.await.map_err(|_| RequestError::Disconnected)
    }

    /// Join the session published under `username`.
    pub async fn connect_to(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Result<ConnectionId, TryConnectError>, RequestError> {
        let (request_id, rx) = self.register_reply();
        self.enqueue(ClientRequest::ConnectTo {
            request_id,
            username: username.to_string(),
            password: password.to_string(),
        })?;
        match self.await_reply(rx).await? {
            ReplyBody::Connect {
                error: None,
                connection_id: Some(id),
            } => Ok(Ok(id)),
            ReplyBody::Connect {
                error: Some(error), ..
            } => Ok(Err(error)),
            _ => Err(RequestError::UnexpectedReply),
        }
    }

    /// Ask the relay for a fresh session password.
    pub async fn regenerate_password(&self) -> Result<String, RequestError> {
        let (request_id, rx) = self.register_reply();
        self.enqueue(ClientRequest::RegeneratePassword { request_id })?;
        match self.await_reply(rx).await? {
            ReplyBody::PasswordRegenerated { password } => Ok(password),
            _ => Err(RequestError::UnexpectedReply),
        }
    }

    pub async fn register_identity(
        &self,
        client_guid: &str,
        public_key: Vec<u8>,
        key_format: &str,
    ) -> Result<bool, RequestError> {
        let (request_id, rx) = self.register_reply();
        self.enqueue(ClientRequest::RegisterIdentity {
            request_id,
            client_guid: client_guid.to_string(),
            public_key,
            key_format: key_format.to_string(),
        })?;
        match self.await_reply(rx).await? {
            ReplyBody::IdentityRegistered { ok } => Ok(ok),
            _ => Err(RequestError::UnexpectedReply),
        }
    }

    pub async fn issue_nonce(
        &self,
        session_id: &str,
        client_guid: &str,
    ) -> Result<Option<String>, RequestError> {
        let (request_id, rx) = self.register_reply();
        self.enqueue(ClientRequest::IssueNonce {
            request_id,
            session_id: session_id.to_string(),
            client_guid: client_guid.to_string(),
        })?;
        match self.await_reply(rx).await? {
            ReplyBody::Nonce { nonce_base64 } => Ok(nonce_base64),
            _ => Err(RequestError::UnexpectedReply),
        }
    }

    pub async fn complete_auth(
        &self,
        session_id: &str,
        client_guid: &str,
        signature_base64: &str,
    ) -> Result<bool, RequestError> {
        let (request_id, rx) = self.register_reply();
        self.enqueue(ClientRequest::CompleteAuth {
            request_id,
            session_id: session_id.to_string(),
            client_guid: client_guid.to_string(),
            signature_base64: signature_base64.to_string(),
        })?;
        match self.await_reply(rx).await? {
            ReplyBody::AuthCompleted { ok } => Ok(ok),
            _ => Err(RequestError::UnexpectedReply),
        }
    }

    /// Leave a session.
    pub fn disconnect(&self, connection_id: &str) {
        let _ = self.enqueue(ClientRequest::Disconnect {
            connection_id: connection_id.to_string(),
        });
    }
}

#[async_trait]
impl MessageOutlet for RelayClient {
    async fn send_message(
        &self,
        connection_id: &str,
        kind: MessageKind,
        data: Vec<u8>,
        destination: MessageDestination,
        targets: Option<Vec<ClientId>>,
    ) -> Result<(), ConnectionError> {
        self.enqueue(ClientRequest::SendMessage {
            connection_id: connection_id.to_string(),
            kind,
            data,
            destination,
            targets,
        })
        .map_err(|e| ConnectionError::Send(e.to_string()))
    }
}

async fn io_task(
    config: RelayClientConfig,
    mut requests: mpsc::UnboundedReceiver<ClientRequest>,
    events: mpsc::UnboundedSender<RelayClientEvent>,
    pending: PendingMap,
    shutdown: CancellationToken,
) {
    let mut backoff = RECONNECT_BASE;

    loop {
        let stream = tokio::select! {
            result = TcpStream::connect(&config.addr) => result,
            () = shutdown.cancelled() => return,
        };

        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!(addr = %config.addr, "Relay connect failed: {e}, retrying in {backoff:?}");
                tokio::select! {
                    () = tokio::time::sleep(backoff) => {}
                    () = shutdown.cancelled() => return,
                }
                backoff = (backoff * 2).min(RECONNECT_CAP);
                continue;
            }
        };

        tracing::info!(addr = %config.addr, "Connected to relay");
        backoff = RECONNECT_BASE;
        let _ = events.send(RelayClientEvent::Connected);

        let framed = frame_duplex(stream);
        let (mut sink, mut stream) = futures::StreamExt::split(framed);

        // Announce the display name first so credential issuance can
        // include it in connection snapshots.
        let hello = ClientRequest::SetDisplayName {
            display_name: config.display_name.clone(),
        };
        if let Err(e) = send_value(&mut sink, &hello).await {
            tracing::warn!("Relay hello failed: {e}");
            let _ = events.send(RelayClientEvent::Disconnected);
            continue;
        }

        let disconnected = run_session(
            &mut sink,
            &mut stream,
            &mut requests,
            &events,
            &pending,
            &shutdown,
        )
        .await;

        // Fail every request still waiting for a reply.
        pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();

        let _ = events.send(RelayClientEvent::Disconnected);
        if !disconnected {
            return; // shutdown requested
        }

        // Breathe before redialing so a flapping relay is not hammered.
        tokio::select! {
            () = tokio::time::sleep(backoff) => {}
            () = shutdown.cancelled() => return,
        }
    }
}

/// Pump one live connection. Returns `true` when the transport dropped
/// (reconnect), `false` on shutdown.
async fn run_session(
    sink: &mut (impl futures::Sink<bytes::Bytes, Error = std::io::Error> + Unpin),
    stream: &mut (impl futures::Stream<Item = Result<bytes::BytesMut, std::io::Error>> + Unpin),
    requests: &mut mpsc::UnboundedReceiver<ClientRequest>,
    events: &mpsc::UnboundedSender<RelayClientEvent>,
    pending: &PendingMap,
    shutdown: &CancellationToken,
) -> bool {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => return false,

            request = requests.recv() => {
                let Some(request) = request else { return false };
                if let Err(e) = send_value(sink, &request).await {
                    tracing::warn!("Relay send failed: {e}");
                    return true;
                }
            }

            incoming = recv_value::<_, ServerEvent>(stream) => {
                match incoming {
                    Ok(Some(ServerEvent::Reply { request_id, body })) => {
                        let waiter = pending
                            .lock()
                            .unwrap_or_else(std::sync::PoisonError::into_inner)
                            .remove(&request_id);
                        match waiter {
                            Some(tx) => { let _ = tx.send(body); }
                            None => tracing::warn!(request_id, "Reply without a waiter"),
                        }
                    }
                    Ok(Some(event)) => {
                        let _ = events.send(RelayClientEvent::Event(event));
                    }
                    Ok(None) => {
                        tracing::info!("Relay closed the connection");
                        return true;
                    }
                    Err(CodecError::Io(e)) => {
                        tracing::warn!("Relay read failed: {e}");
                        return true;
                    }
                    Err(e) => {
                        // Protocol violation: log and keep the session.
                        tracing::warn!("Undecodable relay event: {e}");
                    }
                }
            }
        }
    }
}
