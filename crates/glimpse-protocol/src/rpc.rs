//! Request/event envelopes between clients and the relay.
//!
//! The transport is any reliable ordered byte stream carrying
//! length-delimited bincode frames (see [`crate::framing`]). Requests
//! that need a return value carry a `request_id` echoed back in a
//! [`ServerEvent::Reply`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::messages::{ClientId, ConnectionId, MessageDestination, MessageKind, TryConnectError};

/// Client -> relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientRequest {
    /// Join the session published under `username`, creating it if the
    /// presenter is not yet presenting.
    ConnectTo {
        request_id: u64,
        username: String,
        password: String,
    },
    /// Route an opaque typed message inside a session.
    SendMessage {
        connection_id: ConnectionId,
        kind: MessageKind,
        data: Vec<u8>,
        destination: MessageDestination,
        targets: Option<Vec<ClientId>>,
    },
    /// Leave a session.
    Disconnect { connection_id: ConnectionId },
    /// Replace the caller's free-text display name.
    SetDisplayName { display_name: String },
    /// Regenerate the caller's session password.
    RegeneratePassword { request_id: u64 },
    /// Replace session properties; presenter only.
    UpdateProperties {
        connection_id: ConnectionId,
        properties: HashMap<String, String>,
    },
    /// Store a public key for the caller's stable identity.
    RegisterIdentity {
        request_id: u64,
        client_guid: String,
        public_key: Vec<u8>,
        key_format: String,
    },
    /// Begin a challenge-response authentication.
    IssueNonce {
        request_id: u64,
        session_id: String,
        client_guid: String,
    },
    /// Finish a challenge-response authentication.
    CompleteAuth {
        request_id: u64,
        session_id: String,
        client_guid: String,
        signature_base64: String,
    },
}

/// One session participant as shown to other participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub client_id: ClientId,
    pub display_name: String,
}

/// Authoritative session snapshot broadcast on membership changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub presenter: ParticipantInfo,
    pub viewers: Vec<ParticipantInfo>,
    pub properties: HashMap<String, String>,
}

/// Body of a [`ServerEvent::Reply`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyBody {
    Connect {
        error: Option<TryConnectError>,
        connection_id: Option<ConnectionId>,
    },
    PasswordRegenerated {
        password: String,
    },
    IdentityRegistered {
        ok: bool,
    },
    Nonce {
        nonce_base64: Option<String>,
    },
    AuthCompleted {
        ok: bool,
    },
}

/// Relay -> client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerEvent {
    /// Issued on every successful (re)connection.
    CredentialsAssigned {
        client_id: ClientId,
        username: String,
        password: String,
    },
    ConnectionStarted {
        connection_id: ConnectionId,
        is_presenter: bool,
    },
    ConnectionChanged {
        info: ConnectionInfo,
    },
    ConnectionStopped {
        connection_id: ConnectionId,
    },
    MessageReceived {
        connection_id: ConnectionId,
        sender_client_id: ClientId,
        kind: MessageKind,
        data: Vec<u8>,
    },
    Reply {
        request_id: u64,
        body: ReplyBody,
    },
}
