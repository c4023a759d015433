// Wire protocol and session primitives for glimpse.
//
// - messages.rs: typed envelopes carried inside relay messages
// - rpc.rs: client<->relay request/event envelopes
// - framing.rs: length-delimited bincode frames over a byte stream
// - connection.rs: role-variant client session object
// - client.rs: reconnecting relay client
// - credentials.rs: paste-friendly credential parsing
// - ipc.rs: privileged recorder pipe protocol

pub mod client;
pub mod connection;
pub mod credentials;
pub mod framing;
pub mod ipc;
pub mod messages;
pub mod rpc;

pub use connection::{Connection, ConnectionEvent, ConnectionRole, ViewerInfo};
pub use messages::{
    decode_message, encode_message, ChannelMessage, CodecError, DisplayDescriptor, FrameCodec,
    FrameMessage, KeyModifiers, MessageDestination, MessageKind, MouseButton, TileRegion,
    TryConnectError,
};
pub use rpc::{ClientRequest, ConnectionInfo, ParticipantInfo, ReplyBody, ServerEvent};
