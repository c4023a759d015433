// Relay service internals, exposed as a library for the binary and the
// scenario tests.
//
// - server.rs: accept loop and request dispatch
// - session.rs: per-session actor (authoritative membership + routing)
// - send.rs: per-client writer with the frame coalescing slot
// - clients.rs: connected-client records and credential issuance
// - username.rs: username ownership
// - identity.rs: public-key identity and challenge-response auth

pub mod clients;
pub mod config;
pub mod identity;
pub mod send;
pub mod server;
pub mod session;
pub mod username;
