/**
 * error.rs
 *
 * Error types for every layer of the agent
 */

use thiserror::Error;

use crate::connection::Status;

/// Key parsing errors
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid base64 key: {0}")]
    Encoding(String),

    #[error("invalid key length: {0} bytes (expected 32)")]
    Length(usize),
}

/// Tunnel interface errors
#[derive(Debug, Error)]
pub enum IfaceError {
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` failed ({status}): {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("invalid listen port for interface {iface}: {output:?}")]
    ListenPort { iface: String, output: String },

    #[error("interface {0} does not exist")]
    NotFound(String),
}

/// Signaling transport and payload errors
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("signal client is not connected")]
    NotConnected,

    #[error("signal client is closed")]
    Closed,

    #[error("no route to peer {0}")]
    NoRoute(String),

    #[error("failed to seal payload")]
    Seal,

    #[error("failed to open payload: not addressed to us or tampered")]
    Open,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("unexpected message type {0}")]
    UnexpectedType(String),

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("tls setup failed: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("signal server did not answer in time")]
    Timeout,

    #[error("registration rejected: {0}")]
    Registration(String),

    #[error("invalid key: {0}")]
    Key(#[from] KeyError),
}

/// NAT traversal candidate parsing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CandidateError {
    #[error("candidate has {0} fields, expected at least 8")]
    TooShort(usize),

    #[error("invalid candidate field {field}: {value:?}")]
    Field { field: &'static str, value: String },

    #[error("unsupported transport {0:?}")]
    Transport(String),

    #[error("unknown candidate type {0:?}")]
    Type(String),
}

/// STUN/TURN server URL parsing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IceUrlError {
    #[error("missing scheme in {0:?}")]
    MissingScheme(String),

    #[error("unsupported scheme {0:?}")]
    Scheme(String),

    #[error("unterminated IPv6 host in {0:?}")]
    UnterminatedHost(String),

    #[error("invalid port in {0:?}")]
    Port(String),

    #[error("missing host in {0:?}")]
    MissingHost(String),
}

/// Connection (negotiation) errors
#[derive(Debug, Error)]
pub enum ConnError {
    #[error("event {event} is not valid in state {from}")]
    InvalidTransition { from: Status, event: &'static str },

    #[error("connection attempt timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("path to remote peer lost")]
    PathLost,

    #[error("signaling failed: {0}")]
    Signal(#[from] SignalError),

    #[error("interface failed: {0}")]
    Iface(#[from] IfaceError),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Inbound signaling message routing errors
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("wrongly addressed message from {0}: no connection")]
    UnknownPeer(String),

    #[error("unknown peer {got}: connection belongs to {expected}")]
    KeyMismatch { expected: String, got: String },

    #[error("message for {0} is not addressed to us")]
    WrongRecipient(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] SignalError),

    #[error("invalid candidate: {0}")]
    Candidate(#[from] CandidateError),

    #[error("connection rejected message: {0}")]
    Connection(#[from] ConnError),
}

/// Engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("interface error: {0}")]
    Iface(#[from] IfaceError),

    #[error("engine is not started")]
    NotStarted,

    #[error("engine is already started")]
    AlreadyStarted,

    #[error("invalid peer key {key}: {source}")]
    InvalidPeerKey {
        key: String,
        #[source]
        source: KeyError,
    },

    #[error("connection error: {0}")]
    Connection(#[from] ConnError),
}
