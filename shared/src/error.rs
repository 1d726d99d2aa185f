use std::net::SocketAddr;
use thiserror::Error;

/// Failure to turn a datagram or relay line into a [`crate::Message`].
#[derive(Debug, Error)]
pub enum WireError {
    #[error("message is not valid UTF-8: {0}")]
    NotUtf8(#[from] std::str::Utf8Error),

    #[error("malformed message: {0}")]
    MalformedMessage(#[from] serde_json::Error),

    #[error("message carries neither a messageType nor an eventName")]
    MissingKind,

    #[error("unknown message type `{0}`")]
    UnknownKind(String),

    #[error("failed to encode message: {0}")]
    Encode(serde_json::Error),
}

/// Process-level failures. Anything that reaches `main` ends the process.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("network error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot resolve address `{0}`")]
    BadAddress(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("decision process hung up")]
    DeciderClosed,

    #[error("leader at {0} never answered the join request")]
    LeaderUnreachable(SocketAddr),
}
