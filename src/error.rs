//! src/error.rs
//!
//! Defines the library's custom, comprehensive `Error` enum using `thiserror`.

use crate::domain::{ConnectionId, Endpoint};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Why a `register_peer` request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRejectedReason {
    /// Another connection is already registered under the same endpoint.
    AlreadyConnected,
    /// The peer map is already at `max_peers`.
    MaxReached,
}

impl std::fmt::Display for PeerRejectedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyConnected => write!(f, "already connected"),
            Self::MaxReached => write!(f, "max peers reached"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize or deserialize: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Tokio task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("Failed to initiate connection to {0}: {1}")]
    ConnectFailed(Endpoint, #[source] quinn::ConnectError),

    #[error("Connection to {0} failed during establishment: {1}")]
    ConnectionEstablishFailed(Endpoint, #[source] quinn::ConnectionError),

    #[error("An established connection failed: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("Failed to write to network stream: {0}")]
    WriteStream(#[from] quinn::WriteError),

    #[error("API server error: {0}")]
    ApiServer(#[from] axum::Error),

    #[error("Peer rejected: {0}")]
    PeerRejected(PeerRejectedReason),

    #[error("Connection {0} is no longer valid")]
    InvalidConnection(ConnectionId),

    #[error("No route to endpoint {0}")]
    KeyNotFound(Endpoint),
}
