use edgehub_attestation::{AttestationError, NodeId};
use edgehub_transport::TransportError;
use thiserror::Error;

/// Result type for hub operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the hub.
#[derive(Debug, Error)]
pub enum Error {
    /// Handshake attestation failed.
    #[error(transparent)]
    Attestation(#[from] AttestationError),

    /// A message could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// A group channel stayed full for longer than the allowed wait.
    #[error("group {0:?} is full")]
    GroupFull(String),

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Metrics registration failed.
    #[error(transparent)]
    Metrics(#[from] prometheus::Error),

    /// The hub already serves the maximum number of nodes.
    #[error("node limit of {0} reached")]
    NodeLimit(usize),

    /// The message resource does not name a target node.
    #[error("resource {0:?} does not name a node")]
    NoRoute(String),

    /// The node's pending queue is full and the caller asked not to wait.
    #[error("pending queue for node {0} is full")]
    QueueFull(NodeId),

    /// The hub is shutting down.
    #[error("hub is shutting down")]
    Shutdown,

    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// No channel exists for the group.
    #[error("unknown group {0:?}")]
    UnknownGroup(String),
}
