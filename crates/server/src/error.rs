use thiserror::Error;

/// Result type for the server.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that stop the server.
#[derive(Debug, Error)]
pub enum Error {
    /// Admin HTTP server failure.
    #[error("admin server error: {0}")]
    Admin(std::io::Error),

    /// Hub construction failed.
    #[error(transparent)]
    Hub(#[from] edgehub::Error),

    /// Socket error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A server task panicked.
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),

    /// TLS material or listener setup failed.
    #[error(transparent)]
    Transport(#[from] edgehub_transport::TransportError),
}
