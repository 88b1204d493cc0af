use thiserror::Error;

/// Errors raised by transport adapters.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Certificate or key material could not be loaded.
    #[error("certificate material error: {0}")]
    Certificate(String),

    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// A frame exceeded the configured maximum size.
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge {
        /// Announced frame size.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// The connection handshake failed before a connection was established.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The listener was closed.
    #[error("listener closed")]
    ListenerClosed,

    /// QUIC protocol error.
    #[error("quic error: {0}")]
    Quic(String),

    /// TLS configuration or protocol error.
    #[error("tls error: {0}")]
    Tls(String),

    /// WebSocket protocol error.
    #[error("websocket error: {0}")]
    WebSocket(String),
}

impl From<rustls::Error> for TransportError {
    fn from(err: rustls::Error) -> Self {
        Self::Tls(err.to_string())
    }
}

impl TransportError {
    /// Whether the error means the peer went away rather than a protocol fault.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::ListenerClosed)
    }
}
