//! Transport abstraction for edge node connections.
//!
//! A transport adapter produces [`Connection`]s from a [`Listener`]. Each
//! connection knows the identity material presented by its peer and can be
//! split into a reader half and a writer half, so that one task owns reads
//! and one task owns writes for the lifetime of the connection.
//!
//! Concrete adapters (WebSocket, QUIC, in-memory) live in separate crates.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
pub mod framing;
pub mod tls;

pub use error::TransportError;

use std::collections::HashMap;
use std::fmt::{self, Debug, Display};
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use rustls::pki_types::CertificateDer;

/// Header carrying the node identity claimed by the peer.
pub const NODE_ID_HEADER: &str = "node_id";

/// Header carrying the project the node belongs to.
pub const PROJECT_ID_HEADER: &str = "project_id";

/// ALPN protocol name spoken by the secure adapters.
pub const ALPN_PROTOCOL: &[u8] = b"edgehub";

/// Which adapter produced a connection.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TransportKind {
    /// TLS WebSocket.
    WebSocket,

    /// QUIC.
    Quic,

    /// In-process channel pair.
    Memory,
}

impl TransportKind {
    /// Short label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WebSocket => "ws",
            Self::Quic => "quic",
            Self::Memory => "memory",
        }
    }
}

impl Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity material presented by a peer during the handshake.
#[derive(Clone, Debug, Default)]
pub struct PeerIdentity {
    /// Verified certificate chain, leaf first. Empty if none was presented.
    pub certificates: Vec<CertificateDer<'static>>,

    /// Handshake headers (HTTP upgrade headers or the first QUIC frame).
    pub headers: HashMap<String, String>,

    /// Remote socket address, when the transport has one.
    pub remote_addr: Option<SocketAddr>,
}

impl PeerIdentity {
    /// The node id the peer claims to be, if it sent a non-empty one.
    #[must_use]
    pub fn claimed_node_id(&self) -> Option<&str> {
        self.header(NODE_ID_HEADER)
    }

    /// The project id header, if present.
    #[must_use]
    pub fn project_id(&self) -> Option<&str> {
        self.header(PROJECT_ID_HEADER)
    }

    /// Look up a non-empty header value.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }
}

/// Reading half of a connection.
#[async_trait]
pub trait FrameReader: Send + 'static {
    /// Wait for the next complete frame.
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the peer is gone.
    async fn read_frame(&mut self) -> Result<Bytes, TransportError>;
}

/// Writing half of a connection.
#[async_trait]
pub trait FrameWriter: Send + 'static {
    /// Write one frame.
    async fn write_frame(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Close the connection. Pending reads on the other half fail afterwards.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// An established, authenticated connection with an edge node.
pub trait Connection: Debug + Send + 'static {
    /// Adapter that produced this connection.
    fn kind(&self) -> TransportKind;

    /// Identity material presented by the peer.
    fn peer_identity(&self) -> &PeerIdentity;

    /// Split into independently owned reader and writer halves.
    fn split(self: Box<Self>) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>);
}

/// Source of inbound connections.
#[async_trait]
pub trait Listener: Debug + Send + Sync + 'static {
    /// Adapter kind.
    fn kind(&self) -> TransportKind;

    /// Bound local address, if any.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Wait for the next connection whose transport handshake completed.
    ///
    /// Returns [`TransportError::ListenerClosed`] after [`Listener::close`].
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError>;

    /// Stop accepting and release the listening socket.
    async fn close(&self) -> Result<(), TransportError>;

    /// Tear down connections that still share the listener's socket. Called
    /// once every session accepted from this listener is closed.
    async fn terminate(&self) {}
}

/// Close a connection that will not be used, e.g. after a rejected handshake.
///
/// # Errors
///
/// Returns an error if the adapter fails to close cleanly.
pub async fn reject(connection: Box<dyn Connection>) -> Result<(), TransportError> {
    let (_reader, mut writer) = connection.split();
    writer.close().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_headers_are_not_claims() {
        let mut identity = PeerIdentity::default();
        assert_eq!(identity.claimed_node_id(), None);

        identity
            .headers
            .insert(NODE_ID_HEADER.to_string(), String::new());
        assert_eq!(identity.claimed_node_id(), None);

        identity
            .headers
            .insert(NODE_ID_HEADER.to_string(), "node-a".to_string());
        identity
            .headers
            .insert(PROJECT_ID_HEADER.to_string(), "p1".to_string());
        assert_eq!(identity.claimed_node_id(), Some("node-a"));
        assert_eq!(identity.project_id(), Some("p1"));
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(TransportKind::WebSocket.to_string(), "ws");
        assert_eq!(TransportKind::Quic.as_str(), "quic");
    }
}
