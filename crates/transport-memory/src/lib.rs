//! In-memory transport for tests and embedded use.
//!
//! A [`MemoryListener`] hands out [`MemoryConnector`]s. Each call to
//! [`MemoryConnector::connect`] creates a channel pair: the server half is
//! delivered through [`Listener::accept`] carrying the supplied
//! [`PeerIdentity`], and the client half is returned as a [`MemoryPeer`].
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::fmt::{self, Debug};
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use edgehub_transport::{
    Connection, FrameReader, FrameWriter, Listener, PeerIdentity, TransportError, TransportKind,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Frames buffered per direction before writers wait.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Listener side of the in-memory transport.
pub struct MemoryListener {
    incoming_tx: flume::Sender<MemoryConnection>,
    incoming_rx: flume::Receiver<MemoryConnection>,
    closed: CancellationToken,
    capacity: usize,
}

impl MemoryListener {
    /// Create a listener with the default per-direction capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a listener whose connections buffer `capacity` frames per direction.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (incoming_tx, incoming_rx) = flume::unbounded();
        Self {
            incoming_tx,
            incoming_rx,
            closed: CancellationToken::new(),
            capacity,
        }
    }

    /// Handle used by peers to open connections to this listener.
    #[must_use]
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            incoming_tx: self.incoming_tx.clone(),
            closed: self.closed.clone(),
            capacity: self.capacity,
        }
    }
}

impl Default for MemoryListener {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for MemoryListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryListener")
            .field("pending", &self.incoming_rx.len())
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

#[async_trait]
impl Listener for MemoryListener {
    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError> {
        tokio::select! {
            () = self.closed.cancelled() => Err(TransportError::ListenerClosed),
            conn = self.incoming_rx.recv_async() => conn
                .map(|conn| Box::new(conn) as Box<dyn Connection>)
                .map_err(|_| TransportError::ListenerClosed),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        debug!("closing memory listener");
        self.closed.cancel();
        Ok(())
    }
}

/// Cloneable handle for connecting to a [`MemoryListener`].
#[derive(Clone, Debug)]
pub struct MemoryConnector {
    incoming_tx: flume::Sender<MemoryConnection>,
    closed: CancellationToken,
    capacity: usize,
}

impl MemoryConnector {
    /// Open a connection presenting `identity` to the listener.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ListenerClosed`] if the listener is closed.
    pub fn connect(&self, identity: PeerIdentity) -> Result<MemoryPeer, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::ListenerClosed);
        }

        let (client_tx, server_rx) = flume::bounded(self.capacity);
        let (server_tx, client_rx) = flume::bounded(self.capacity);
        let closed = CancellationToken::new();
        let id = Uuid::new_v4();

        let server = MemoryConnection {
            id,
            identity,
            tx: server_tx,
            rx: server_rx,
            closed: closed.clone(),
        };

        self.incoming_tx
            .send(server)
            .map_err(|_| TransportError::ListenerClosed)?;

        debug!("memory connection {} opened", id);

        Ok(MemoryPeer {
            id,
            tx: client_tx,
            rx: client_rx,
            closed,
        })
    }
}

/// Server half of an in-memory connection.
struct MemoryConnection {
    id: Uuid,
    identity: PeerIdentity,
    tx: flume::Sender<Bytes>,
    rx: flume::Receiver<Bytes>,
    closed: CancellationToken,
}

impl Debug for MemoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.id)
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Connection for MemoryConnection {
    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    fn peer_identity(&self) -> &PeerIdentity {
        &self.identity
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>) {
        let reader = MemoryReader {
            rx: self.rx,
            closed: self.closed.clone(),
        };
        let writer = MemoryWriter {
            id: self.id,
            tx: self.tx,
            closed: self.closed,
        };
        (Box::new(reader), Box::new(writer))
    }
}

struct MemoryReader {
    rx: flume::Receiver<Bytes>,
    closed: CancellationToken,
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn read_frame(&mut self) -> Result<Bytes, TransportError> {
        recv(&self.rx, &self.closed).await
    }
}

struct MemoryWriter {
    id: Uuid,
    tx: flume::Sender<Bytes>,
    closed: CancellationToken,
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn write_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        send(&self.tx, &self.closed, frame).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        debug!("memory connection {} closed by server", self.id);
        self.closed.cancel();
        Ok(())
    }
}

/// Client half of an in-memory connection, used to play the edge node.
#[derive(Clone)]
pub struct MemoryPeer {
    id: Uuid,
    tx: flume::Sender<Bytes>,
    rx: flume::Receiver<Bytes>,
    closed: CancellationToken,
}

impl MemoryPeer {
    /// Send one frame to the server.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if either side closed.
    pub async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        send(&self.tx, &self.closed, frame).await
    }

    /// Receive the next frame from the server.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if either side closed.
    pub async fn recv(&self) -> Result<Bytes, TransportError> {
        recv(&self.rx, &self.closed).await
    }

    /// Receive the next frame, giving up after `wait`.
    ///
    /// Returns `None` on timeout.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if either side closed.
    pub async fn recv_timeout(&self, wait: Duration) -> Result<Option<Bytes>, TransportError> {
        match tokio::time::timeout(wait, self.recv()).await {
            Ok(frame) => frame.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Drop the connection as if the network failed.
    pub fn close(&self) {
        debug!("memory connection {} closed by peer", self.id);
        self.closed.cancel();
    }

    /// Whether either side has closed the connection.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Wait until either side closes the connection.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

impl Debug for MemoryPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPeer")
            .field("id", &self.id)
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

async fn send(
    tx: &flume::Sender<Bytes>,
    closed: &CancellationToken,
    frame: Bytes,
) -> Result<(), TransportError> {
    if closed.is_cancelled() {
        return Err(TransportError::ConnectionClosed);
    }

    tokio::select! {
        () = closed.cancelled() => Err(TransportError::ConnectionClosed),
        sent = tx.send_async(frame) => sent.map_err(|_| TransportError::ConnectionClosed),
    }
}

async fn recv(
    rx: &flume::Receiver<Bytes>,
    closed: &CancellationToken,
) -> Result<Bytes, TransportError> {
    tokio::select! {
        biased;
        () = closed.cancelled() => Err(TransportError::ConnectionClosed),
        frame = rx.recv_async() => frame.map_err(|_| TransportError::ConnectionClosed),
    }
}
