//! QUIC transport for edge node connections.
//!
//! Each QUIC connection carries exactly one bidirectional stream. The peer
//! opens it and writes a CBOR header map (at least `node_id`) as the first
//! frame; every following frame is one message. Frames are length prefixed
//! with [`edgehub_transport::framing`].
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use edgehub_transport::framing::{self, DEFAULT_MAX_FRAME_SIZE};
use edgehub_transport::{
    Connection, FrameReader, FrameWriter, Listener, PeerIdentity, TransportError, TransportKind,
};
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{Endpoint, RecvStream, SendStream, VarInt};
use rustls::pki_types::CertificateDer;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

const ENDPOINT_IDLE_TIMEOUT: Duration = Duration::from_secs(1);

/// Options for the QUIC listener.
#[derive(Clone, Debug)]
pub struct QuicOptions {
    /// UDP address to bind.
    pub bind_addr: SocketAddr,

    /// Maximum time from first packet to a readable header frame.
    pub handshake_timeout: Duration,

    /// QUIC-level idle timeout.
    pub idle_timeout: Duration,

    /// QUIC keep-alive interval, if any.
    pub keep_alive_interval: Option<Duration>,

    /// Largest accepted frame.
    pub max_frame_size: usize,

    /// Accepted connections buffered before `accept` is called.
    pub backlog: usize,
}

impl Default for QuicOptions {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 10001)),
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            keep_alive_interval: Some(Duration::from_secs(15)),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            backlog: 128,
        }
    }
}

/// QUIC listener.
pub struct QuicListener {
    endpoint: Endpoint,
    local_addr: SocketAddr,
    connection_rx: flume::Receiver<Box<dyn Connection>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl QuicListener {
    /// Bind and start accepting connections.
    ///
    /// `tls` must demand client certificates and allow TLS 1.3; see
    /// [`edgehub_transport::tls::server_config`].
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS configuration is unusable for QUIC or the
    /// socket cannot be bound.
    pub fn bind(options: QuicOptions, tls: rustls::ServerConfig) -> Result<Self, TransportError> {
        let crypto =
            QuicServerConfig::try_from(tls).map_err(|e| TransportError::Quic(e.to_string()))?;

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
        server_config.transport_config(Arc::new(transport_config(&options)?));

        let endpoint = Endpoint::server(server_config, options.bind_addr)?;
        let local_addr = endpoint.local_addr()?;

        let (connection_tx, connection_rx) = flume::bounded(options.backlog);
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        tracker.spawn(accept_loop(
            endpoint.clone(),
            options,
            connection_tx,
            shutdown.clone(),
            tracker.clone(),
        ));

        info!("QUIC listener bound to {}", local_addr);

        Ok(Self {
            endpoint,
            local_addr,
            connection_rx,
            shutdown,
            tracker,
        })
    }
}

impl Debug for QuicListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuicListener")
            .field("local_addr", &self.local_addr)
            .field("closed", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Listener for QuicListener {
    fn kind(&self) -> TransportKind {
        TransportKind::Quic
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }

    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError> {
        tokio::select! {
            () = self.shutdown.cancelled() => Err(TransportError::ListenerClosed),
            conn = self.connection_rx.recv_async() => conn.map_err(|_| TransportError::ListenerClosed),
        }
    }

    /// Refuse new connections. Connections already accepted keep the UDP
    /// socket until [`Listener::terminate`].
    async fn close(&self) -> Result<(), TransportError> {
        self.endpoint.set_server_config(None);
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("QUIC listener on {} closed", self.local_addr);
        Ok(())
    }

    async fn terminate(&self) {
        self.endpoint.close(VarInt::from_u32(0), b"shutdown");
        if tokio::time::timeout(ENDPOINT_IDLE_TIMEOUT, self.endpoint.wait_idle())
            .await
            .is_err()
        {
            debug!("QUIC endpoint on {} still busy after close", self.local_addr);
        }
        info!("QUIC endpoint on {} terminated", self.local_addr);
    }
}

fn transport_config(options: &QuicOptions) -> Result<quinn::TransportConfig, TransportError> {
    let idle_timeout = options
        .idle_timeout
        .try_into()
        .map_err(|_| TransportError::Quic("idle timeout out of range".to_string()))?;

    let mut config = quinn::TransportConfig::default();
    config.max_idle_timeout(Some(idle_timeout));
    config.keep_alive_interval(options.keep_alive_interval);
    Ok(config)
}

async fn accept_loop(
    endpoint: Endpoint,
    options: QuicOptions,
    connection_tx: flume::Sender<Box<dyn Connection>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let incoming = tokio::select! {
            () = shutdown.cancelled() => break,
            incoming = endpoint.accept() => match incoming {
                Some(incoming) => incoming,
                None => break,
            },
        };

        let connection_tx = connection_tx.clone();
        let shutdown = shutdown.clone();
        let handshake_timeout = options.handshake_timeout;
        let max_frame_size = options.max_frame_size;

        tracker.spawn(async move {
            let remote_addr = incoming.remote_address();
            let handshake = tokio::time::timeout(
                handshake_timeout,
                server_handshake(incoming, max_frame_size),
            );

            let conn = tokio::select! {
                () = shutdown.cancelled() => return,
                result = handshake => match result {
                    Ok(Ok(conn)) => conn,
                    Ok(Err(e)) => {
                        debug!("QUIC handshake with {} failed: {}", remote_addr, e);
                        return;
                    }
                    Err(_) => {
                        debug!("QUIC handshake with {} timed out", remote_addr);
                        return;
                    }
                },
            };

            // The backlog may be full and nobody pulling once the listener closes.
            tokio::select! {
                () = shutdown.cancelled() => {
                    debug!("QUIC listener closing, dropping connection from {}", remote_addr);
                }
                sent = connection_tx.send_async(Box::new(conn)) => {
                    if sent.is_err() {
                        debug!("QUIC listener gone, dropping connection from {}", remote_addr);
                    }
                }
            }
        });
    }

    debug!("QUIC accept loop stopped");
}

async fn server_handshake(
    incoming: quinn::Incoming,
    max_frame_size: usize,
) -> Result<QuicConnection, TransportError> {
    let connection = incoming.await.map_err(|e| TransportError::Quic(e.to_string()))?;
    let certificates = peer_certificates(&connection);

    let (send, mut recv) = connection
        .accept_bi()
        .await
        .map_err(|e| TransportError::Quic(e.to_string()))?;

    let header_frame = framing::read_frame(&mut recv, max_frame_size).await?;
    let headers: HashMap<String, String> = ciborium::from_reader(header_frame.as_ref())
        .map_err(|e| TransportError::Handshake(format!("invalid header frame: {e}")))?;

    Ok(QuicConnection {
        identity: PeerIdentity {
            certificates,
            headers,
            remote_addr: Some(connection.remote_address()),
        },
        connection,
        send,
        recv,
        max_frame_size,
        endpoint: None,
    })
}

fn peer_certificates(connection: &quinn::Connection) -> Vec<CertificateDer<'static>> {
    connection
        .peer_identity()
        .and_then(|identity| identity.downcast::<Vec<CertificateDer<'static>>>().ok())
        .map(|chain| *chain)
        .unwrap_or_default()
}

/// Client side connector, used by edge peers and tests.
#[derive(Clone)]
pub struct QuicConnector {
    endpoint: Endpoint,
    max_frame_size: usize,
}

impl QuicConnector {
    /// Create a client endpoint bound to `bind_addr` presenting the identity in `tls`.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS configuration is unusable for QUIC or the
    /// socket cannot be bound.
    pub fn new(tls: rustls::ClientConfig, bind_addr: SocketAddr) -> Result<Self, TransportError> {
        let crypto =
            QuicClientConfig::try_from(tls).map_err(|e| TransportError::Quic(e.to_string()))?;

        let mut endpoint = Endpoint::client(bind_addr)?;
        endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(crypto)));

        Ok(Self {
            endpoint,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        })
    }

    /// Connect to `addr`, verifying the server as `server_name`, and send
    /// `headers` as the first frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the QUIC handshake or the header frame fails.
    pub async fn connect(
        &self,
        addr: SocketAddr,
        server_name: &str,
        headers: &[(&str, &str)],
    ) -> Result<Box<dyn Connection>, TransportError> {
        let connection = self
            .endpoint
            .connect(addr, server_name)
            .map_err(|e| TransportError::Quic(e.to_string()))?
            .await
            .map_err(|e| TransportError::Quic(e.to_string()))?;

        let certificates = peer_certificates(&connection);

        let (mut send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| TransportError::Quic(e.to_string()))?;

        let header_map: HashMap<&str, &str> = headers.iter().copied().collect();
        let mut header_frame = Vec::new();
        ciborium::into_writer(&header_map, &mut header_frame)
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        framing::write_frame(&mut send, &header_frame, self.max_frame_size).await?;

        debug!("QUIC connected to {}", addr);

        Ok(Box::new(QuicConnection {
            identity: PeerIdentity {
                certificates,
                headers: HashMap::new(),
                remote_addr: Some(addr),
            },
            connection,
            send,
            recv,
            max_frame_size: self.max_frame_size,
            endpoint: Some(self.endpoint.clone()),
        }))
    }
}

impl Debug for QuicConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuicConnector").finish_non_exhaustive()
    }
}

struct QuicConnection {
    identity: PeerIdentity,
    connection: quinn::Connection,
    send: SendStream,
    recv: RecvStream,
    max_frame_size: usize,
    // Client connections keep their endpoint alive.
    endpoint: Option<Endpoint>,
}

impl Debug for QuicConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuicConnection")
            .field("remote_addr", &self.connection.remote_address())
            .finish_non_exhaustive()
    }
}

impl Connection for QuicConnection {
    fn kind(&self) -> TransportKind {
        TransportKind::Quic
    }

    fn peer_identity(&self) -> &PeerIdentity {
        &self.identity
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>) {
        (
            Box::new(QuicReader {
                recv: self.recv,
                max_frame_size: self.max_frame_size,
            }),
            Box::new(QuicWriter {
                connection: self.connection,
                send: self.send,
                max_frame_size: self.max_frame_size,
                _endpoint: self.endpoint,
            }),
        )
    }
}

struct QuicReader {
    recv: RecvStream,
    max_frame_size: usize,
}

#[async_trait]
impl FrameReader for QuicReader {
    async fn read_frame(&mut self) -> Result<Bytes, TransportError> {
        framing::read_frame(&mut self.recv, self.max_frame_size).await
    }
}

struct QuicWriter {
    connection: quinn::Connection,
    send: SendStream,
    max_frame_size: usize,
    _endpoint: Option<Endpoint>,
}

#[async_trait]
impl FrameWriter for QuicWriter {
    async fn write_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        framing::write_frame(&mut self.send, &frame, self.max_frame_size).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Err(e) = self.send.finish() {
            warn!("QUIC stream already closed: {}", e);
        }
        self.connection.close(VarInt::from_u32(0), b"closed");
        Ok(())
    }
}
