//! TLS WebSocket transport for edge node connections.
//!
//! The listener terminates TLS itself and requires a client certificate. The
//! verified certificate chain and the HTTP upgrade headers become the
//! connection's [`PeerIdentity`]. Each frame travels as one binary WebSocket
//! message.
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
use edgehub_transport::framing::DEFAULT_MAX_FRAME_SIZE;
use edgehub_transport::{
    Connection, FrameReader, FrameWriter, Listener, PeerIdentity, TransportError, TransportKind,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::error::{CapacityError, Error as WsError};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Options for the WebSocket listener.
#[derive(Clone, Debug)]
pub struct WebSocketOptions {
    /// Address to bind.
    pub bind_addr: SocketAddr,

    /// Maximum time for the TLS and upgrade handshakes of one connection.
    pub handshake_timeout: Duration,

    /// Largest accepted frame.
    pub max_frame_size: usize,

    /// Accepted connections buffered before `accept` is called.
    pub backlog: usize,
}

impl Default for WebSocketOptions {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 10000)),
            handshake_timeout: Duration::from_secs(10),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            backlog: 128,
        }
    }
}

/// TLS WebSocket listener.
pub struct WebSocketListener {
    local_addr: SocketAddr,
    connection_rx: flume::Receiver<Box<dyn Connection>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl WebSocketListener {
    /// Bind and start accepting connections.
    ///
    /// `tls` must demand client certificates; see
    /// [`edgehub_transport::tls::server_config`].
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    pub async fn bind(
        options: WebSocketOptions,
        tls: Arc<rustls::ServerConfig>,
    ) -> Result<Self, TransportError> {
        let tcp = TcpListener::bind(options.bind_addr).await?;
        let local_addr = tcp.local_addr()?;

        let (connection_tx, connection_rx) = flume::bounded(options.backlog);
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        tracker.spawn(accept_loop(
            tcp,
            TlsAcceptor::from(tls),
            options,
            connection_tx,
            shutdown.clone(),
            tracker.clone(),
        ));

        info!("WebSocket listener bound to {}", local_addr);

        Ok(Self {
            local_addr,
            connection_rx,
            shutdown,
            tracker,
        })
    }
}

impl Debug for WebSocketListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketListener")
            .field("local_addr", &self.local_addr)
            .field("closed", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Listener for WebSocketListener {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
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

    async fn close(&self) -> Result<(), TransportError> {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("WebSocket listener on {} closed", self.local_addr);
        Ok(())
    }
}

async fn accept_loop(
    tcp: TcpListener,
    acceptor: TlsAcceptor,
    options: WebSocketOptions,
    connection_tx: flume::Sender<Box<dyn Connection>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let (stream, remote_addr) = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = tcp.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("WebSocket accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let connection_tx = connection_tx.clone();
        let shutdown = shutdown.clone();
        let handshake_timeout = options.handshake_timeout;
        let max_frame_size = options.max_frame_size;

        tracker.spawn(async move {
            let handshake = tokio::time::timeout(
                handshake_timeout,
                server_handshake(stream, remote_addr, acceptor, max_frame_size),
            );

            let conn = tokio::select! {
                () = shutdown.cancelled() => return,
                result = handshake => match result {
                    Ok(Ok(conn)) => conn,
                    Ok(Err(e)) => {
                        debug!("WebSocket handshake with {} failed: {}", remote_addr, e);
                        return;
                    }
                    Err(_) => {
                        debug!("WebSocket handshake with {} timed out", remote_addr);
                        return;
                    }
                },
            };

            // The backlog may be full and nobody pulling once the listener closes.
            tokio::select! {
                () = shutdown.cancelled() => {
                    debug!("WebSocket listener closing, dropping connection from {}", remote_addr);
                }
                sent = connection_tx.send_async(Box::new(conn)) => {
                    if sent.is_err() {
                        debug!("WebSocket listener gone, dropping connection from {}", remote_addr);
                    }
                }
            }
        });
    }

    debug!("WebSocket accept loop stopped");
}

async fn server_handshake(
    stream: TcpStream,
    remote_addr: SocketAddr,
    acceptor: TlsAcceptor,
    max_frame_size: usize,
) -> Result<WebSocketConnection<tokio_rustls::server::TlsStream<TcpStream>>, TransportError> {
    let tls = acceptor.accept(stream).await?;

    let certificates = tls
        .get_ref()
        .1
        .peer_certificates()
        .map(|chain| chain.iter().map(|cert| cert.clone().into_owned()).collect())
        .unwrap_or_default();

    let mut headers = HashMap::new();
    let capture_headers = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        for (name, value) in request.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_string(), value.to_string());
            }
        }
        Ok(response)
    };

    let ws = tokio_tungstenite::accept_hdr_async_with_config(
        tls,
        capture_headers,
        Some(websocket_config(max_frame_size)),
    )
    .await
    .map_err(|e| TransportError::Handshake(e.to_string()))?;

    debug!("WebSocket connection from {} upgraded", remote_addr);

    Ok(WebSocketConnection::new(
        ws,
        PeerIdentity {
            certificates,
            headers,
            remote_addr: Some(remote_addr),
        },
        max_frame_size,
    ))
}

/// Oversized messages are refused by tungstenite while they arrive.
fn websocket_config(max_frame_size: usize) -> WebSocketConfig {
    WebSocketConfig::default()
        .max_message_size(Some(max_frame_size))
        .max_frame_size(Some(max_frame_size))
}

/// Client side connector, used by edge peers and tests.
#[derive(Clone)]
pub struct WebSocketConnector {
    tls: Arc<rustls::ClientConfig>,
    max_frame_size: usize,
}

impl WebSocketConnector {
    /// Create a connector presenting the client identity inside `tls`.
    #[must_use]
    pub const fn new(tls: Arc<rustls::ClientConfig>) -> Self {
        Self {
            tls,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Connect to `addr`, verifying the server as `server_name` and sending
    /// `headers` with the upgrade request.
    ///
    /// # Errors
    ///
    /// Returns an error if the TCP, TLS or WebSocket handshake fails.
    pub async fn connect(
        &self,
        addr: SocketAddr,
        server_name: &str,
        headers: &[(&str, &str)],
    ) -> Result<Box<dyn Connection>, TransportError> {
        let mut request = format!("wss://{server_name}:{}/", addr.port())
            .into_client_request()
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Handshake(e.to_string()))?;
            let value =
                HeaderValue::from_str(value).map_err(|e| TransportError::Handshake(e.to_string()))?;
            request.headers_mut().insert(name, value);
        }

        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        let tcp = TcpStream::connect(addr).await?;
        let tls = TlsConnector::from(self.tls.clone())
            .connect(server_name, tcp)
            .await?;

        let certificates: Vec<CertificateDer<'static>> = tls
            .get_ref()
            .1
            .peer_certificates()
            .map(|chain| chain.iter().map(|cert| cert.clone().into_owned()).collect())
            .unwrap_or_default();

        let (ws, _response) = tokio_tungstenite::client_async_with_config(
            request,
            tls,
            Some(websocket_config(self.max_frame_size)),
        )
        .await
        .map_err(|e| TransportError::Handshake(e.to_string()))?;

        debug!("WebSocket connected to {}", addr);

        Ok(Box::new(WebSocketConnection::new(
            ws,
            PeerIdentity {
                certificates,
                headers: HashMap::new(),
                remote_addr: Some(addr),
            },
            self.max_frame_size,
        )))
    }
}

impl Debug for WebSocketConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketConnector").finish_non_exhaustive()
    }
}

/// An upgraded WebSocket connection over any TLS stream.
struct WebSocketConnection<S> {
    ws: WebSocketStream<S>,
    identity: PeerIdentity,
    max_frame_size: usize,
}

impl<S> WebSocketConnection<S> {
    const fn new(ws: WebSocketStream<S>, identity: PeerIdentity, max_frame_size: usize) -> Self {
        Self {
            ws,
            identity,
            max_frame_size,
        }
    }
}

impl<S> Debug for WebSocketConnection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("remote_addr", &self.identity.remote_addr)
            .finish_non_exhaustive()
    }
}

impl<S> Connection for WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn peer_identity(&self) -> &PeerIdentity {
        &self.identity
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>) {
        let (sink, stream) = self.ws.split();
        (
            Box::new(WebSocketReader {
                stream,
                max_frame_size: self.max_frame_size,
            }),
            Box::new(WebSocketWriter { sink }),
        )
    }
}

struct WebSocketReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
    max_frame_size: usize,
}

#[async_trait]
impl<S> FrameReader for WebSocketReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn read_frame(&mut self) -> Result<Bytes, TransportError> {
        loop {
            let frame = match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Text(text))) => Bytes::copy_from_slice(text.as_str().as_bytes()),
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::ConnectionClosed),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Err(WsError::Capacity(CapacityError::MessageTooLong { size, .. }))) => {
                    return Err(TransportError::FrameTooLarge {
                        size,
                        limit: self.max_frame_size,
                    });
                }
                Some(Err(e)) => return Err(TransportError::WebSocket(e.to_string())),
            };

            if frame.len() > self.max_frame_size {
                return Err(TransportError::FrameTooLarge {
                    size: frame.len(),
                    limit: self.max_frame_size,
                });
            }

            return Ok(frame);
        }
    }
}

struct WebSocketWriter<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> FrameWriter for WebSocketWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn write_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.sink
            .send(Message::Binary(frame))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }
}
