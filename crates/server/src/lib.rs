//! Server wiring for the `edgehub` binary.
//!
//! Loads the TLS material, binds the WebSocket and QUIC listeners and the
//! admin HTTP endpoint, and runs an [`EdgeHub`] until cancelled.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod args;
mod error;

pub use args::Args;
pub use error::{Error, Result};

use std::net::SocketAddr;
use std::sync::Arc;

use edgehub::{EdgeHub, admin_router};
use edgehub_transport::{ALPN_PROTOCOL, Listener};
use edgehub_transport::tls::{
    QUIC_TLS_VERSIONS, TCP_TLS_VERSIONS, TlsIdentity, load_certificates, server_config,
};
use edgehub_transport_quic::{QuicListener, QuicOptions};
use edgehub_transport_ws::{WebSocketListener, WebSocketOptions};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A bound server, ready to run.
#[derive(Debug)]
pub struct Server {
    hub: Arc<EdgeHub>,
    ws_addr: SocketAddr,
    quic_addr: Option<SocketAddr>,
    admin: TcpListener,
}

impl Server {
    /// Load TLS material, build the hub and bind every listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS files are unusable, the configuration is
    /// invalid, or a socket cannot be bound.
    pub async fn bind(args: &Args) -> Result<Self> {
        let identity = TlsIdentity::from_pem_files(&args.server_cert, &args.server_key)?;
        let trust_roots = load_certificates(&args.ca_cert)?;

        let hub = EdgeHub::new(args.hub_config())?;

        let ws_tls = server_config(&identity, &trust_roots, TCP_TLS_VERSIONS, &[])?;
        let ws = WebSocketListener::bind(
            WebSocketOptions {
                bind_addr: args.ws_listen,
                handshake_timeout: args.handshake_timeout(),
                ..WebSocketOptions::default()
            },
            Arc::new(ws_tls),
        )
        .await?;
        let ws_addr = ws.local_addr().unwrap_or(args.ws_listen);
        hub.serve(Arc::new(ws));

        let quic_addr = if args.disable_quic {
            None
        } else {
            let quic_tls =
                server_config(&identity, &trust_roots, QUIC_TLS_VERSIONS, &[ALPN_PROTOCOL])?;
            let quic = QuicListener::bind(
                QuicOptions {
                    bind_addr: args.quic_listen,
                    handshake_timeout: args.handshake_timeout(),
                    ..QuicOptions::default()
                },
                quic_tls,
            )?;
            let addr = quic.local_addr().unwrap_or(args.quic_listen);
            hub.serve(Arc::new(quic));
            Some(addr)
        };

        let admin = TcpListener::bind(args.admin_listen).await?;

        Ok(Self {
            hub,
            ws_addr,
            quic_addr,
            admin,
        })
    }

    /// The hub served by this server.
    #[must_use]
    pub const fn hub(&self) -> &Arc<EdgeHub> {
        &self.hub
    }

    /// Bound WebSocket address.
    #[must_use]
    pub const fn ws_addr(&self) -> SocketAddr {
        self.ws_addr
    }

    /// Bound QUIC address, if QUIC is enabled.
    #[must_use]
    pub const fn quic_addr(&self) -> Option<SocketAddr> {
        self.quic_addr
    }

    /// Bound admin HTTP address.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket address cannot be read.
    pub fn admin_addr(&self) -> Result<SocketAddr> {
        Ok(self.admin.local_addr()?)
    }

    /// Run until `shutdown` is cancelled, then stop the hub and the admin
    /// endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the admin server fails.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.hub.start();

        info!(
            ws = %self.ws_addr,
            quic = ?self.quic_addr,
            admin = %self.admin.local_addr()?,
            "edgehub serving"
        );

        let admin_shutdown = shutdown.clone();
        let admin = tokio::spawn(
            axum::serve(self.admin, admin_router(self.hub.clone()))
                .with_graceful_shutdown(async move { admin_shutdown.cancelled().await })
                .into_future(),
        );

        self.hub.run_until_cancelled(shutdown.clone()).await;
        shutdown.cancel();

        admin.await?.map_err(Error::Admin)?;

        info!("edgehub stopped");
        Ok(())
    }
}
