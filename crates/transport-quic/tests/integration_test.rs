//! Integration tests for the QUIC transport

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use edgehub_test_pki::TestPki;
use edgehub_transport::tls::{self, QUIC_TLS_VERSIONS, TlsIdentity};
use edgehub_transport::{
    ALPN_PROTOCOL, Connection, FrameReader, FrameWriter, Listener, NODE_ID_HEADER, TransportError,
    TransportKind,
};
use edgehub_transport_quic::{QuicConnector, QuicListener, QuicOptions};
use tokio::time::timeout;
use tracing::info;

fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

fn start_listener(pki: &TestPki) -> QuicListener {
    start_listener_with(
        pki,
        QuicOptions {
            bind_addr: loopback(),
            ..QuicOptions::default()
        },
    )
}

fn start_listener_with(pki: &TestPki, options: QuicOptions) -> QuicListener {
    let server = pki.server_identity();
    let config = tls::server_config(
        &TlsIdentity::new(server.chain, server.key),
        &[pki.ca_certificate()],
        QUIC_TLS_VERSIONS,
        &[ALPN_PROTOCOL],
    )
    .unwrap();

    QuicListener::bind(options, config).expect("Failed to bind")
}

fn connector(pki: &TestPki, node_id: &str) -> QuicConnector {
    let node = pki.node_identity(node_id);
    let config = tls::client_config(
        &TlsIdentity::new(node.chain, node.key),
        &[pki.ca_certificate()],
        QUIC_TLS_VERSIONS,
        &[ALPN_PROTOCOL],
    )
    .unwrap();

    QuicConnector::new(config, loopback()).unwrap()
}

#[tokio::test]
async fn test_quic_echo_server() {
    let _ = tracing_subscriber::fmt::try_init();

    let pki = TestPki::generate();
    let listener = start_listener(&pki);
    let addr = listener.local_addr().unwrap();

    let client = connector(&pki, "node-a")
        .connect(addr, "localhost", &[(NODE_ID_HEADER, "node-a")])
        .await
        .expect("Failed to connect");

    let conn = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("Accept timeout")
        .expect("Failed to accept connection");

    assert_eq!(conn.kind(), TransportKind::Quic);
    assert_eq!(conn.peer_identity().claimed_node_id(), Some("node-a"));
    assert!(!conn.peer_identity().certificates.is_empty());

    let server = tokio::spawn(async move {
        let (mut reader, mut writer) = conn.split();
        while let Ok(frame) = reader.read_frame().await {
            info!("Server echoing {} bytes", frame.len());
            if writer.write_frame(frame).await.is_err() {
                break;
            }
        }
        let _ = writer.close().await;
    });

    let (mut reader, mut writer) = client.split();
    for i in 0..5 {
        let payload = Bytes::from(format!("frame {i}"));
        writer.write_frame(payload.clone()).await.unwrap();

        let echoed = timeout(Duration::from_secs(5), reader.read_frame())
            .await
            .expect("Echo timeout")
            .unwrap();
        assert_eq!(echoed, payload);
    }

    writer.close().await.unwrap();
    timeout(Duration::from_secs(5), server)
        .await
        .expect("Server did not observe close")
        .unwrap();

    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_closed_listener_stops_accepting() {
    let _ = tracing_subscriber::fmt::try_init();

    let pki = TestPki::generate();
    let listener = start_listener(&pki);
    listener.close().await.unwrap();

    assert!(matches!(
        listener.accept().await,
        Err(TransportError::ListenerClosed)
    ));
}

#[tokio::test]
async fn test_close_with_full_backlog() {
    let _ = tracing_subscriber::fmt::try_init();

    let pki = TestPki::generate();
    let listener = start_listener_with(
        &pki,
        QuicOptions {
            bind_addr: loopback(),
            backlog: 1,
            ..QuicOptions::default()
        },
    );
    let addr = listener.local_addr().unwrap();

    let mut clients = Vec::new();
    for node_id in ["node-a", "node-b"] {
        let client = connector(&pki, node_id)
            .connect(addr, "localhost", &[(NODE_ID_HEADER, node_id)])
            .await
            .expect("Failed to connect");
        clients.push(client);
    }
    // Give both header frames time to arrive; only one fits the backlog.
    tokio::time::sleep(Duration::from_millis(200)).await;

    timeout(Duration::from_secs(5), listener.close())
        .await
        .expect("close() hung on a full backlog")
        .unwrap();
}

#[tokio::test]
async fn test_terminate_ends_open_connections() {
    let _ = tracing_subscriber::fmt::try_init();

    let pki = TestPki::generate();
    let listener = start_listener(&pki);
    let addr = listener.local_addr().unwrap();

    let client = connector(&pki, "node-a")
        .connect(addr, "localhost", &[(NODE_ID_HEADER, "node-a")])
        .await
        .expect("Failed to connect");
    let conn = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("Accept timeout")
        .unwrap();

    let (mut client_reader, mut client_writer) = client.split();
    let (mut reader, _writer) = conn.split();

    listener.close().await.unwrap();

    // Closing the listener leaves accepted connections running.
    client_writer
        .write_frame(Bytes::from_static(b"still here"))
        .await
        .unwrap();
    let frame = timeout(Duration::from_secs(5), reader.read_frame())
        .await
        .expect("Read timeout")
        .unwrap();
    assert_eq!(frame, Bytes::from_static(b"still here"));

    timeout(Duration::from_secs(5), listener.terminate())
        .await
        .expect("terminate() hung");

    assert!(
        timeout(Duration::from_secs(5), client_reader.read_frame())
            .await
            .expect("Client did not observe termination")
            .is_err()
    );
}
