//! End-to-end tests of the hub over the in-memory transport

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode};
use bytes::Bytes;
use edgehub::{
    DropReason, EdgeHub, Error, HubConfig, Message, NodeId, Operation, SessionState, admin_router,
};
use edgehub_test_pki::TestPki;
use edgehub_transport::{NODE_ID_HEADER, PeerIdentity, TransportError};
use edgehub_transport_memory::{MemoryConnector, MemoryListener, MemoryPeer};
use tokio::time::{sleep, timeout};
use tower::ServiceExt;

const WAIT: Duration = Duration::from_secs(5);

struct TestHub {
    hub: Arc<EdgeHub>,
    connector: MemoryConnector,
    pki: TestPki,
}

impl TestHub {
    fn start(config: HubConfig) -> Self {
        let _ = tracing_subscriber::fmt::try_init();

        let hub = EdgeHub::new(config).unwrap();
        hub.start();

        let listener = Arc::new(MemoryListener::new());
        let connector = listener.connector();
        hub.serve(listener);

        Self {
            hub,
            connector,
            pki: TestPki::generate(),
        }
    }

    fn identity(&self, certified: &str, claimed: &str) -> PeerIdentity {
        let mut identity = PeerIdentity {
            certificates: self.pki.node_identity(certified).chain,
            ..PeerIdentity::default()
        };
        identity
            .headers
            .insert(NODE_ID_HEADER.to_string(), claimed.to_string());
        identity
    }

    async fn connect(&self, node: &str) -> MemoryPeer {
        let node_id = NodeId::from(node);
        let previous = self.hub.session(&node_id).map(|session| session.id());

        let peer = self.connector.connect(self.identity(node, node)).unwrap();

        wait_until(|| {
            self.hub
                .session(&node_id)
                .is_some_and(|session| session.is_active() && Some(session.id()) != previous)
        })
        .await;

        peer
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn recv_message(peer: &MemoryPeer) -> Message {
    let frame = timeout(WAIT, peer.recv())
        .await
        .expect("no frame received")
        .expect("connection closed");
    Message::decode(&frame).unwrap()
}

async fn ack(peer: &MemoryPeer, message: &Message) {
    let response = Message::response_to(message, "edged");
    peer.send(response.encode().unwrap()).await.unwrap();
}

fn update(node: &str, name: &str) -> Message {
    Message::new(
        "controller",
        "edged",
        format!("node/{node}/pod/{name}"),
        Operation::Update,
    )
    .with_content("text/plain", Bytes::from_static(b"X"))
}

#[tokio::test]
async fn test_happy_path_delivers_once_and_acks() {
    let test = TestHub::start(HubConfig::default());
    let node_id = NodeId::from("node-a");
    let peer = test.connect("node-a").await;

    let id = test.hub.bus().dispatch(update("node-a", "p1")).await.unwrap();
    assert!(!id.is_empty());

    let received = recv_message(&peer).await;
    assert_eq!(received.id, id);
    assert_eq!(received.operation, Operation::Update);
    assert_eq!(received.resource, "node/node-a/pod/p1");
    assert_eq!(received.content.data, Bytes::from_static(b"X"));

    ack(&peer, &received).await;
    wait_until(|| test.hub.pending(&node_id) == 0).await;

    let metrics = test.hub.metrics();
    assert_eq!(metrics.messages_acked_total.get(), 1);
    assert_eq!(metrics.messages_out_total.with_label_values(&["edged"]).get(), 1);
    assert_eq!(metrics.resend_total.get(), 0);
    assert!(
        peer.recv_timeout(Duration::from_millis(300))
            .await
            .unwrap()
            .is_none()
    );

    test.hub.shutdown().await;
}

#[tokio::test]
async fn test_identity_mismatch_is_rejected() {
    let test = TestHub::start(HubConfig::default());

    let peer = test
        .connector
        .connect(test.identity("node-a", "node-b"))
        .unwrap();

    timeout(WAIT, peer.closed()).await.expect("connection not closed");

    let metrics = test.hub.metrics();
    assert_eq!(
        metrics
            .attestation_failures_total
            .with_label_values(&["identity_mismatch"])
            .get(),
        1
    );
    assert_eq!(metrics.sessions_opened_total.get(), 0);
    assert!(test.hub.sessions().is_empty());

    test.hub.shutdown().await;
}

#[tokio::test]
async fn test_certificates_without_node_identity_are_rejected() {
    let test = TestHub::start(HubConfig::default());

    let mut plain_cn = PeerIdentity {
        certificates: test.pki.client_identity(Some("node-a")).chain,
        ..PeerIdentity::default()
    };
    plain_cn
        .headers
        .insert(NODE_ID_HEADER.to_string(), "node-a".to_string());

    let no_claim = PeerIdentity {
        certificates: test.pki.node_identity("node-a").chain,
        ..PeerIdentity::default()
    };

    let mut no_cert = PeerIdentity::default();
    no_cert
        .headers
        .insert(NODE_ID_HEADER.to_string(), "node-a".to_string());

    for identity in [plain_cn, no_claim, no_cert] {
        let peer = test.connector.connect(identity).unwrap();
        timeout(WAIT, peer.closed()).await.expect("connection not closed");
    }

    let failures = &test.hub.metrics().attestation_failures_total;
    assert_eq!(failures.with_label_values(&["bad_cn_prefix"]).get(), 1);
    assert_eq!(failures.with_label_values(&["missing_node_id"]).get(), 1);
    assert_eq!(failures.with_label_values(&["no_peer_cert"]).get(), 1);
    assert_eq!(test.hub.metrics().sessions_opened_total.get(), 0);

    test.hub.shutdown().await;
}

#[tokio::test]
async fn test_attestation_disabled_trusts_claim() {
    let test = TestHub::start(HubConfig {
        node_attestation_enabled: false,
        ..HubConfig::default()
    });

    let mut identity = PeerIdentity::default();
    identity
        .headers
        .insert(NODE_ID_HEADER.to_string(), "node-x".to_string());
    let _peer = test.connector.connect(identity).unwrap();

    wait_until(|| test.hub.session(&NodeId::from("node-x")).is_some()).await;

    test.hub.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_hands_over_in_flight_message() {
    let test = TestHub::start(HubConfig {
        resend_interval: Duration::from_millis(500),
        ..HubConfig::default()
    });
    let node_id = NodeId::from("node-a");

    let first = test.connect("node-a").await;
    let id = test.hub.bus().dispatch(update("node-a", "p1")).await.unwrap();
    assert_eq!(recv_message(&first).await.id, id);

    first.close();
    wait_until(|| test.hub.session(&node_id).is_none()).await;
    assert_eq!(test.hub.pending(&node_id), 1);

    let second = test.connect("node-a").await;
    let resent = recv_message(&second).await;
    assert_eq!(resent.id, id);

    let queue = test.hub.queue(&node_id).unwrap();
    assert_eq!(queue.entry_state(&id).unwrap().send_count, 2);

    ack(&second, &resent).await;
    ack(&second, &resent).await;
    wait_until(|| test.hub.pending(&node_id) == 0).await;

    let metrics = test.hub.metrics();
    assert_eq!(metrics.messages_acked_total.get(), 1);
    assert_eq!(metrics.resend_total.get(), 1);
    assert_eq!(metrics.dropped_count(DropReason::DeadLetter), 0);
    assert!(
        second
            .recv_timeout(Duration::from_millis(800))
            .await
            .unwrap()
            .is_none()
    );

    test.hub.shutdown().await;
}

#[tokio::test]
async fn test_replacement_closes_previous_session() {
    let test = TestHub::start(HubConfig::default());
    let node_id = NodeId::from("node-a");
    let bus = test.hub.bus();

    let first = test.connect("node-a").await;
    let first_id = test.hub.session(&node_id).unwrap().id();
    let second = test.connect("node-a").await;

    timeout(WAIT, first.closed()).await.expect("old session not closed");
    wait_until(|| test.hub.metrics().closed_count("replaced") == 1).await;

    let sessions = test.hub.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].state, SessionState::Active);
    assert_ne!(sessions[0].session_id, first_id);
    assert!(!second.is_closed());
    assert_eq!(test.hub.metrics().sessions_active.get(), 1);
    assert_eq!(test.hub.metrics().sessions_opened_total.get(), 2);

    let event = bus.try_receive("edgecontroller").unwrap().unwrap();
    assert_eq!(event.operation, Operation::Connect);
    assert!(bus.try_receive("edgecontroller").unwrap().is_none());

    test.hub.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_connects_leave_one_session() {
    const CONNECTS: u64 = 8;

    let test = TestHub::start(HubConfig::default());
    let node_id = NodeId::from("node-a");
    let bus = test.hub.bus();
    let metrics = test.hub.metrics().clone();

    let peers: Vec<MemoryPeer> = (0..CONNECTS)
        .map(|_| {
            test.connector
                .connect(test.identity("node-a", "node-a"))
                .unwrap()
        })
        .collect();

    wait_until(|| {
        metrics.sessions_opened_total.get() == CONNECTS
            && metrics.closed_count("replaced") == CONNECTS - 1
    })
    .await;
    wait_until(|| peers.iter().filter(|peer| peer.is_closed()).count() == peers.len() - 1).await;

    let sessions = test.hub.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].node_id, node_id);
    assert_eq!(sessions[0].state, SessionState::Active);
    assert_eq!(metrics.sessions_active.get(), 1);

    // The surviving connection is the registered session.
    let survivor = peers.iter().find(|peer| !peer.is_closed()).unwrap();
    let id = bus.dispatch(update("node-a", "p1")).await.unwrap();
    assert_eq!(recv_message(survivor).await.id, id);

    let event = bus.try_receive("edgecontroller").unwrap().unwrap();
    assert_eq!(event.operation, Operation::Connect);
    assert!(bus.try_receive("edgecontroller").unwrap().is_none());

    test.hub.shutdown().await;
}

#[tokio::test]
async fn test_draining_sessions_are_not_counted_active() {
    let test = TestHub::start(HubConfig {
        shutdown_grace: Duration::from_secs(5),
        ..HubConfig::default()
    });
    let node_id = NodeId::from("node-a");
    let peer = test.connect("node-a").await;
    assert_eq!(test.hub.metrics().sessions_active.get(), 1);

    test.hub.bus().dispatch(update("node-a", "p1")).await.unwrap();
    let message = recv_message(&peer).await;

    let hub = test.hub.clone();
    let stopping = tokio::spawn(async move { hub.shutdown().await });

    // Unacked work keeps the session registered while it drains.
    wait_until(|| {
        test.hub
            .session(&node_id)
            .is_some_and(|session| session.state() == SessionState::Draining)
    })
    .await;
    assert_eq!(test.hub.sessions().len(), 1);
    assert_eq!(test.hub.metrics().sessions_active.get(), 0);

    ack(&peer, &message).await;
    timeout(WAIT, stopping).await.expect("shutdown hung").unwrap();
    assert_eq!(test.hub.metrics().sessions_active.get(), 0);
}

#[tokio::test]
async fn test_unacked_message_resent_until_max_resends() {
    let test = TestHub::start(HubConfig {
        resend_interval: Duration::from_millis(100),
        max_resends: 2,
        ..HubConfig::default()
    });
    let node_id = NodeId::from("node-a");
    let peer = test.connect("node-a").await;

    let id = test.hub.bus().dispatch(update("node-a", "p1")).await.unwrap();

    for _ in 0..3 {
        assert_eq!(recv_message(&peer).await.id, id);
    }

    wait_until(|| test.hub.metrics().dropped_count(DropReason::MaxResends) == 1).await;
    assert_eq!(test.hub.pending(&node_id), 0);
    assert_eq!(test.hub.metrics().resend_total.get(), 2);
    assert!(
        peer.recv_timeout(Duration::from_millis(300))
            .await
            .unwrap()
            .is_none()
    );

    test.hub.shutdown().await;
}

#[tokio::test]
async fn test_full_queue_blocks_until_ack() {
    let test = TestHub::start(HubConfig {
        queue_bound: 4,
        ..HubConfig::default()
    });
    let bus = test.hub.bus();
    let peer = test.connect("node-a").await;

    for i in 0..4 {
        timeout(WAIT, bus.dispatch(update("node-a", &format!("p{i}"))))
            .await
            .unwrap()
            .unwrap();
    }

    assert!(matches!(
        bus.try_dispatch(update("node-a", "p4")).await,
        Err(Error::QueueFull(_))
    ));

    let blocked = {
        let bus = bus.clone();
        tokio::spawn(async move { bus.dispatch(update("node-a", "p4")).await })
    };
    sleep(Duration::from_millis(200)).await;
    assert!(!blocked.is_finished());

    let first = recv_message(&peer).await;
    ack(&peer, &first).await;

    let id = timeout(WAIT, blocked).await.unwrap().unwrap().unwrap();
    assert!(!id.is_empty());

    test.hub.shutdown().await;
}

#[tokio::test]
async fn test_blocked_dispatch_fails_on_shutdown() {
    let test = TestHub::start(HubConfig {
        queue_bound: 4,
        shutdown_grace: Duration::from_millis(100),
        ..HubConfig::default()
    });
    let bus = test.hub.bus();
    let _peer = test.connect("node-a").await;

    for i in 0..4 {
        bus.dispatch(update("node-a", &format!("p{i}"))).await.unwrap();
    }

    let blocked = {
        let bus = bus.clone();
        tokio::spawn(async move { bus.dispatch(update("node-a", "p4")).await })
    };
    sleep(Duration::from_millis(200)).await;
    assert!(!blocked.is_finished());

    test.hub.shutdown().await;

    assert!(matches!(blocked.await.unwrap(), Err(Error::Shutdown)));
}

#[tokio::test]
async fn test_idle_session_is_evicted() {
    let test = TestHub::start(HubConfig {
        idle_timeout: Duration::from_secs(2),
        sweep_interval: Duration::from_millis(100),
        ..HubConfig::default()
    });
    let node_id = NodeId::from("node-a");
    let peer = test.connect("node-a").await;

    timeout(WAIT, peer.closed()).await.expect("idle session not closed");
    wait_until(|| test.hub.metrics().closed_count("idle") == 1).await;
    assert!(test.hub.session(&node_id).is_none());

    test.hub.shutdown().await;
}

#[tokio::test]
async fn test_keepalives_keep_session_open() {
    let test = TestHub::start(HubConfig {
        idle_timeout: Duration::from_millis(300),
        sweep_interval: Duration::from_millis(50),
        ..HubConfig::default()
    });
    let node_id = NodeId::from("node-a");
    let peer = test.connect("node-a").await;
    let session_id = test.hub.session(&node_id).unwrap().id();

    let keepalive = Message::keepalive("edged").encode().unwrap();
    for _ in 0..10 {
        peer.send(keepalive.clone()).await.unwrap();
        sleep(Duration::from_millis(100)).await;
    }

    let session = test.hub.session(&node_id).unwrap();
    assert!(session.is_active());
    assert_eq!(session.id(), session_id);
    assert_eq!(test.hub.metrics().closed_count("idle"), 0);

    test.hub.shutdown().await;
}

#[tokio::test]
async fn test_inbound_messages_are_routed_to_groups() {
    let test = TestHub::start(HubConfig::default());
    let node_id = NodeId::from("node-a");
    let bus = test.hub.bus();
    let peer = test.connect("node-a").await;

    let twin = Message::new("edged", "", "twin/device-1", Operation::Update);
    peer.send(twin.encode().unwrap()).await.unwrap();

    let forwarded = timeout(WAIT, bus.receive("twin")).await.unwrap().unwrap();
    assert_eq!(forwarded.resource, "node/node-a/twin/device-1");
    assert!(!forwarded.id.is_empty());

    peer.send(Bytes::from_static(b"\xff\x00garbage")).await.unwrap();
    let unknown = Message::new("edged", "nowhere", "pod/p1", Operation::Update);
    peer.send(unknown.encode().unwrap()).await.unwrap();

    let metrics = test.hub.metrics().clone();
    wait_until(|| {
        metrics.dropped_count(DropReason::Malformed) == 1
            && metrics.dropped_count(DropReason::UnknownGroup) == 1
    })
    .await;

    assert!(test.hub.session(&node_id).unwrap().is_active());
    assert_eq!(metrics.messages_in_total.with_label_values(&["twin"]).get(), 1);

    test.hub.shutdown().await;
}

#[tokio::test]
async fn test_node_events_follow_connections() {
    let test = TestHub::start(HubConfig::default());
    let bus = test.hub.bus();

    let peer = test.connect("node-a").await;
    let connected = timeout(WAIT, bus.receive("edgecontroller")).await.unwrap().unwrap();
    assert_eq!(connected.operation, Operation::Connect);
    assert_eq!(connected.resource, "node/node-a");

    peer.close();
    let disconnected = timeout(WAIT, bus.receive("edgecontroller")).await.unwrap().unwrap();
    assert_eq!(disconnected.operation, Operation::Disconnect);
    assert_eq!(disconnected.resource, "node/node-a");

    test.hub.shutdown().await;
}

#[tokio::test]
async fn test_undelivered_messages_expire_without_session() {
    let test = TestHub::start(HubConfig {
        no_route_grace: Duration::from_millis(200),
        sweep_interval: Duration::from_millis(20),
        ..HubConfig::default()
    });
    let bus = test.hub.bus();

    assert!(matches!(
        bus.dispatch(Message::new("controller", "edged", "pod/p1", Operation::Update))
            .await,
        Err(Error::NoRoute(_))
    ));

    bus.dispatch(update("node-z", "p1")).await.unwrap();
    wait_until(|| test.hub.metrics().dropped_count(DropReason::NoRoute) == 1).await;
    wait_until(|| test.hub.queue(&NodeId::from("node-z")).is_none()).await;

    let peer = test.connect("node-a").await;
    bus.dispatch(update("node-a", "p1")).await.unwrap();
    recv_message(&peer).await;
    peer.close();

    wait_until(|| test.hub.metrics().dropped_count(DropReason::DeadLetter) == 1).await;
    assert_eq!(test.hub.pending(&NodeId::from("node-a")), 0);

    test.hub.shutdown().await;
}

#[tokio::test]
async fn test_node_limit_refuses_new_nodes_only() {
    let test = TestHub::start(HubConfig {
        node_limit: 1,
        ..HubConfig::default()
    });

    let _first = test.connect("node-a").await;

    let refused = test
        .connector
        .connect(test.identity("node-b", "node-b"))
        .unwrap();
    timeout(WAIT, refused.closed()).await.expect("connection not refused");
    assert_eq!(
        test.hub
            .metrics()
            .sessions_rejected_total
            .with_label_values(&["node_limit"])
            .get(),
        1
    );

    let _replacement = test.connect("node-a").await;
    assert_eq!(test.hub.sessions().len(), 1);

    test.hub.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_sessions_and_listeners() {
    let test = TestHub::start(HubConfig {
        shutdown_grace: Duration::from_millis(200),
        ..HubConfig::default()
    });
    let bus = test.hub.bus();

    let first = test.connect("node-a").await;
    let second = test.connect("node-b").await;
    bus.dispatch(update("node-a", "p1")).await.unwrap();

    test.hub.shutdown().await;

    assert!(test.hub.sessions().is_empty());
    assert!(first.is_closed());
    assert!(second.is_closed());
    assert_eq!(test.hub.metrics().closed_count("shutdown"), 2);
    assert_eq!(test.hub.metrics().sessions_active.get(), 0);
    assert!(matches!(
        test.connector.connect(test.identity("node-c", "node-c")),
        Err(TransportError::ListenerClosed)
    ));
    assert!(matches!(
        bus.dispatch(update("node-a", "p2")).await,
        Err(Error::Shutdown)
    ));

    test.hub.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_lets_sessions_flush() {
    let test = TestHub::start(HubConfig {
        shutdown_grace: Duration::from_secs(5),
        ..HubConfig::default()
    });
    let peer = test.connect("node-a").await;
    test.hub.bus().dispatch(update("node-a", "p1")).await.unwrap();

    let acker = tokio::spawn(async move {
        let message = recv_message(&peer).await;
        sleep(Duration::from_millis(100)).await;
        ack(&peer, &message).await;
        peer
    });

    timeout(Duration::from_secs(3), test.hub.shutdown())
        .await
        .expect("shutdown waited for the full grace period");

    acker.await.unwrap();
    assert_eq!(test.hub.metrics().messages_acked_total.get(), 1);
}

#[tokio::test]
async fn test_admin_lists_and_evicts_nodes() {
    let test = TestHub::start(HubConfig::default());
    let peer = test.connect("node-a").await;
    let router = admin_router(test.hub.clone());

    let response = router
        .clone()
        .oneshot(Request::get("/nodes").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let nodes: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(nodes[0]["node_id"], "node-a");
    assert_eq!(nodes[0]["state"], "active");
    assert_eq!(nodes[0]["transport"], "memory");

    let response = router
        .oneshot(
            Request::builder()
                .method(Method::DELETE)
                .uri("/nodes/node-a")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    timeout(WAIT, peer.closed()).await.expect("evicted session not closed");
    wait_until(|| test.hub.metrics().closed_count("evicted") == 1).await;

    test.hub.shutdown().await;
}
