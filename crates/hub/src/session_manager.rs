//! Registry of live sessions and the tasks that serve them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use edgehub_attestation::NodeId;
use edgehub_transport::{Connection, FrameReader, FrameWriter};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::dispatcher::Dispatcher;
use crate::message::Operation;
use crate::metrics::{DropReason, HubMetrics};
use crate::session::{CloseReason, Session, SessionInfo};
use crate::{Error, HubConfig, Result};

/// Owns the `node id -> session` registry and every session's workers.
///
/// The registry is a sharded map; registration, replacement and removal of a
/// node's session all happen under that node's shard lock, which is what
/// keeps at most one active session per node.
pub struct SessionManager {
    config: Arc<HubConfig>,
    registry: DashMap<NodeId, Arc<Session>>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<HubMetrics>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    next_session_id: AtomicU64,
}

impl SessionManager {
    pub(crate) fn new(
        config: Arc<HubConfig>,
        dispatcher: Arc<Dispatcher>,
        metrics: Arc<HubMetrics>,
        tracker: TaskTracker,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            registry: DashMap::new(),
            dispatcher,
            metrics,
            tracker,
            shutdown,
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Register an attested connection as the node's session and start its
    /// workers. An existing session for the node is drained and its pending
    /// queue carries over.
    ///
    /// # Errors
    ///
    /// [`Error::Shutdown`] while the hub stops, [`Error::NodeLimit`] when a new
    /// node would exceed the limit. The connection is closed in both cases.
    pub(crate) async fn register(
        self: &Arc<Self>,
        node_id: NodeId,
        connection: Box<dyn Connection>,
    ) -> Result<Arc<Session>> {
        if self.shutdown.is_cancelled() {
            self.refuse(&node_id, connection, "shutdown").await;
            return Err(Error::Shutdown);
        }

        if !self.registry.contains_key(&node_id) && self.registry.len() >= self.config.node_limit {
            self.refuse(&node_id, connection, "node_limit").await;
            return Err(Error::NodeLimit(self.config.node_limit));
        }

        let transport = connection.kind();
        let identity = connection.peer_identity();
        let project_id = identity.project_id().map(ToString::to_string);
        let remote_addr = identity.remote_addr;
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);

        let (session, replaced) = loop {
            let queue = self.dispatcher.queue_for(&node_id);
            let session = Arc::new(Session::new(
                session_id,
                node_id.clone(),
                transport,
                project_id.clone(),
                remote_addr,
                queue.clone(),
            ));

            match self.registry.entry(node_id.clone()) {
                Entry::Occupied(mut occupied) => {
                    if !queue.attach() {
                        continue;
                    }
                    session.activate();
                    let previous = occupied.insert(session.clone());
                    previous.drain(CloseReason::Replaced);
                    break (session, Some(previous));
                }
                Entry::Vacant(vacant) => {
                    if !queue.attach() {
                        continue;
                    }
                    session.activate();
                    vacant.insert(session.clone());
                    break (session, None);
                }
            }
        };

        self.metrics.sessions_opened_total.inc();
        self.update_active();

        match &replaced {
            Some(previous) => info!(
                node_id = %node_id,
                transport = %transport,
                replaced_session = previous.id(),
                pending = session.queue().len(),
                "node reconnected, pending queue handed over"
            ),
            None => {
                info!(node_id = %node_id, transport = %transport, "node connected");
                self.dispatcher.publish_node_event(&node_id, Operation::Connect);
            }
        }

        if self.shutdown.is_cancelled() {
            session.drain(CloseReason::Shutdown);
            session.force_close();
        }

        let (reader, writer) = connection.split();
        let read = self.tracker.spawn(self.clone().read_loop(session.clone(), reader));
        let write = self.tracker.spawn(self.clone().write_loop(session.clone(), writer));
        self.tracker
            .spawn(self.clone().supervise(session.clone(), read, write));

        Ok(session)
    }

    async fn refuse(&self, node_id: &NodeId, connection: Box<dyn Connection>, reason: &str) {
        self.metrics
            .sessions_rejected_total
            .with_label_values(&[reason])
            .inc();
        warn!(node_id = %node_id, transport = %connection.kind(), reason, "session refused");

        if let Err(err) = edgehub_transport::reject(connection).await {
            debug!(node_id = %node_id, error = %err, "failed to close refused connection");
        }
    }

    async fn read_loop(self: Arc<Self>, session: Arc<Session>, mut reader: Box<dyn FrameReader>) {
        loop {
            let frame = tokio::select! {
                biased;
                () = session.cancelled() => return,
                frame = reader.read_frame() => frame,
            };

            match frame {
                Ok(frame) => {
                    session.touch();
                    trace!(node_id = %session.node_id(), bytes = frame.len(), "frame received");
                    self.dispatcher.handle_inbound(&session, &frame).await;
                }
                Err(err) => {
                    if err.is_closed() {
                        debug!(node_id = %session.node_id(), "connection closed by peer");
                    } else {
                        warn!(node_id = %session.node_id(), error = %err, "read failed");
                    }
                    session.fail();
                    return;
                }
            }
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        session: Arc<Session>,
        mut writer: Box<dyn FrameWriter>,
    ) -> Box<dyn FrameWriter> {
        let queue = session.queue().clone();

        loop {
            let delivery = tokio::select! {
                biased;
                () = session.cancelled() => break,
                delivery = queue.next() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            let message = &delivery.message;
            let frame = match message.encode() {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(node_id = %session.node_id(), msg_id = %message.id, error = %err, "dropping unencodable message");
                    queue.discard(&message.id, DropReason::Malformed);
                    continue;
                }
            };

            match tokio::time::timeout(self.config.write_timeout, writer.write_frame(frame)).await {
                Ok(Ok(())) => {
                    if delivery.is_retransmission() {
                        self.metrics.resend_total.inc();
                        debug!(
                            node_id = %session.node_id(),
                            msg_id = %message.id,
                            send_count = delivery.send_count,
                            "message retransmitted"
                        );
                    } else {
                        self.metrics
                            .messages_out_total
                            .with_label_values(&[&message.group])
                            .inc();
                        trace!(node_id = %session.node_id(), msg_id = %message.id, "message sent");
                    }
                }
                Ok(Err(err)) => {
                    warn!(node_id = %session.node_id(), msg_id = %message.id, error = %err, "write failed");
                    session.fail();
                    break;
                }
                Err(_) => {
                    warn!(node_id = %session.node_id(), msg_id = %message.id, "write timed out");
                    session.fail();
                    break;
                }
            }
        }

        writer
    }

    async fn supervise(
        self: Arc<Self>,
        session: Arc<Session>,
        read: JoinHandle<()>,
        write: JoinHandle<Box<dyn FrameWriter>>,
    ) {
        if let Err(err) = read.await {
            warn!(node_id = %session.node_id(), error = %err, "read worker failed");
            session.fail();
        }

        match write.await {
            Ok(mut writer) => {
                if let Err(err) = writer.close().await {
                    debug!(node_id = %session.node_id(), error = %err, "failed to close connection");
                }
            }
            Err(err) => warn!(node_id = %session.node_id(), error = %err, "write worker failed"),
        }

        self.teardown(&session);
    }

    fn teardown(&self, session: &Arc<Session>) {
        session.drain(CloseReason::TransportError);

        let removed = self
            .registry
            .remove_if(session.node_id(), |_, current| {
                if Arc::ptr_eq(current, session) {
                    session.queue().detach(Instant::now());
                    true
                } else {
                    false
                }
            })
            .is_some();

        session.close();

        let reason = session.close_reason().unwrap_or(CloseReason::TransportError);
        self.metrics
            .sessions_closed_total
            .with_label_values(&[reason.as_str()])
            .inc();
        self.update_active();

        if removed {
            info!(
                node_id = %session.node_id(),
                transport = %session.transport(),
                reason = reason.as_str(),
                pending = session.queue().len(),
                "node disconnected"
            );
            self.dispatcher
                .publish_node_event(session.node_id(), Operation::Disconnect);
        }
    }

    // Draining sessions stay registered until teardown but are not counted.
    fn update_active(&self) {
        let active = self.registry.iter().filter(|entry| entry.is_active()).count();
        self.metrics
            .sessions_active
            .set(i64::try_from(active).unwrap_or(i64::MAX));
    }

    /// Evict idle sessions and sweep pending queues until `cancel` fires.
    pub(crate) async fn run_liveness(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let now = Instant::now();
            self.evict_idle(now);
            self.dispatcher.sweep(now);
        }

        debug!("liveness sweep stopped");
    }

    fn evict_idle(&self, now: Instant) -> usize {
        let idle: Vec<Arc<Session>> = self
            .registry
            .iter()
            .filter(|entry| {
                entry.is_active() && entry.idle_for(now) > self.config.idle_timeout
            })
            .map(|entry| entry.value().clone())
            .collect();

        let evicted = idle
            .iter()
            .filter(|session| session.drain(CloseReason::Idle))
            .count();
        if evicted > 0 {
            self.update_active();
        }
        evicted
    }

    /// Close a node's session on operator request.
    pub fn evict(&self, node_id: &NodeId) -> bool {
        let evicted = self
            .get(node_id)
            .is_some_and(|session| session.drain(CloseReason::Evicted));
        if evicted {
            self.update_active();
        }
        evicted
    }

    pub(crate) fn drain_all(&self, reason: CloseReason) {
        for entry in &self.registry {
            entry.drain(reason);
        }
        self.update_active();
    }

    pub(crate) fn force_close_all(&self) {
        for entry in &self.registry {
            entry.force_close();
        }
    }

    /// Pending messages of nodes that still have a session.
    #[must_use]
    pub fn connected_pending(&self) -> usize {
        self.registry.iter().map(|entry| entry.queue().len()).sum()
    }

    /// The registered session of a node.
    #[must_use]
    pub fn get(&self, node_id: &NodeId) -> Option<Arc<Session>> {
        self.registry.get(node_id).map(|entry| entry.value().clone())
    }

    /// Snapshots of all registered sessions, ordered by node id.
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> =
            self.registry.iter().map(|entry| entry.info()).collect();
        sessions.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        sessions
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    /// Whether no session is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.registry.len())
            .finish_non_exhaustive()
    }
}
