use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use edgehub_attestation::{NodeAttestor, NodeId};
use edgehub_transport::{Connection, Listener, TransportError};
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::bus::{GroupChannels, ModuleBus};
use crate::dispatcher::Dispatcher;
use crate::metrics::HubMetrics;
use crate::queue::ReliableQueue;
use crate::session::{CloseReason, Session, SessionInfo};
use crate::session_manager::SessionManager;
use crate::{HubConfig, Result};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// The cloud side of the edge control channel.
///
/// Accepts node connections from any number of listeners, keeps one session
/// per node and relays messages between nodes and in-process controllers.
pub struct EdgeHub {
    config: Arc<HubConfig>,
    attestor: NodeAttestor,
    metrics: Arc<HubMetrics>,
    channels: Arc<GroupChannels>,
    dispatcher: Arc<Dispatcher>,
    sessions: Arc<SessionManager>,
    listeners: Mutex<Vec<Arc<dyn Listener>>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    started: AtomicBool,
    stopped: OnceCell<()>,
}

impl EdgeHub {
    /// Build a hub. Nothing runs until [`EdgeHub::start`] and
    /// [`EdgeHub::serve`] are called.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or metrics cannot be
    /// registered.
    pub fn new(config: HubConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let config = Arc::new(config);
        let metrics = Arc::new(HubMetrics::new()?);
        let channels = Arc::new(GroupChannels::new(
            config.group_channel_capacity,
            config.all_groups(),
        ));
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let dispatcher = Arc::new(Dispatcher::new(
            config.clone(),
            channels.clone(),
            metrics.clone(),
            cancel.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(
            config.clone(),
            dispatcher.clone(),
            metrics.clone(),
            tracker.clone(),
            cancel.clone(),
        ));

        if !config.node_attestation_enabled {
            warn!("node attestation disabled, claimed node identities are trusted");
        }

        Ok(Arc::new(Self {
            attestor: NodeAttestor::new(config.node_attestation_enabled),
            config,
            metrics,
            channels,
            dispatcher,
            sessions,
            listeners: Mutex::new(Vec::new()),
            cancel,
            tracker,
            started: AtomicBool::new(false),
            stopped: OnceCell::new(),
        }))
    }

    /// Start the liveness sweep. Calling it again has no effect.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        self.tracker
            .spawn(self.sessions.clone().run_liveness(self.cancel.clone()));

        info!(
            groups = ?self.channels.groups(),
            attestation = self.attestor.is_enabled(),
            "edge hub started"
        );
    }

    /// Accept connections from `listener` until shutdown.
    pub fn serve(self: &Arc<Self>, listener: Arc<dyn Listener>) {
        if self.cancel.is_cancelled() {
            let listener = listener.clone();
            tokio::spawn(async move {
                if let Err(err) = listener.close().await {
                    debug!(error = %err, "failed to close listener");
                }
            });
            return;
        }

        self.listeners.lock().push(listener.clone());
        self.tracker.spawn(self.clone().accept_loop(listener));
    }

    async fn accept_loop(self: Arc<Self>, listener: Arc<dyn Listener>) {
        info!(
            transport = %listener.kind(),
            addr = ?listener.local_addr(),
            "accepting edge connections"
        );

        loop {
            let accepted = tokio::select! {
                () = self.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok(connection) => {
                    let hub = self.clone();
                    self.tracker.spawn(async move { hub.admit(connection).await });
                }
                Err(TransportError::ListenerClosed) => break,
                Err(err) => warn!(transport = %listener.kind(), error = %err, "accept failed"),
            }
        }

        if self.cancel.is_cancelled() {
            if let Err(err) = listener.close().await {
                debug!(transport = %listener.kind(), error = %err, "failed to close listener");
            }
        }

        debug!(transport = %listener.kind(), "accept loop stopped");
    }

    async fn admit(self: Arc<Self>, connection: Box<dyn Connection>) {
        let transport = connection.kind();
        let remote_addr = connection.peer_identity().remote_addr;

        match self.attestor.attest(connection.peer_identity()) {
            Ok(node_id) => {
                if let Err(err) = self.sessions.register(node_id.clone(), connection).await {
                    debug!(node_id = %node_id, error = %err, "registration failed");
                }
            }
            Err(err) => {
                self.metrics
                    .attestation_failures_total
                    .with_label_values(&[err.reason()])
                    .inc();
                warn!(
                    transport = %transport,
                    remote_addr = ?remote_addr,
                    reason = err.reason(),
                    error = %err,
                    "node attestation failed"
                );

                if let Err(err) = edgehub_transport::reject(connection).await {
                    debug!(error = %err, "failed to close rejected connection");
                }
            }
        }
    }

    /// Stop the hub: refuse new connections and dispatches, let sessions
    /// flush for the shutdown grace period, then close everything and wait
    /// for all tasks. Concurrent and repeated calls wait for the same stop.
    pub async fn shutdown(&self) {
        self.stopped.get_or_init(|| self.stop()).await;
    }

    async fn stop(&self) {
        info!("edge hub shutting down");
        self.cancel.cancel();

        let listeners = std::mem::take(&mut *self.listeners.lock());
        for listener in &listeners {
            if let Err(err) = listener.close().await {
                warn!(transport = %listener.kind(), error = %err, "failed to close listener");
            }
        }

        self.sessions.drain_all(CloseReason::Shutdown);

        let deadline = Instant::now() + self.config.shutdown_grace;
        while self.sessions.connected_pending() > 0 && Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL_INTERVAL.min(deadline - Instant::now())).await;
        }

        let unflushed = self.sessions.connected_pending();
        if unflushed > 0 {
            warn!(pending = unflushed, "shutdown grace elapsed with unacknowledged messages");
        }

        self.sessions.force_close_all();
        self.dispatcher.close_queues();

        self.tracker.close();
        self.tracker.wait().await;

        for listener in &listeners {
            listener.terminate().await;
        }

        info!("edge hub stopped");
    }

    /// Shut down once `parent` is cancelled.
    pub async fn run_until_cancelled(&self, parent: CancellationToken) {
        tokio::select! {
            () = parent.cancelled() => {}
            () = self.cancel.cancelled() => {}
        }
        self.shutdown().await;
    }

    /// Whether shutdown has begun.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Handle for controllers.
    #[must_use]
    pub fn bus(&self) -> ModuleBus {
        ModuleBus::new(
            self.channels.clone(),
            self.dispatcher.clone(),
            self.cancel.clone(),
        )
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Metrics of this hub.
    #[must_use]
    pub const fn metrics(&self) -> &Arc<HubMetrics> {
        &self.metrics
    }

    /// Snapshots of all registered sessions.
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.sessions()
    }

    /// The registered session of a node.
    #[must_use]
    pub fn session(&self, node_id: &NodeId) -> Option<Arc<Session>> {
        self.sessions.get(node_id)
    }

    /// Close a node's session on operator request.
    pub fn evict(&self, node_id: &NodeId) -> bool {
        let evicted = self.sessions.evict(node_id);
        if evicted {
            info!(node_id = %node_id, "session evicted by operator");
        }
        evicted
    }

    /// The pending queue of a node, if one exists.
    #[must_use]
    pub fn queue(&self, node_id: &NodeId) -> Option<Arc<ReliableQueue>> {
        self.dispatcher.queue(node_id)
    }

    /// Pending messages for a node.
    #[must_use]
    pub fn pending(&self, node_id: &NodeId) -> usize {
        self.queue(node_id).map_or(0, |queue| queue.len())
    }
}

impl std::fmt::Debug for EdgeHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeHub")
            .field("sessions", &self.sessions.len())
            .field("shutting_down", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}
