use std::fmt::{self, Display};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use edgehub_attestation::NodeId;
use edgehub_transport::TransportKind;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::message::now_millis;
use crate::queue::ReliableQueue;

/// Lifecycle of a session.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SessionState {
    /// Created, not yet registered.
    Handshaking = 0,
    /// Registered and serving the node.
    Active = 1,
    /// Accepting no new work; workers are winding down.
    Draining = 2,
    /// Removed from the registry.
    Closed = 3,
}

impl SessionState {
    /// Log label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Handshaking => "handshaking",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Closed => "closed",
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Handshaking,
            1 => Self::Active,
            2 => Self::Draining,
            _ => Self::Closed,
        }
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloseReason {
    /// Another session registered for the same node.
    Replaced,
    /// No frame arrived within the idle timeout.
    Idle,
    /// Reading, writing or encoding failed.
    TransportError,
    /// Closed by an operator.
    Evicted,
    /// The hub is shutting down.
    Shutdown,
}

impl CloseReason {
    /// Metric and log label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Replaced => "replaced",
            Self::Idle => "idle",
            Self::TransportError => "transport_error",
            Self::Evicted => "evicted",
            Self::Shutdown => "shutdown",
        }
    }
}

impl Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A live connection with one edge node.
///
/// The session holds a reference to its node's pending queue; the queue knows
/// nothing about sessions, so a replacement session simply takes over the
/// same queue.
pub struct Session {
    id: u64,
    node_id: NodeId,
    transport: TransportKind,
    project_id: Option<String>,
    remote_addr: Option<SocketAddr>,
    connected_at: i64,
    created: Instant,
    last_heard: AtomicU64,
    state: AtomicU8,
    close_reason: OnceLock<CloseReason>,
    queue: Arc<ReliableQueue>,
    cancel: CancellationToken,
}

impl Session {
    pub(crate) fn new(
        id: u64,
        node_id: NodeId,
        transport: TransportKind,
        project_id: Option<String>,
        remote_addr: Option<SocketAddr>,
        queue: Arc<ReliableQueue>,
    ) -> Self {
        Self {
            id,
            node_id,
            transport,
            project_id,
            remote_addr,
            connected_at: now_millis(),
            created: Instant::now(),
            last_heard: AtomicU64::new(0),
            state: AtomicU8::new(SessionState::Handshaking as u8),
            close_reason: OnceLock::new(),
            queue,
            cancel: CancellationToken::new(),
        }
    }

    /// Hub-local session number.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Attested node identity.
    #[must_use]
    pub const fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Adapter serving this session.
    #[must_use]
    pub const fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Project the node declared in its handshake.
    #[must_use]
    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    /// The node's pending queue.
    #[must_use]
    pub const fn queue(&self) -> &Arc<ReliableQueue> {
        &self.queue
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the session is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// The reason recorded by the winning drain, if any.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    fn transition(&self, from: SessionState, to: SessionState, reason: &str) -> bool {
        let swapped = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if swapped {
            info!(
                node_id = %self.node_id,
                transport = %self.transport,
                session_id = self.id,
                from_state = from.as_str(),
                to_state = to.as_str(),
                reason,
                "session state changed"
            );
        }

        swapped
    }

    pub(crate) fn activate(&self) -> bool {
        self.touch();
        self.transition(SessionState::Handshaking, SessionState::Active, "registered")
    }

    /// Move to draining. Only the first caller wins; it records the reason
    /// and, unless the hub is shutting down, stops both workers.
    ///
    /// Returns whether this call performed the transition.
    pub fn drain(&self, reason: CloseReason) -> bool {
        let won = self.transition(SessionState::Active, SessionState::Draining, reason.as_str())
            || self.transition(
                SessionState::Handshaking,
                SessionState::Draining,
                reason.as_str(),
            );

        if won {
            let _ = self.close_reason.set(reason);
            if reason != CloseReason::Shutdown {
                self.cancel.cancel();
            }
        }

        won
    }

    /// Drain after an I/O failure and stop the workers in every case.
    pub(crate) fn fail(&self) {
        self.drain(CloseReason::TransportError);
        self.cancel.cancel();
    }

    /// Stop both workers without waiting for queued messages.
    pub(crate) fn force_close(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn close(&self) -> bool {
        let reason = self.close_reason().unwrap_or(CloseReason::TransportError);
        self.transition(SessionState::Draining, SessionState::Closed, reason.as_str())
    }

    pub(crate) async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Record that a frame arrived.
    pub fn touch(&self) {
        let elapsed = u64::try_from(self.created.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_heard.store(elapsed, Ordering::Release);
    }

    /// Time since the last frame arrived.
    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        let last_heard = self.created + Duration::from_millis(self.last_heard.load(Ordering::Acquire));
        now.saturating_duration_since(last_heard)
    }

    /// Snapshot for the admin surface.
    #[must_use]
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            node_id: self.node_id.clone(),
            session_id: self.id,
            transport: self.transport.as_str(),
            state: self.state(),
            project_id: self.project_id.clone(),
            remote_addr: self.remote_addr.map(|addr| addr.to_string()),
            connected_at: self.connected_at,
            idle_ms: u64::try_from(self.idle_for(Instant::now()).as_millis()).unwrap_or(u64::MAX),
            queue_depth: self.queue.len(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("node_id", &self.node_id)
            .field("transport", &self.transport)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Registered session as reported by `GET /nodes`.
#[derive(Clone, Debug, Serialize)]
pub struct SessionInfo {
    /// Node identity.
    pub node_id: NodeId,
    /// Hub-local session number.
    pub session_id: u64,
    /// Adapter label.
    pub transport: &'static str,
    /// Current state.
    pub state: SessionState,
    /// Declared project.
    pub project_id: Option<String>,
    /// Remote address, when known.
    pub remote_addr: Option<String>,
    /// Registration time in milliseconds since the Unix epoch.
    pub connected_at: i64,
    /// Milliseconds since the last inbound frame.
    pub idle_ms: u64,
    /// Pending outbound messages.
    pub queue_depth: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::HubMetrics;
    use crate::queue::QueuePolicy;
    use crate::HubConfig;

    fn session() -> Session {
        let metrics = Arc::new(HubMetrics::new().unwrap());
        let queue = ReliableQueue::new(
            NodeId::from("node-a"),
            QueuePolicy::from(&HubConfig::default()),
            metrics,
        );
        Session::new(
            1,
            NodeId::from("node-a"),
            TransportKind::Memory,
            None,
            None,
            Arc::new(queue),
        )
    }

    #[tokio::test]
    async fn test_only_first_drain_wins() {
        let session = session();
        assert!(session.activate());
        assert!(!session.activate());

        assert!(session.drain(CloseReason::Idle));
        assert!(!session.drain(CloseReason::TransportError));

        assert_eq!(session.state(), SessionState::Draining);
        assert_eq!(session.close_reason(), Some(CloseReason::Idle));
        assert!(session.cancel.is_cancelled());

        assert!(session.close());
        assert!(!session.close());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_shutdown_drain_keeps_workers_running() {
        let session = session();
        session.activate();

        assert!(session.drain(CloseReason::Shutdown));
        assert!(!session.cancel.is_cancelled());

        session.fail();
        assert!(session.cancel.is_cancelled());
        assert_eq!(session.close_reason(), Some(CloseReason::Shutdown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_time_resets_on_touch() {
        let session = session();
        session.activate();

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(session.idle_for(Instant::now()) >= Duration::from_secs(3));

        session.touch();
        assert!(session.idle_for(Instant::now()) < Duration::from_secs(1));
    }
}
