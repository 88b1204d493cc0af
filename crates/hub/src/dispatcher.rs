//! Routing between sessions, pending queues and group channels.

use std::sync::Arc;

use dashmap::DashMap;
use edgehub_attestation::NodeId;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::bus::GroupChannels;
use crate::message::{HUB_SOURCE, Message, Operation, now_millis};
use crate::metrics::{DropReason, HubMetrics};
use crate::queue::{EnqueueMode, Enqueued, QueuePolicy, ReliableQueue};
use crate::session::Session;
use crate::{Error, HubConfig, Result};

/// Owns the per-node pending queues and moves messages in both directions.
pub struct Dispatcher {
    config: Arc<HubConfig>,
    policy: QueuePolicy,
    queues: DashMap<NodeId, Arc<ReliableQueue>>,
    channels: Arc<GroupChannels>,
    metrics: Arc<HubMetrics>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub(crate) fn new(
        config: Arc<HubConfig>,
        channels: Arc<GroupChannels>,
        metrics: Arc<HubMetrics>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            policy: QueuePolicy::from(config.as_ref()),
            config,
            queues: DashMap::new(),
            channels,
            metrics,
            shutdown,
        }
    }

    /// The pending queue of a node, created detached if missing.
    pub(crate) fn queue_for(&self, node_id: &NodeId) -> Arc<ReliableQueue> {
        self.queues
            .entry(node_id.clone())
            .or_insert_with(|| {
                Arc::new(ReliableQueue::new(
                    node_id.clone(),
                    self.policy,
                    self.metrics.clone(),
                ))
            })
            .value()
            .clone()
    }

    /// The pending queue of a node, if one exists.
    #[must_use]
    pub fn queue(&self, node_id: &NodeId) -> Option<Arc<ReliableQueue>> {
        self.queues.get(node_id).map(|queue| queue.value().clone())
    }

    /// Pending messages across all nodes.
    #[must_use]
    pub fn pending_total(&self) -> usize {
        self.queues.iter().map(|queue| queue.len()).sum()
    }

    /// Queue an outbound message for the node named by its resource.
    ///
    /// Assigns an id and timestamp when missing and returns the id. The node
    /// does not need a session: the message waits for one until the no-route
    /// grace period runs out.
    ///
    /// # Errors
    ///
    /// [`Error::NoRoute`] if the resource names no node, [`Error::QueueFull`]
    /// in fail-fast mode, [`Error::Shutdown`] once the hub stops.
    pub async fn dispatch(&self, mut message: Message, mode: EnqueueMode) -> Result<String> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Shutdown);
        }

        let node_id = message
            .node_id()
            .ok_or_else(|| Error::NoRoute(message.resource.clone()))?;

        if message.id.is_empty() {
            message.id = Uuid::new_v4().to_string();
        }
        if message.timestamp == 0 {
            message.timestamp = now_millis();
        }

        let id = message.id.clone();

        loop {
            let queue = self.queue_for(&node_id);
            let outcome = match mode {
                EnqueueMode::Block => queue.enqueue(message, &self.shutdown).await?,
                EnqueueMode::FailFast => queue.try_enqueue(message)?,
            };

            match outcome {
                Enqueued::Queued => break,
                Enqueued::Retired(returned) => message = returned,
            }
        }

        debug!(node_id = %node_id, msg_id = %id, "outbound message queued");

        Ok(id)
    }

    /// Handle one frame read by a session.
    pub(crate) async fn handle_inbound(&self, session: &Session, frame: &[u8]) {
        let message = match Message::decode(frame) {
            Ok(message) => message,
            Err(err) => {
                self.metrics.dropped(DropReason::Malformed);
                warn!(
                    node_id = %session.node_id(),
                    transport = %session.transport(),
                    error = %err,
                    "dropping malformed frame"
                );
                return;
            }
        };

        if message.operation == Operation::Keepalive {
            trace!(node_id = %session.node_id(), "keepalive");
            return;
        }

        if message.is_ack() {
            if session.queue().ack(&message.parent_id) {
                self.metrics.messages_acked_total.inc();
                debug!(node_id = %session.node_id(), msg_id = %message.parent_id, "message acknowledged");
            } else {
                trace!(node_id = %session.node_id(), msg_id = %message.parent_id, "ack for unknown message");
            }
            return;
        }

        self.route_inbound(session.node_id(), message).await;
    }

    async fn route_inbound(&self, node_id: &NodeId, mut message: Message) {
        if message.id.is_empty() {
            message.id = Uuid::new_v4().to_string();
        }
        match message.node_id() {
            None => {
                message.resource =
                    format!("node/{node_id}/{}", message.resource.trim_start_matches('/'));
            }
            Some(named) if named != *node_id => {
                self.metrics.dropped(DropReason::NodeMismatch);
                warn!(
                    node_id = %node_id,
                    resource = %message.resource,
                    msg_id = %message.id,
                    "dropping message addressed as another node"
                );
                return;
            }
            Some(_) => {}
        }
        if message.group.is_empty() {
            message.group = self.derive_group(&message);
        }

        let group = message.group.clone();
        let msg_id = message.id.clone();

        match self
            .channels
            .send_timeout(&group, message, self.config.inbound_wait)
            .await
        {
            Ok(()) => {
                self.metrics.messages_in_total.with_label_values(&[&group]).inc();
                trace!(node_id = %node_id, group = %group, msg_id = %msg_id, "inbound message forwarded");
            }
            Err(Error::UnknownGroup(_)) => {
                self.metrics.dropped(DropReason::UnknownGroup);
                warn!(node_id = %node_id, group = %group, msg_id = %msg_id, "dropping message for unknown group");
            }
            Err(err) => {
                self.metrics.dropped(DropReason::InboundFull);
                warn!(node_id = %node_id, group = %group, msg_id = %msg_id, error = %err, "dropping inbound message");
            }
        }
    }

    fn derive_group(&self, message: &Message) -> String {
        message
            .resource_type()
            .filter(|kind| self.channels.contains(kind))
            .map_or_else(|| self.config.default_group.clone(), ToString::to_string)
    }

    /// Publish a connect or disconnect event for a node.
    pub(crate) fn publish_node_event(&self, node_id: &NodeId, operation: Operation) {
        let Some(group) = self.config.node_events_group.as_deref() else {
            return;
        };

        let mut event = Message::new(HUB_SOURCE, group, format!("node/{node_id}"), operation);
        event.id = Uuid::new_v4().to_string();

        if let Err(err) = self.channels.try_send(group, event) {
            self.metrics.dropped(DropReason::EventsFull);
            warn!(node_id = %node_id, group, operation = %operation, error = %err, "dropping node event");
        }
    }

    /// Expire messages of nodes without a session, sample queue depths and
    /// retire empty queues of absent nodes.
    pub(crate) fn sweep(&self, now: Instant) {
        let queues: Vec<Arc<ReliableQueue>> =
            self.queues.iter().map(|queue| queue.value().clone()).collect();

        let mut idle = Vec::new();
        for queue in &queues {
            if queue.is_detached() {
                queue.sweep(now);
            }

            let depth = queue.len();
            self.metrics
                .queue_depth
                .with_label_values(&[queue.node_id().as_str()])
                .set(i64::try_from(depth).unwrap_or(i64::MAX));

            if depth == 0 && queue.is_detached() {
                idle.push(queue.node_id().clone());
            }
        }

        for node_id in idle {
            if self
                .queues
                .remove_if(&node_id, |_, queue| queue.try_retire())
                .is_some()
            {
                self.metrics.forget_queue(node_id.as_str());
                debug!(node_id = %node_id, "retired pending queue");
            }
        }
    }

    /// Close every queue. Blocked producers and writers return.
    pub(crate) fn close_queues(&self) {
        for queue in &self.queues {
            queue.close();
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("queues", &self.queues.len())
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}
