//! Per-node outbound queue with acknowledgement tracking and redelivery.
//!
//! Entries stay queued after they are sent and leave only when the node
//! acknowledges them, when they expire, or when the node stays without a
//! session past the grace period. The session writer is the single consumer:
//! [`ReliableQueue::next`] hands out the first entry that is either unsent or
//! due for retransmission.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use edgehub_attestation::NodeId;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::message::Message;
use crate::metrics::{DropReason, HubMetrics};
use crate::{Error, HubConfig, Result};

/// What a producer wants when the queue is full.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnqueueMode {
    /// Wait for room.
    Block,
    /// Fail with [`Error::QueueFull`].
    FailFast,
}

/// Limits applied to every entry of a queue.
#[derive(Clone, Copy, Debug)]
pub struct QueuePolicy {
    /// Maximum number of entries.
    pub bound: usize,
    /// Minimum gap between transmissions of one entry.
    pub resend_interval: Duration,
    /// Retransmissions allowed after the first send.
    pub max_resends: u32,
    /// Age limit measured from enqueue.
    pub max_age: Duration,
    /// Lifetime of entries while the node has no session.
    pub no_route_grace: Duration,
}

impl From<&HubConfig> for QueuePolicy {
    fn from(config: &HubConfig) -> Self {
        Self {
            bound: config.queue_bound,
            resend_interval: config.resend_interval,
            max_resends: config.max_resends,
            max_age: config.message_max_age,
            no_route_grace: config.no_route_grace,
        }
    }
}

/// A message handed to the writer.
#[derive(Clone, Debug)]
pub struct Delivery {
    /// The message to write.
    pub message: Message,
    /// Transmission count including this one.
    pub send_count: u32,
}

impl Delivery {
    /// Whether the message was transmitted before.
    #[must_use]
    pub const fn is_retransmission(&self) -> bool {
        self.send_count > 1
    }
}

/// Delivery bookkeeping of one pending entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EntryState {
    /// Transmissions so far.
    pub send_count: u32,
    /// Time of the first transmission.
    pub first_sent_at: Option<Instant>,
    /// Time of the latest transmission.
    pub last_sent_at: Option<Instant>,
}

/// Outcome of an accepted enqueue call.
#[derive(Debug)]
pub(crate) enum Enqueued {
    Queued,
    /// The queue was retired from the node map; retry with a fresh queue.
    Retired(Message),
}

enum Offer {
    Queued,
    Full(Message),
    Retired(Message),
    Closed,
}

struct Entry {
    message: Message,
    send_count: u32,
    enqueued_at: Instant,
    first_sent_at: Option<Instant>,
    last_sent_at: Option<Instant>,
    requires_ack: bool,
}

impl Entry {
    fn new(message: Message, now: Instant) -> Self {
        Self {
            requires_ack: message.requires_ack(),
            message,
            send_count: 0,
            enqueued_at: now,
            first_sent_at: None,
            last_sent_at: None,
        }
    }

    fn is_eligible(&self, now: Instant, policy: &QueuePolicy) -> bool {
        match self.last_sent_at {
            None => true,
            Some(last) => {
                self.requires_ack
                    && self.send_count <= policy.max_resends
                    && now >= last + policy.resend_interval
            }
        }
    }

    fn expiry(
        &self,
        now: Instant,
        detached_since: Option<Instant>,
        policy: &QueuePolicy,
    ) -> Option<DropReason> {
        if now.saturating_duration_since(self.enqueued_at) >= policy.max_age {
            return Some(DropReason::MaxAge);
        }

        if let Some(last) = self.last_sent_at {
            if self.send_count > policy.max_resends && now >= last + policy.resend_interval {
                return Some(DropReason::MaxResends);
            }
        }

        if let Some(detached) = detached_since {
            if now >= self.enqueued_at.max(detached) + policy.no_route_grace {
                return Some(if self.send_count == 0 {
                    DropReason::NoRoute
                } else {
                    DropReason::DeadLetter
                });
            }
        }

        None
    }

    fn next_deadline(&self, detached_since: Option<Instant>, policy: &QueuePolicy) -> Instant {
        let mut deadline = self.enqueued_at + policy.max_age;

        if let Some(last) = self.last_sent_at {
            deadline = deadline.min(last + policy.resend_interval);
        }
        if let Some(detached) = detached_since {
            deadline = deadline.min(self.enqueued_at.max(detached) + policy.no_route_grace);
        }

        deadline
    }

    const fn state(&self) -> EntryState {
        EntryState {
            send_count: self.send_count,
            first_sent_at: self.first_sent_at,
            last_sent_at: self.last_sent_at,
        }
    }
}

struct Inner {
    entries: IndexMap<String, Entry>,
    detached_since: Option<Instant>,
    closed: bool,
    retired: bool,
}

/// Ordered outbound queue of one node.
pub struct ReliableQueue {
    node_id: NodeId,
    policy: QueuePolicy,
    inner: Mutex<Inner>,
    changed: Notify,
    space: Notify,
    metrics: Arc<HubMetrics>,
}

impl ReliableQueue {
    /// Create an empty queue. It starts detached: until a session attaches,
    /// entries age towards the no-route grace deadline.
    #[must_use]
    pub fn new(node_id: NodeId, policy: QueuePolicy, metrics: Arc<HubMetrics>) -> Self {
        Self {
            node_id,
            policy,
            inner: Mutex::new(Inner {
                entries: IndexMap::new(),
                detached_since: Some(Instant::now()),
                closed: false,
                retired: false,
            }),
            changed: Notify::new(),
            space: Notify::new(),
            metrics,
        }
    }

    /// Node this queue delivers to.
    #[must_use]
    pub const fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Number of pending entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether no entry is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Ids of pending entries in queue order.
    #[must_use]
    pub fn pending_ids(&self) -> Vec<String> {
        self.inner.lock().entries.keys().cloned().collect()
    }

    /// Delivery bookkeeping of a pending entry.
    #[must_use]
    pub fn entry_state(&self, id: &str) -> Option<EntryState> {
        self.inner.lock().entries.get(id).map(Entry::state)
    }

    /// Whether the node currently has no session.
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.inner.lock().detached_since.is_some()
    }

    /// Add a message, failing if the queue is full.
    pub(crate) fn try_enqueue(&self, message: Message) -> Result<Enqueued> {
        match self.offer(message) {
            Offer::Queued => Ok(Enqueued::Queued),
            Offer::Retired(message) => Ok(Enqueued::Retired(message)),
            Offer::Full(_) => Err(Error::QueueFull(self.node_id.clone())),
            Offer::Closed => Err(Error::Shutdown),
        }
    }

    /// Add a message, waiting for room while the queue is full.
    ///
    /// Cancelling `cancel` or closing the queue fails with [`Error::Shutdown`].
    pub(crate) async fn enqueue(
        &self,
        mut message: Message,
        cancel: &CancellationToken,
    ) -> Result<Enqueued> {
        loop {
            let space = self.space.notified();

            if cancel.is_cancelled() {
                return Err(Error::Shutdown);
            }

            match self.offer(message) {
                Offer::Queued => return Ok(Enqueued::Queued),
                Offer::Retired(message) => return Ok(Enqueued::Retired(message)),
                Offer::Closed => return Err(Error::Shutdown),
                Offer::Full(rejected) => message = rejected,
            }

            debug!(node_id = %self.node_id, "pending queue full, producer waiting");

            tokio::select! {
                () = space => {}
                () = cancel.cancelled() => return Err(Error::Shutdown),
            }
        }
    }

    fn offer(&self, message: Message) -> Offer {
        let mut inner = self.inner.lock();

        if inner.closed {
            return Offer::Closed;
        }
        if inner.retired {
            return Offer::Retired(message);
        }
        if inner.entries.contains_key(&message.id) {
            return Offer::Queued;
        }
        if inner.entries.len() >= self.policy.bound {
            return Offer::Full(message);
        }

        inner
            .entries
            .insert(message.id.clone(), Entry::new(message, Instant::now()));
        drop(inner);

        self.changed.notify_waiters();
        Offer::Queued
    }

    /// Wait for the next entry to transmit and record the transmission.
    ///
    /// Returns `None` once the queue is closed.
    pub async fn next(&self) -> Option<Delivery> {
        loop {
            let changed = self.changed.notified();

            let deadline = {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return None;
                }

                let now = Instant::now();
                self.expire_locked(&mut inner, now);

                if let Some(delivery) = self.take_eligible(&mut inner, now) {
                    return Some(delivery);
                }

                let detached_since = inner.detached_since;
                inner
                    .entries
                    .values()
                    .map(|entry| entry.next_deadline(detached_since, &self.policy))
                    .min()
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        () = changed => {}
                        () = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => changed.await,
            }
        }
    }

    fn take_eligible(&self, inner: &mut Inner, now: Instant) -> Option<Delivery> {
        let index = inner
            .entries
            .values()
            .position(|entry| entry.is_eligible(now, &self.policy))?;
        let (_, entry) = inner.entries.get_index_mut(index)?;

        entry.send_count += 1;
        entry.first_sent_at.get_or_insert(now);
        entry.last_sent_at = Some(now);

        let delivery = Delivery {
            message: entry.message.clone(),
            send_count: entry.send_count,
        };

        if !entry.requires_ack {
            inner.entries.shift_remove_index(index);
            self.space.notify_waiters();
        }

        Some(delivery)
    }

    fn expire_locked(&self, inner: &mut Inner, now: Instant) -> usize {
        let detached_since = inner.detached_since;
        let policy = self.policy;
        let mut expired = Vec::new();

        inner.entries.retain(|id, entry| {
            match entry.expiry(now, detached_since, &policy) {
                Some(reason) => {
                    expired.push((id.clone(), reason, entry.send_count));
                    false
                }
                None => true,
            }
        });

        for (id, reason, send_count) in &expired {
            self.metrics.dropped(*reason);
            warn!(
                node_id = %self.node_id,
                msg_id = %id,
                reason = reason.as_str(),
                send_count,
                "dropping undelivered message"
            );
        }

        if !expired.is_empty() {
            self.space.notify_waiters();
        }

        expired.len()
    }

    /// Remove an acknowledged entry. Unknown ids are ignored.
    ///
    /// Returns whether an entry was removed.
    pub fn ack(&self, id: &str) -> bool {
        let removed = self.inner.lock().entries.shift_remove(id).is_some();

        if removed {
            self.space.notify_waiters();
            self.changed.notify_waiters();
        }

        removed
    }

    /// Drop an entry that can never be delivered.
    pub(crate) fn discard(&self, id: &str, reason: DropReason) {
        if self.inner.lock().entries.shift_remove(id).is_some() {
            self.metrics.dropped(reason);
            self.space.notify_waiters();
        }
    }

    /// Expire entries now. Used for queues that have no writer.
    pub(crate) fn sweep(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock();
        self.expire_locked(&mut inner, now)
    }

    /// Mark the node as having a session. Fails if the queue was retired.
    pub(crate) fn attach(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.retired {
            return false;
        }
        inner.detached_since = None;
        true
    }

    /// Mark the node as having lost its session.
    pub(crate) fn detach(&self, now: Instant) {
        self.inner.lock().detached_since = Some(now);
        self.changed.notify_waiters();
    }

    /// Retire a detached, empty queue so it can be removed from the node map.
    pub(crate) fn try_retire(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.detached_since.is_some() && inner.entries.is_empty() && !inner.closed {
            inner.retired = true;
        }
        inner.retired
    }

    /// Stop the writer and fail producers with [`Error::Shutdown`].
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.changed.notify_waiters();
        self.space.notify_waiters();
    }
}

impl fmt::Debug for ReliableQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ReliableQueue")
            .field("node_id", &self.node_id)
            .field("len", &inner.entries.len())
            .field("detached", &inner.detached_since.is_some())
            .field("closed", &inner.closed)
            .finish_non_exhaustive()
    }
}
