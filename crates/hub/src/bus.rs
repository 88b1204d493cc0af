//! In-process wiring between the hub and its controllers.
//!
//! Inbound messages from nodes land on named group channels that controllers
//! pull from; controllers push outbound messages through [`ModuleBus::dispatch`].

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dispatcher::Dispatcher;
use crate::message::Message;
use crate::queue::EnqueueMode;
use crate::{Error, Result};

struct Channel {
    tx: flume::Sender<Message>,
    rx: flume::Receiver<Message>,
}

/// Bounded FIFO channels keyed by group name.
pub struct GroupChannels {
    capacity: usize,
    channels: DashMap<String, Channel>,
}

impl GroupChannels {
    /// Create channels of `capacity` for each group.
    pub fn new(capacity: usize, groups: impl IntoIterator<Item = String>) -> Self {
        let channels = Self {
            capacity,
            channels: DashMap::new(),
        };
        for group in groups {
            channels.register(&group);
        }
        channels
    }

    /// Create a channel for `group`. Returns `false` if it already exists.
    pub fn register(&self, group: &str) -> bool {
        if self.channels.contains_key(group) {
            return false;
        }

        let mut created = false;
        self.channels.entry(group.to_string()).or_insert_with(|| {
            created = true;
            let (tx, rx) = flume::bounded(self.capacity);
            Channel { tx, rx }
        });

        if created {
            debug!(group, capacity = self.capacity, "group channel registered");
        }
        created
    }

    /// Whether a channel exists for `group`.
    #[must_use]
    pub fn contains(&self, group: &str) -> bool {
        self.channels.contains_key(group)
    }

    /// Names of all channels, sorted.
    #[must_use]
    pub fn groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.channels.iter().map(|c| c.key().clone()).collect();
        groups.sort();
        groups
    }

    /// Messages waiting on `group`.
    #[must_use]
    pub fn depth(&self, group: &str) -> usize {
        self.channels.get(group).map_or(0, |c| c.rx.len())
    }

    fn sender(&self, group: &str) -> Result<flume::Sender<Message>> {
        self.channels
            .get(group)
            .map(|c| c.tx.clone())
            .ok_or_else(|| Error::UnknownGroup(group.to_string()))
    }

    fn receiver(&self, group: &str) -> Result<flume::Receiver<Message>> {
        self.channels
            .get(group)
            .map(|c| c.rx.clone())
            .ok_or_else(|| Error::UnknownGroup(group.to_string()))
    }

    /// Put a message without waiting.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownGroup`] or [`Error::GroupFull`].
    pub fn try_send(&self, group: &str, message: Message) -> Result<()> {
        self.sender(group)?
            .try_send(message)
            .map_err(|_| Error::GroupFull(group.to_string()))
    }

    /// Put a message, waiting up to `wait` for room.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownGroup`] or [`Error::GroupFull`] after the wait.
    pub async fn send_timeout(&self, group: &str, message: Message, wait: Duration) -> Result<()> {
        let tx = self.sender(group)?;

        match tokio::time::timeout(wait, tx.send_async(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) | Err(_) => Err(Error::GroupFull(group.to_string())),
        }
    }

    /// Take the next message, waiting until one arrives.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownGroup`].
    pub async fn receive(&self, group: &str) -> Result<Message> {
        self.receiver(group)?
            .recv_async()
            .await
            .map_err(|_| Error::UnknownGroup(group.to_string()))
    }

    /// Take the next message if one is waiting.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownGroup`].
    pub fn try_receive(&self, group: &str) -> Result<Option<Message>> {
        Ok(self.receiver(group)?.try_recv().ok())
    }
}

impl std::fmt::Debug for GroupChannels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupChannels")
            .field("capacity", &self.capacity)
            .field("groups", &self.groups())
            .finish()
    }
}

/// Handle given to controllers.
#[derive(Clone, Debug)]
pub struct ModuleBus {
    channels: Arc<GroupChannels>,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
}

impl ModuleBus {
    pub(crate) const fn new(
        channels: Arc<GroupChannels>,
        dispatcher: Arc<Dispatcher>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            channels,
            dispatcher,
            shutdown,
        }
    }

    /// Put a message on a group channel without waiting.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownGroup`] or [`Error::GroupFull`].
    pub fn send(&self, group: &str, message: Message) -> Result<()> {
        self.channels.try_send(group, message)
    }

    /// Take the next message from a group channel.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownGroup`], or [`Error::Shutdown`] once the hub stops.
    pub async fn receive(&self, group: &str) -> Result<Message> {
        tokio::select! {
            () = self.shutdown.cancelled() => Err(Error::Shutdown),
            message = self.channels.receive(group) => message,
        }
    }

    /// Take the next message from a group channel if one is waiting.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownGroup`].
    pub fn try_receive(&self, group: &str) -> Result<Option<Message>> {
        self.channels.try_receive(group)
    }

    /// Queue a message for the node named by its resource, waiting for room.
    /// Returns the message id.
    ///
    /// # Errors
    ///
    /// [`Error::NoRoute`] if the resource names no node, [`Error::Shutdown`]
    /// once the hub stops.
    pub async fn dispatch(&self, message: Message) -> Result<String> {
        self.dispatcher.dispatch(message, EnqueueMode::Block).await
    }

    /// Like [`ModuleBus::dispatch`] but fails with [`Error::QueueFull`]
    /// instead of waiting.
    ///
    /// # Errors
    ///
    /// See [`ModuleBus::dispatch`].
    pub async fn try_dispatch(&self, message: Message) -> Result<String> {
        self.dispatcher.dispatch(message, EnqueueMode::FailFast).await
    }

    /// Create a group channel at runtime.
    pub fn register_group(&self, group: &str) -> bool {
        self.channels.register(group)
    }

    /// Messages waiting on a group channel.
    #[must_use]
    pub fn depth(&self, group: &str) -> usize {
        self.channels.depth(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Operation;

    fn message(resource: &str) -> Message {
        Message::new("edged", "twin", resource, Operation::Update)
    }

    #[tokio::test]
    async fn test_channels_are_fifo() {
        let channels = GroupChannels::new(4, ["twin".to_string()]);

        channels.try_send("twin", message("node/a/twin/1")).unwrap();
        channels.try_send("twin", message("node/a/twin/2")).unwrap();

        assert_eq!(channels.depth("twin"), 2);
        assert_eq!(channels.receive("twin").await.unwrap().resource, "node/a/twin/1");
        assert_eq!(
            channels.try_receive("twin").unwrap().unwrap().resource,
            "node/a/twin/2"
        );
        assert!(channels.try_receive("twin").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_full_and_unknown_groups() {
        let channels = GroupChannels::new(1, ["twin".to_string()]);
        channels.try_send("twin", message("node/a/twin/1")).unwrap();

        assert!(matches!(
            channels.try_send("twin", message("node/a/twin/2")),
            Err(Error::GroupFull(_))
        ));
        assert!(matches!(
            channels
                .send_timeout("twin", message("node/a/twin/2"), Duration::from_millis(20))
                .await,
            Err(Error::GroupFull(_))
        ));
        assert!(matches!(
            channels.try_send("edged", message("node/a/pod/1")),
            Err(Error::UnknownGroup(_))
        ));
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let channels = GroupChannels::new(1, Vec::new());

        assert!(channels.register("meta"));
        assert!(!channels.register("meta"));
        assert_eq!(channels.groups(), vec!["meta".to_string()]);
    }
}
