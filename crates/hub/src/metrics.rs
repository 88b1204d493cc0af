//! Prometheus metrics for sessions, traffic and queues.

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::Result;

const NAMESPACE: &str = "edgehub";

/// Why a message left the hub without being delivered.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum DropReason {
    /// Sent `max_resends + 1` times without an ack.
    MaxResends,
    /// Older than `message_max_age`.
    MaxAge,
    /// Never sent: the node had no session within the grace period.
    NoRoute,
    /// Sent but unacknowledged when the node's session went away for good.
    DeadLetter,
    /// Inbound group channel stayed full.
    InboundFull,
    /// Inbound message for a group without a channel.
    UnknownGroup,
    /// Frame could not be decoded or encoded.
    Malformed,
    /// Node event could not be published.
    EventsFull,
    /// Inbound resource names a node other than the sender.
    NodeMismatch,
}

impl DropReason {
    /// Metric label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MaxResends => "max_resends",
            Self::MaxAge => "max_age",
            Self::NoRoute => "no_route",
            Self::DeadLetter => "dead_letter",
            Self::InboundFull => "inbound_full",
            Self::UnknownGroup => "unknown_group",
            Self::Malformed => "malformed",
            Self::EventsFull => "events_full",
            Self::NodeMismatch => "node_mismatch",
        }
    }
}

/// Metrics of one hub instance, registered in their own registry.
#[derive(Clone)]
pub struct HubMetrics {
    registry: Registry,

    /// Sessions in the active state.
    pub sessions_active: IntGauge,

    /// Sessions created after a successful handshake.
    pub sessions_opened_total: IntCounter,

    /// Sessions closed, by close reason.
    pub sessions_closed_total: IntCounterVec,

    /// Attested handshakes refused by the session manager, by reason.
    pub sessions_rejected_total: IntCounterVec,

    /// Handshakes refused by the attestor, by reason.
    pub attestation_failures_total: IntCounterVec,

    /// Inbound messages forwarded to a group.
    pub messages_in_total: IntCounterVec,

    /// Outbound messages transmitted for the first time, by group.
    pub messages_out_total: IntCounterVec,

    /// Outbound messages acknowledged by their node.
    pub messages_acked_total: IntCounter,

    /// Messages dropped, by reason.
    pub messages_dropped_total: IntCounterVec,

    /// Retransmissions.
    pub resend_total: IntCounter,

    /// Pending messages per node, sampled by the liveness sweep.
    pub queue_depth: IntGaugeVec,
}

impl HubMetrics {
    /// Create and register every metric.
    ///
    /// # Errors
    ///
    /// Returns an error if a metric cannot be created or registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let sessions_active =
            IntGauge::with_opts(opts("sessions_active", "Sessions in the active state"))?;
        registry.register(Box::new(sessions_active.clone()))?;

        let sessions_opened_total =
            IntCounter::with_opts(opts("sessions_opened_total", "Sessions opened"))?;
        registry.register(Box::new(sessions_opened_total.clone()))?;

        let sessions_closed_total = IntCounterVec::new(
            opts("sessions_closed_total", "Sessions closed by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(sessions_closed_total.clone()))?;

        let sessions_rejected_total = IntCounterVec::new(
            opts("sessions_rejected_total", "Attested sessions refused by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(sessions_rejected_total.clone()))?;

        let attestation_failures_total = IntCounterVec::new(
            opts("attestation_failures_total", "Failed node attestations by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(attestation_failures_total.clone()))?;

        let messages_in_total = IntCounterVec::new(
            opts("messages_in_total", "Inbound messages forwarded by group"),
            &["group"],
        )?;
        registry.register(Box::new(messages_in_total.clone()))?;

        let messages_out_total = IntCounterVec::new(
            opts("messages_out_total", "Outbound first transmissions by group"),
            &["group"],
        )?;
        registry.register(Box::new(messages_out_total.clone()))?;

        let messages_acked_total =
            IntCounter::with_opts(opts("messages_acked_total", "Outbound messages acknowledged"))?;
        registry.register(Box::new(messages_acked_total.clone()))?;

        let messages_dropped_total = IntCounterVec::new(
            opts("messages_dropped_total", "Messages dropped by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(messages_dropped_total.clone()))?;

        let resend_total = IntCounter::with_opts(opts("resend_total", "Outbound retransmissions"))?;
        registry.register(Box::new(resend_total.clone()))?;

        let queue_depth = IntGaugeVec::new(
            opts("queue_depth", "Pending outbound messages per node"),
            &["node"],
        )?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            registry,
            sessions_active,
            sessions_opened_total,
            sessions_closed_total,
            sessions_rejected_total,
            attestation_failures_total,
            messages_in_total,
            messages_out_total,
            messages_acked_total,
            messages_dropped_total,
            resend_total,
            queue_depth,
        })
    }

    /// Count a dropped message.
    pub fn dropped(&self, reason: DropReason) {
        self.messages_dropped_total
            .with_label_values(&[reason.as_str()])
            .inc();
    }

    /// Current count of drops for `reason`.
    #[must_use]
    pub fn dropped_count(&self, reason: DropReason) -> u64 {
        self.messages_dropped_total
            .with_label_values(&[reason.as_str()])
            .get()
    }

    /// Current count of sessions closed for `reason`.
    #[must_use]
    pub fn closed_count(&self, reason: &str) -> u64 {
        self.sessions_closed_total.with_label_values(&[reason]).get()
    }

    /// Stop exporting the depth of a node's queue.
    pub fn forget_queue(&self, node: &str) {
        let _ = self.queue_depth.remove_label_values(&[node]);
    }

    /// The registry holding these metrics.
    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every metric in the Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn gather_text(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

impl std::fmt::Debug for HubMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubMetrics")
            .field("sessions_active", &self.sessions_active.get())
            .field("sessions_opened_total", &self.sessions_opened_total.get())
            .field("messages_acked_total", &self.messages_acked_total.get())
            .field("resend_total", &self.resend_total.get())
            .finish_non_exhaustive()
    }
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(NAMESPACE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render_with_namespace() {
        let metrics = HubMetrics::new().unwrap();
        metrics.dropped(DropReason::MaxResends);
        metrics.messages_acked_total.inc();
        metrics.queue_depth.with_label_values(&["node-a"]).set(3);

        let text = metrics.gather_text().unwrap();

        assert!(text.contains("edgehub_messages_dropped_total{reason=\"max_resends\"} 1"));
        assert!(text.contains("edgehub_messages_acked_total 1"));
        assert!(text.contains("edgehub_queue_depth{node=\"node-a\"} 3"));
        assert_eq!(metrics.dropped_count(DropReason::MaxResends), 1);
        assert_eq!(metrics.dropped_count(DropReason::MaxAge), 0);
    }

    #[test]
    fn test_instances_are_isolated() {
        let first = HubMetrics::new().unwrap();
        let second = HubMetrics::new().unwrap();

        first.sessions_opened_total.inc();

        assert_eq!(first.sessions_opened_total.get(), 1);
        assert_eq!(second.sessions_opened_total.get(), 0);
    }
}
