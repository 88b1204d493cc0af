use std::time::Duration;

use crate::{Error, Result};

/// Group channels every hub starts with.
pub const DEFAULT_GROUPS: &[&str] = &["edged", "twin", "devicecontroller", "edgecontroller"];

/// Runtime options of the hub.
#[derive(Clone, Debug)]
pub struct HubConfig {
    /// A session that receives no frame for this long is evicted.
    pub idle_timeout: Duration,

    /// Minimum gap between transmissions of the same unacknowledged message.
    pub resend_interval: Duration,

    /// Retransmissions allowed after the first send before a message is dropped.
    pub max_resends: u32,

    /// Age after which an unacknowledged message is dropped.
    pub message_max_age: Duration,

    /// Pending messages per node before producers block.
    pub queue_bound: usize,

    /// Time sessions get to flush their queues on shutdown.
    pub shutdown_grace: Duration,

    /// Check peer certificates against claimed node ids.
    pub node_attestation_enabled: bool,

    /// Capacity of each inbound group channel.
    pub group_channel_capacity: usize,

    /// How long messages for a node without a session are kept.
    pub no_route_grace: Duration,

    /// How long an inbound message waits for room in a full group channel.
    pub inbound_wait: Duration,

    /// Period of the liveness sweep.
    pub sweep_interval: Duration,

    /// A single frame write taking longer than this fails the session.
    pub write_timeout: Duration,

    /// Maximum number of registered nodes.
    pub node_limit: usize,

    /// Group channels created at start.
    pub groups: Vec<String>,

    /// Group for inbound messages that name none.
    pub default_group: String,

    /// Group receiving node connect and disconnect events.
    pub node_events_group: Option<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            resend_interval: Duration::from_secs(5),
            max_resends: 4,
            message_max_age: Duration::from_secs(600),
            queue_bound: 1024,
            shutdown_grace: Duration::from_secs(5),
            node_attestation_enabled: true,
            group_channel_capacity: 1024,
            no_route_grace: Duration::from_secs(30),
            inbound_wait: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(1),
            write_timeout: Duration::from_secs(30),
            node_limit: 10_000,
            groups: DEFAULT_GROUPS.iter().map(ToString::to_string).collect(),
            default_group: "edgecontroller".to_string(),
            node_events_group: Some("edgecontroller".to_string()),
        }
    }
}

impl HubConfig {
    /// Reject option combinations the hub cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first offending option.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("idle_timeout", self.idle_timeout),
            ("resend_interval", self.resend_interval),
            ("message_max_age", self.message_max_age),
            ("sweep_interval", self.sweep_interval),
            ("write_timeout", self.write_timeout),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, value)| value.is_zero()) {
            return Err(Error::InvalidConfig(format!("{name} must be non-zero")));
        }

        if self.queue_bound == 0 {
            return Err(Error::InvalidConfig("queue_bound must be non-zero".to_string()));
        }
        if self.group_channel_capacity == 0 {
            return Err(Error::InvalidConfig(
                "group_channel_capacity must be non-zero".to_string(),
            ));
        }
        if self.node_limit == 0 {
            return Err(Error::InvalidConfig("node_limit must be non-zero".to_string()));
        }
        if self.default_group.is_empty() || self.groups.iter().any(String::is_empty) {
            return Err(Error::InvalidConfig("group names must be non-empty".to_string()));
        }
        if self.node_events_group.as_deref() == Some("") {
            return Err(Error::InvalidConfig(
                "node_events_group must be non-empty when set".to_string(),
            ));
        }

        Ok(())
    }

    /// Every group channel the hub creates: configured groups, the default
    /// group and the node events group.
    #[must_use]
    pub fn all_groups(&self) -> Vec<String> {
        let mut groups = self.groups.clone();
        groups.push(self.default_group.clone());
        groups.extend(self.node_events_group.clone());
        groups.sort();
        groups.dedup();
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        HubConfig::default().validate().unwrap();
    }

    #[test]
    fn test_zero_values_are_rejected() {
        let config = HubConfig {
            queue_bound: 0,
            ..HubConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = HubConfig {
            resend_interval: Duration::ZERO,
            ..HubConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("resend_interval"));
    }

    #[test]
    fn test_all_groups_includes_defaults_once() {
        let config = HubConfig {
            groups: vec!["twin".to_string()],
            default_group: "resource".to_string(),
            node_events_group: Some("twin".to_string()),
            ..HubConfig::default()
        };

        assert_eq!(config.all_groups(), vec!["resource", "twin"]);
    }
}
