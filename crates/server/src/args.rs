use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};
use edgehub::HubConfig;

/// Command line and environment configuration of the `edgehub` binary.
#[derive(Clone, Debug, Parser)]
#[command(version, about = "Cloud relay for edge nodes", long_about = None)]
pub struct Args {
    /// TLS WebSocket listen address
    #[arg(long, default_value = "0.0.0.0:10000", env = "EDGEHUB_WS_LISTEN")]
    pub ws_listen: SocketAddr,

    /// QUIC listen address
    #[arg(long, default_value = "0.0.0.0:10001", env = "EDGEHUB_QUIC_LISTEN")]
    pub quic_listen: SocketAddr,

    /// Do not start the QUIC listener
    #[arg(long, env = "EDGEHUB_DISABLE_QUIC")]
    pub disable_quic: bool,

    /// Admin HTTP listen address (metrics, node list, eviction)
    #[arg(long, default_value = "127.0.0.1:9000", env = "EDGEHUB_ADMIN_LISTEN")]
    pub admin_listen: SocketAddr,

    /// PEM file with the CA that signs node certificates
    #[arg(long, env = "EDGEHUB_CA_CERT")]
    pub ca_cert: PathBuf,

    /// PEM file with the server certificate chain
    #[arg(long, env = "EDGEHUB_SERVER_CERT")]
    pub server_cert: PathBuf,

    /// PEM file with the server private key
    #[arg(long, env = "EDGEHUB_SERVER_KEY")]
    pub server_key: PathBuf,

    /// Transport handshake timeout in seconds
    #[arg(long, default_value_t = 10, env = "EDGEHUB_HANDSHAKE_TIMEOUT_SECS")]
    pub handshake_timeout_secs: u64,

    /// Seconds without an inbound frame before a session is evicted
    #[arg(long, default_value_t = 30, env = "EDGEHUB_IDLE_TIMEOUT_SECS")]
    pub idle_timeout_secs: u64,

    /// Milliseconds between retransmissions of an unacknowledged message
    #[arg(long, default_value_t = 5000, env = "EDGEHUB_RESEND_INTERVAL_MS")]
    pub resend_interval_ms: u64,

    /// Retransmissions before an unacknowledged message is dropped
    #[arg(long, default_value_t = 4, env = "EDGEHUB_MAX_RESENDS")]
    pub max_resends: u32,

    /// Seconds after which an unacknowledged message is dropped
    #[arg(long, default_value_t = 600, env = "EDGEHUB_MESSAGE_MAX_AGE_SECS")]
    pub message_max_age_secs: u64,

    /// Pending messages per node before producers block
    #[arg(long, default_value_t = 1024, env = "EDGEHUB_QUEUE_BOUND")]
    pub queue_bound: usize,

    /// Seconds sessions get to flush on shutdown
    #[arg(long, default_value_t = 5, env = "EDGEHUB_SHUTDOWN_GRACE_SECS")]
    pub shutdown_grace_secs: u64,

    /// Check node certificates against claimed node ids
    #[arg(
        long,
        default_value_t = true,
        action = ArgAction::Set,
        env = "EDGEHUB_NODE_ATTESTATION_ENABLED"
    )]
    pub node_attestation_enabled: bool,

    /// Capacity of each inbound group channel
    #[arg(long, default_value_t = 1024, env = "EDGEHUB_GROUP_CHANNEL_CAPACITY")]
    pub group_channel_capacity: usize,

    /// Seconds messages wait for a node without a session
    #[arg(long, default_value_t = 30, env = "EDGEHUB_NO_ROUTE_GRACE_SECS")]
    pub no_route_grace_secs: u64,

    /// Milliseconds an inbound message waits for room in a full group channel
    #[arg(long, default_value_t = 1000, env = "EDGEHUB_INBOUND_WAIT_MS")]
    pub inbound_wait_ms: u64,

    /// Milliseconds between liveness sweeps
    #[arg(long, default_value_t = 1000, env = "EDGEHUB_SWEEP_INTERVAL_MS")]
    pub sweep_interval_ms: u64,

    /// Seconds a single frame write may take
    #[arg(long, default_value_t = 30, env = "EDGEHUB_WRITE_TIMEOUT_SECS")]
    pub write_timeout_secs: u64,

    /// Maximum number of registered nodes
    #[arg(long, default_value_t = 10_000, env = "EDGEHUB_NODE_LIMIT")]
    pub node_limit: usize,

    /// Group channels to create
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "edged,twin,devicecontroller,edgecontroller",
        env = "EDGEHUB_GROUPS"
    )]
    pub groups: Vec<String>,

    /// Group for inbound messages that name none
    #[arg(long, default_value = "edgecontroller", env = "EDGEHUB_DEFAULT_GROUP")]
    pub default_group: String,

    /// Group receiving node connect and disconnect events; empty disables
    #[arg(long, default_value = "edgecontroller", env = "EDGEHUB_NODE_EVENTS_GROUP")]
    pub node_events_group: String,
}

impl Args {
    /// Hub options described by these arguments.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            resend_interval: Duration::from_millis(self.resend_interval_ms),
            max_resends: self.max_resends,
            message_max_age: Duration::from_secs(self.message_max_age_secs),
            queue_bound: self.queue_bound,
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            node_attestation_enabled: self.node_attestation_enabled,
            group_channel_capacity: self.group_channel_capacity,
            no_route_grace: Duration::from_secs(self.no_route_grace_secs),
            inbound_wait: Duration::from_millis(self.inbound_wait_ms),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            node_limit: self.node_limit,
            groups: self.groups.clone(),
            default_group: self.default_group.clone(),
            node_events_group: Some(self.node_events_group.clone()).filter(|group| !group.is_empty()),
        }
    }

    /// Transport handshake timeout.
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUIRED: [&str; 7] = [
        "edgehub",
        "--ca-cert",
        "ca.pem",
        "--server-cert",
        "server.pem",
        "--server-key",
        "server.key",
    ];

    #[test]
    fn test_defaults_match_hub_defaults() {
        let args = Args::try_parse_from(REQUIRED).unwrap();
        let config = args.hub_config();
        let defaults = HubConfig::default();

        assert_eq!(config.idle_timeout, defaults.idle_timeout);
        assert_eq!(config.resend_interval, defaults.resend_interval);
        assert_eq!(config.max_resends, defaults.max_resends);
        assert_eq!(config.message_max_age, defaults.message_max_age);
        assert_eq!(config.queue_bound, defaults.queue_bound);
        assert_eq!(config.no_route_grace, defaults.no_route_grace);
        assert_eq!(config.groups, defaults.groups);
        assert_eq!(config.node_events_group, defaults.node_events_group);
        assert!(config.node_attestation_enabled);
        assert!(!args.disable_quic);
    }

    #[test]
    fn test_overrides() {
        let args = Args::try_parse_from(REQUIRED.into_iter().chain([
            "--node-attestation-enabled",
            "false",
            "--groups",
            "edged,meta",
            "--node-events-group",
            "",
            "--resend-interval-ms",
            "250",
        ]))
        .unwrap();
        let config = args.hub_config();

        assert!(!config.node_attestation_enabled);
        assert_eq!(config.groups, vec!["edged", "meta"]);
        assert_eq!(config.node_events_group, None);
        assert_eq!(config.resend_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_pem_paths_are_required() {
        assert!(Args::try_parse_from(["edgehub"]).is_err());
    }
}
