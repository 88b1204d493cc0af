//! Cloud relay for edge nodes.
//!
//! Edge nodes connect over a secure transport, prove who they are with a node
//! certificate, and then exchange [`Message`]s with controllers running in the
//! same process. Outbound messages wait in a per-node [`ReliableQueue`] until
//! the node acknowledges them; they survive reconnects of the node and are
//! retransmitted when no acknowledgement arrives.
//!
//! The hub is built with [`EdgeHub::new`], fed connections with
//! [`EdgeHub::serve`], and used by controllers through the [`ModuleBus`].
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod admin;
mod bus;
mod config;
mod dispatcher;
mod error;
mod hub;
pub mod message;
pub mod metrics;
mod queue;
mod session;
mod session_manager;

pub use admin::admin_router;
pub use bus::{GroupChannels, ModuleBus};
pub use config::{DEFAULT_GROUPS, HubConfig};
pub use dispatcher::Dispatcher;
pub use error::{Error, Result};
pub use hub::EdgeHub;
pub use message::{Content, HUB_SOURCE, Message, Operation};
pub use metrics::{DropReason, HubMetrics};
pub use queue::{Delivery, EnqueueMode, EntryState, QueuePolicy, ReliableQueue};
pub use session::{CloseReason, Session, SessionInfo, SessionState};
pub use session_manager::SessionManager;

pub use edgehub_attestation::NodeId;
