//! Server discovery and monitoring.
//!
//! The description types ([`ServerDescription`], [`TopologyDescription`]) are immutable
//! values computed from hello responses; the live machinery ([`topology::Topology`],
//! [`monitor::Monitor`]) maintains the current description and publishes snapshots of it.

pub(crate) mod description;
pub(crate) mod monitor;
pub(crate) mod public;
pub(crate) mod srv_polling;
#[cfg(test)]
pub(crate) mod test_util;
pub(crate) mod topology;

pub use self::public::ServerInfo;
pub use crate::hello::TopologyVersion;
pub use description::{
    server::{ServerDescription, ServerType},
    topology::{TopologyDescription, TopologyType},
};

pub(crate) use description::topology::{SessionSupportStatus, TransactionSupportStatus};
pub(crate) use monitor::MIN_HEARTBEAT_FREQUENCY;
pub(crate) use topology::{HandshakePhase, SelectedServer, Topology};
