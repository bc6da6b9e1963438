use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    bson::{doc, oid::ObjectId, Bson, DateTime, Document},
    options::ServerAddress,
    sdam::ServerType,
    selection_criteria::TagSet,
    session::ClusterTime,
};

/// The legacy name of the `hello` command, used until the server advertises `helloOk`.
pub(crate) const LEGACY_HELLO_COMMAND_NAME: &str = "isMaster";

#[derive(Debug, Clone, Copy)]
pub(crate) struct AwaitableHelloOptions {
    pub(crate) topology_version: TopologyVersion,
    pub(crate) max_await_time: Duration,
}

/// Constructs a hello or legacy hello command.
///
/// If the server has indicated `helloOk: true`, `hello` is used. Otherwise the legacy name is
/// used, and if the server's support for `hello` is still unknown, the command advertises
/// `helloOk: true` so the server can opt in.
pub(crate) fn hello_command(
    hello_ok: Option<bool>,
    awaitable_options: Option<AwaitableHelloOptions>,
) -> Document {
    let mut body = if hello_ok == Some(true) {
        doc! { "hello": 1 }
    } else {
        let mut body = doc! { LEGACY_HELLO_COMMAND_NAME: 1 };
        if hello_ok.is_none() {
            body.insert("helloOk", true);
        }
        body
    };

    if let Some(options) = awaitable_options {
        body.insert("topologyVersion", options.topology_version.to_document());
        body.insert(
            "maxAwaitTimeMS",
            i64::try_from(options.max_await_time.as_millis()).unwrap_or(i64::MAX),
        );
    }

    body.insert("$db", "admin");
    body
}

/// A parsed hello response, together with the address it came from and how long the exchange
/// took.
#[derive(Debug, Clone)]
pub(crate) struct HelloReply {
    pub(crate) server_address: ServerAddress,
    pub(crate) command_response: HelloCommandResponse,
    pub(crate) cluster_time: Option<ClusterTime>,
    pub(crate) round_trip_time: Duration,
}

/// The body of a response to a `hello` command.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HelloCommandResponse {
    /// Whether the server is writable. If true, this instance is a primary in a replica set, a
    /// mongos instance, or a standalone mongod.
    pub is_writable_primary: Option<bool>,

    /// Legacy name for the `is_writable_primary` field.
    #[serde(rename = "ismaster")]
    pub is_master: Option<bool>,

    /// Whether the server supports the `hello` command name for monitoring.
    pub hello_ok: Option<bool>,

    /// The list of all voting, data-bearing hosts.
    pub hosts: Option<Vec<String>>,

    /// The list of all passives in a replica set.
    pub passives: Option<Vec<String>>,

    /// The list of all arbiters in a replica set.
    pub arbiters: Option<Vec<String>>,

    /// An optional message. Contains "isdbgrid" when returned by a mongos.
    pub msg: Option<String>,

    /// The address the server believes it is reachable at.
    pub me: Option<String>,

    /// The current replica set config version.
    pub set_version: Option<i32>,

    /// The name of the current replica set.
    pub set_name: Option<String>,

    /// Whether the server is hidden.
    pub hidden: Option<bool>,

    /// Whether the server is a secondary.
    pub secondary: Option<bool>,

    /// Whether the server is an arbiter.
    pub arbiter_only: Option<bool>,

    /// Whether the server is an uninitialized replica set member.
    #[serde(rename = "isreplicaset")]
    pub is_replica_set: Option<bool>,

    /// The time in minutes that a session remains active after its most recent use.
    pub logical_session_timeout_minutes: Option<i64>,

    /// Optime and date information for the server's most recent write operation.
    pub last_write: Option<LastWrite>,

    /// The minimum wire version that the server supports.
    pub min_wire_version: Option<i32>,

    /// The maximum wire version that the server supports.
    pub max_wire_version: Option<i32>,

    /// User-defined tags for a replica set member.
    pub tags: Option<TagSet>,

    /// A unique identifier for each election.
    pub election_id: Option<ObjectId>,

    /// The address of the current primary member of the replica set.
    pub primary: Option<String>,

    /// The monotonic version of the server's view of itself, used by awaitable monitoring.
    pub topology_version: Option<TopologyVersion>,
}

impl HelloCommandResponse {
    pub(crate) fn server_type(&self) -> ServerType {
        if self.msg.as_deref() == Some("isdbgrid") {
            ServerType::Mongos
        } else if self.set_name.is_some() {
            if self.hidden == Some(true) {
                ServerType::RsOther
            } else if self.is_writable_primary == Some(true) || self.is_master == Some(true) {
                ServerType::RsPrimary
            } else if self.secondary == Some(true) {
                ServerType::RsSecondary
            } else if self.arbiter_only == Some(true) {
                ServerType::RsArbiter
            } else {
                ServerType::RsOther
            }
        } else if self.is_replica_set == Some(true) {
            ServerType::RsGhost
        } else {
            ServerType::Standalone
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LastWrite {
    pub last_write_date: DateTime,
}

/// Identifies a point in a server's own monitoring timeline. Replies with an older or
/// equal-counter version from the same process are stale and must not roll the topology back.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyVersion {
    pub process_id: ObjectId,
    pub counter: i64,
}

impl TopologyVersion {
    pub(crate) fn is_more_recent_than(&self, existing: TopologyVersion) -> bool {
        self.process_id != existing.process_id || self.counter > existing.counter
    }

    pub(crate) fn to_document(self) -> Document {
        doc! {
            "processId": self.process_id,
            "counter": self.counter,
        }
    }
}

impl From<TopologyVersion> for Bson {
    fn from(tv: TopologyVersion) -> Self {
        Bson::Document(tv.to_document())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hello_command_advertises_hello_ok_when_unknown() {
        let command = hello_command(None, None);
        assert!(command.contains_key("isMaster"));
        assert_eq!(command.get_bool("helloOk").unwrap(), true);

        let command = hello_command(Some(true), None);
        assert!(command.contains_key("hello"));
        assert!(!command.contains_key("helloOk"));

        let command = hello_command(Some(false), None);
        assert!(command.contains_key("isMaster"));
        assert!(!command.contains_key("helloOk"));
    }

    #[test]
    fn awaitable_options_are_attached() {
        let tv = TopologyVersion {
            process_id: ObjectId::new(),
            counter: 7,
        };
        let command = hello_command(
            Some(true),
            Some(AwaitableHelloOptions {
                topology_version: tv,
                max_await_time: Duration::from_secs(10),
            }),
        );
        assert_eq!(command.get_i64("maxAwaitTimeMS").unwrap(), 10_000);
        assert_eq!(
            command
                .get_document("topologyVersion")
                .unwrap()
                .get_i64("counter")
                .unwrap(),
            7
        );
    }

    #[test]
    fn topology_version_recency() {
        let process = ObjectId::new();
        let v1 = TopologyVersion {
            process_id: process,
            counter: 1,
        };
        let v2 = TopologyVersion {
            process_id: process,
            counter: 2,
        };
        assert!(v2.is_more_recent_than(v1));
        assert!(!v1.is_more_recent_than(v2));
        assert!(!v1.is_more_recent_than(v1));

        let other_process = TopologyVersion {
            process_id: ObjectId::new(),
            counter: 0,
        };
        assert!(other_process.is_more_recent_than(v2));
    }

    #[test]
    fn server_type_classification() {
        let mut response = HelloCommandResponse::default();
        assert_eq!(response.server_type(), ServerType::Standalone);

        response.msg = Some("isdbgrid".to_string());
        assert_eq!(response.server_type(), ServerType::Mongos);

        let mut response = HelloCommandResponse {
            set_name: Some("rs0".to_string()),
            is_writable_primary: Some(true),
            ..Default::default()
        };
        assert_eq!(response.server_type(), ServerType::RsPrimary);

        response.is_writable_primary = None;
        response.secondary = Some(true);
        assert_eq!(response.server_type(), ServerType::RsSecondary);

        response.hidden = Some(true);
        assert_eq!(response.server_type(), ServerType::RsOther);

        let ghost = HelloCommandResponse {
            is_replica_set: Some(true),
            ..Default::default()
        };
        assert_eq!(ghost.server_type(), ServerType::RsGhost);
    }
}
