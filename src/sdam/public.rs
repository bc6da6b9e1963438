use std::{borrow::Cow, fmt, time::Duration};

use crate::{
    bson::DateTime,
    hello::HelloCommandResponse,
    options::ServerAddress,
    sdam::description::server::{ServerDescription, ServerType},
    selection_criteria::TagSet,
};

/// A read-only view of a server's description, used by selection predicates and event
/// consumers.
#[derive(Clone)]
pub struct ServerInfo<'a> {
    description: Cow<'a, ServerDescription>,
}

impl<'a> ServerInfo<'a> {
    pub(crate) fn new_borrowed(description: &'a ServerDescription) -> Self {
        Self {
            description: Cow::Borrowed(description),
        }
    }

    pub(crate) fn new_owned(description: ServerDescription) -> ServerInfo<'static> {
        ServerInfo {
            description: Cow::Owned(description),
        }
    }

    fn command_response_getter<T>(
        &'a self,
        f: impl Fn(&'a HelloCommandResponse) -> Option<T>,
    ) -> Option<T> {
        self.description
            .reply
            .as_ref()
            .ok()
            .and_then(|reply| reply.as_ref().and_then(|r| f(&r.command_response)))
    }

    /// The address of the server.
    pub fn address(&self) -> &ServerAddress {
        &self.description.address
    }

    /// The average round trip time of the server's heartbeats.
    pub fn average_round_trip_time(&self) -> Option<Duration> {
        self.description.average_round_trip_time
    }

    /// The last time the server's description was updated.
    pub fn last_update_time(&self) -> Option<DateTime> {
        self.description.last_update_time
    }

    /// The maximum wire version the server supports.
    pub fn max_wire_version(&self) -> Option<i32> {
        self.command_response_getter(|r| r.max_wire_version)
    }

    /// The minimum wire version the server supports.
    pub fn min_wire_version(&self) -> Option<i32> {
        self.command_response_getter(|r| r.min_wire_version)
    }

    /// The name of the replica set the server belongs to.
    pub fn set_name(&self) -> Option<&str> {
        self.command_response_getter(|r| r.set_name.as_deref())
    }

    /// The replica set config version the server reported.
    pub fn set_version(&self) -> Option<i32> {
        self.command_response_getter(|r| r.set_version)
    }

    /// The type of the server.
    pub fn server_type(&self) -> ServerType {
        self.description.server_type
    }

    /// The tags the server reported for itself.
    pub fn tags(&self) -> Option<&TagSet> {
        self.command_response_getter(|r| r.tags.as_ref())
    }

    /// The error from the server's most recent failed heartbeat.
    pub fn error(&self) -> Option<&String> {
        self.description.error()
    }
}

impl fmt::Debug for ServerInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ServerInfo")
            .field("address", self.address())
            .field("server_type", &self.server_type())
            .field("average_round_trip_time", &self.average_round_trip_time())
            .finish()
    }
}

impl fmt::Display for ServerInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ Address: {}, Type: {:?}",
            self.address(),
            self.server_type()
        )?;
        if let Some(rtt) = self.average_round_trip_time() {
            write!(f, ", Average RTT: {:?}", rtt)?;
        }
        if let Some(error) = self.error() {
            write!(f, ", Error: {}", error)?;
        }
        write!(f, " }}")
    }
}
