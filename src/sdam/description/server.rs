use std::time::Duration;

use crate::{
    bson::{oid::ObjectId, DateTime},
    hello::{HelloReply, TopologyVersion},
    options::ServerAddress,
    selection_criteria::TagSet,
    session::ClusterTime,
    transport::{DRIVER_MAX_WIRE_VERSION, DRIVER_MIN_WIRE_VERSION},
};

/// The possible types for a server.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum ServerType {
    /// A standalone mongod server.
    Standalone,

    /// A router to a sharded cluster, i.e. a mongos server.
    Mongos,

    /// The primary node in a replica set.
    RsPrimary,

    /// A secondary node in a replica set.
    RsSecondary,

    /// A non-data bearing node in a replica set which can participate in elections.
    RsArbiter,

    /// Hidden, starting up, or recovering nodes in a replica set.
    RsOther,

    /// A member of an uninitialized replica set.
    RsGhost,

    /// A load balancer fronting the deployment.
    LoadBalancer,

    /// A server that the client has not yet successfully probed.
    #[default]
    Unknown,
}

impl ServerType {
    pub(crate) fn is_data_bearing(self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::RsPrimary
                | ServerType::RsSecondary
                | ServerType::Mongos
                | ServerType::LoadBalancer
        )
    }

    pub(crate) fn is_available(self) -> bool {
        !matches!(self, ServerType::Unknown)
    }
}

/// A description of the most up-to-date information known about a server.
#[derive(Debug, Clone)]
pub struct ServerDescription {
    /// The address of this server.
    pub(crate) address: ServerAddress,

    /// The type of this server.
    pub(crate) server_type: ServerType,

    /// The last time this server was updated.
    pub(crate) last_update_time: Option<DateTime>,

    /// The average duration of this server's hello calls.
    pub(crate) average_round_trip_time: Option<Duration>,

    // A server needs to carry an error message if its heartbeat failed, and a newly added
    // server has neither a reply nor an error. Storing a Result of an Option expresses all
    // three states while ruling out "both an error and a reply".
    pub(crate) reply: Result<Option<HelloReply>, String>,
}

impl PartialEq for ServerDescription {
    fn eq(&self, other: &Self) -> bool {
        if self.address != other.address || self.server_type != other.server_type {
            return false;
        }

        match (self.reply.as_ref(), other.reply.as_ref()) {
            (Ok(self_reply), Ok(other_reply)) => {
                let self_response = self_reply.as_ref().map(|r| to_bson(&r.command_response));
                let other_response = other_reply.as_ref().map(|r| to_bson(&r.command_response));
                self_response == other_response
            }
            (Err(self_err), Err(other_err)) => self_err == other_err,
            _ => false,
        }
    }
}

fn to_bson(response: &crate::hello::HelloCommandResponse) -> Option<crate::bson::Document> {
    crate::bson::to_document(response).ok()
}

impl ServerDescription {
    /// A description of a server the client has not yet probed.
    pub(crate) fn new(address: &ServerAddress) -> Self {
        Self {
            address: ServerAddress::Tcp {
                host: address.host().to_lowercase(),
                port: address.port(),
            },
            server_type: Default::default(),
            last_update_time: None,
            reply: Ok(None),
            average_round_trip_time: None,
        }
    }

    /// A description built from the outcome of a hello exchange.
    pub(crate) fn new_from_hello_reply(address: ServerAddress, mut reply: HelloReply) -> Self {
        let mut description = Self::new(&address);
        description.last_update_time = Some(DateTime::now());
        description.average_round_trip_time = Some(reply.round_trip_time);
        description.server_type = reply.command_response.server_type();

        // Normalize all hostnames the server reported so address comparisons are sound.
        let response = &mut reply.command_response;
        for list in [
            response.hosts.as_mut(),
            response.passives.as_mut(),
            response.arbiters.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            for host in list.iter_mut() {
                *host = host.to_lowercase();
            }
        }
        if let Some(ref mut me) = response.me {
            *me = me.to_lowercase();
        }
        if let Some(ref mut primary) = response.primary {
            *primary = primary.to_lowercase();
        }

        description.reply = Ok(Some(reply));
        description
    }

    /// A description recording a failed heartbeat or application error.
    pub(crate) fn new_from_error(address: ServerAddress, error: String) -> Self {
        let mut description = Self::new(&address);
        description.last_update_time = Some(DateTime::now());
        description.reply = Err(error);
        description
    }

    /// Folds the previous average round trip time into this description's measurement using
    /// the standard exponentially-weighted moving average.
    pub(crate) fn update_round_trip_time(&mut self, previous_average: Option<Duration>) {
        if let (Some(new), Some(old)) = (self.average_round_trip_time, previous_average) {
            self.average_round_trip_time = Some((new / 5) + (old * 4 / 5));
        }
    }

    /// The address of this server.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// The type of this server.
    pub fn server_type(&self) -> ServerType {
        self.server_type
    }

    /// The average round trip time of this server's heartbeats, if any have succeeded.
    pub fn average_round_trip_time(&self) -> Option<Duration> {
        self.average_round_trip_time
    }

    /// The error from this server's most recent heartbeat, if it failed.
    pub fn error(&self) -> Option<&String> {
        self.reply.as_ref().err()
    }

    /// Whether this server is available, i.e. has been successfully probed.
    pub(crate) fn is_available(&self) -> bool {
        self.server_type.is_available()
    }

    pub(crate) fn compatibility_error_message(&self) -> Option<String> {
        if let Ok(Some(ref reply)) = self.reply {
            let server_min_wire_version = reply.command_response.min_wire_version.unwrap_or(0);
            if server_min_wire_version > DRIVER_MAX_WIRE_VERSION {
                return Some(format!(
                    "Server at {} requires wire version {}, but this client only supports up \
                     to {}",
                    self.address, server_min_wire_version, DRIVER_MAX_WIRE_VERSION,
                ));
            }

            let server_max_wire_version = reply.command_response.max_wire_version.unwrap_or(0);
            if server_max_wire_version < DRIVER_MIN_WIRE_VERSION {
                return Some(format!(
                    "Server at {} reports wire version {}, but this client requires at least \
                     {}",
                    self.address, server_max_wire_version, DRIVER_MIN_WIRE_VERSION,
                ));
            }
        }

        None
    }

    pub(crate) fn set_name(&self) -> Result<Option<String>, String> {
        let set_name = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.command_response.set_name.clone());
        Ok(set_name)
    }

    pub(crate) fn known_hosts(&self) -> Result<impl Iterator<Item = &String>, String> {
        let known_hosts = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .map(|reply| {
                let hosts = reply.command_response.hosts.as_ref();
                let passives = reply.command_response.passives.as_ref();
                let arbiters = reply.command_response.arbiters.as_ref();

                hosts
                    .into_iter()
                    .flatten()
                    .chain(passives.into_iter().flatten())
                    .chain(arbiters.into_iter().flatten())
            });

        Ok(known_hosts.into_iter().flatten())
    }

    /// Whether the server considers itself to be a different member than the address the
    /// client reached it at.
    pub(crate) fn invalid_me(&self) -> Result<bool, String> {
        if let Some(ref reply) = self.reply.as_ref().map_err(Clone::clone)? {
            if let Some(ref me) = reply.command_response.me {
                return Ok(&self.address.to_string() != me);
            }
        }

        Ok(false)
    }

    pub(crate) fn set_version(&self) -> Result<Option<i32>, String> {
        let set_version = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.command_response.set_version);
        Ok(set_version)
    }

    pub(crate) fn election_id(&self) -> Result<Option<ObjectId>, String> {
        let election_id = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.command_response.election_id);
        Ok(election_id)
    }

    pub(crate) fn topology_version(&self) -> Option<TopologyVersion> {
        self.reply
            .as_ref()
            .ok()
            .and_then(|reply| reply.as_ref())
            .and_then(|reply| reply.command_response.topology_version)
    }

    pub(crate) fn min_wire_version(&self) -> Result<Option<i32>, String> {
        let version = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.command_response.min_wire_version);
        Ok(version)
    }

    pub(crate) fn max_wire_version(&self) -> Result<Option<i32>, String> {
        let version = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.command_response.max_wire_version);
        Ok(version)
    }

    pub(crate) fn last_write_date(&self) -> Result<Option<DateTime>, String> {
        match self.reply {
            Ok(None) => Ok(None),
            Ok(Some(ref reply)) => Ok(reply
                .command_response
                .last_write
                .as_ref()
                .map(|write| write.last_write_date)),
            Err(ref e) => Err(e.clone()),
        }
    }

    pub(crate) fn logical_session_timeout(&self) -> Result<Option<Duration>, String> {
        match self.reply {
            Ok(None) => Ok(None),
            Ok(Some(ref reply)) => Ok(reply
                .command_response
                .logical_session_timeout_minutes
                .map(|timeout| Duration::from_secs(timeout as u64 * 60))),
            Err(ref e) => Err(e.clone()),
        }
    }

    pub(crate) fn cluster_time(&self) -> Result<Option<ClusterTime>, String> {
        match self.reply {
            Ok(None) => Ok(None),
            Ok(Some(ref reply)) => Ok(reply.cluster_time.clone()),
            Err(ref e) => Err(e.clone()),
        }
    }

    /// The tags the server reported for itself, if any.
    pub(crate) fn tags(&self) -> Option<&TagSet> {
        self.reply
            .as_ref()
            .ok()
            .and_then(|reply| reply.as_ref())
            .and_then(|reply| reply.command_response.tags.as_ref())
    }

    pub(crate) fn matches_tag_set(&self, tag_set: &TagSet) -> bool {
        let server_tags = match self.tags() {
            Some(tags) => tags,
            None => return false,
        };

        tag_set
            .iter()
            .all(|(key, val)| server_tags.get(key) == Some(val))
    }
}
