use std::{
    collections::{HashMap, HashSet},
    fmt,
    time::Duration,
};

use crate::{
    bson::oid::ObjectId,
    error::{Error, Result},
    options::{ClientOptions, ServerAddress},
    sdam::description::server::{ServerDescription, ServerType},
    session::ClusterTime,
};

pub(crate) const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(10);

/// The possible types for a topology.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum TopologyType {
    /// A single mongod server.
    Single,

    /// A replica set with no primary.
    ReplicaSetNoPrimary,

    /// A replica set with a primary.
    ReplicaSetWithPrimary,

    /// A sharded topology.
    Sharded,

    /// A load balanced topology.
    LoadBalanced,

    /// A topology whose type is not known.
    #[default]
    Unknown,
}

impl fmt::Display for TopologyType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Single => "Single",
            Self::ReplicaSetNoPrimary => "ReplicaSetNoPrimary",
            Self::ReplicaSetWithPrimary => "ReplicaSetWithPrimary",
            Self::Sharded => "Sharded",
            Self::LoadBalanced => "LoadBalanced",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// A description of the most up-to-date information known about a topology.
#[derive(Debug, Clone)]
pub struct TopologyDescription {
    /// Whether the topology was initialized with a single seed.
    pub(crate) single_seed: bool,

    /// The current type of the topology.
    pub(crate) topology_type: TopologyType,

    /// The replica set name of the topology.
    pub(crate) set_name: Option<String>,

    /// The highest replica set version the driver has seen by a member of the topology.
    pub(crate) max_set_version: Option<i32>,

    /// The highest replica set election id the driver has seen by a member of the topology.
    pub(crate) max_election_id: Option<ObjectId>,

    /// Describes the compatibility issue between the driver and server with regards to the
    /// respective supported wire versions.
    pub(crate) compatibility_error: Option<String>,

    /// Whether sessions are supported by this topology, and with what timeout.
    pub(crate) session_support_status: SessionSupportStatus,

    /// Whether transactions are supported by this topology.
    pub(crate) transaction_support_status: TransactionSupportStatus,

    /// The highest reported cluster time by any server in this topology.
    pub(crate) cluster_time: Option<ClusterTime>,

    /// The amount of latency beyond that of the suitable server with the minimum latency that
    /// is acceptable for a read operation.
    pub(crate) local_threshold: Option<Duration>,

    /// The interval between server checks.
    pub(crate) heartbeat_freq: Option<Duration>,

    /// The server descriptions of each member of the topology.
    pub(crate) servers: HashMap<ServerAddress, ServerDescription>,
}

impl PartialEq for TopologyDescription {
    fn eq(&self, other: &Self) -> bool {
        // Equality is only used to decide whether to wake up server selection operations, so
        // only the fields the selection algorithm reads matter.
        self.compatibility_error == other.compatibility_error
            && self.servers == other.servers
            && self.topology_type == other.topology_type
    }
}

impl TopologyDescription {
    pub(crate) fn new(options: &ClientOptions) -> Result<Self> {
        if let Some(staleness) = options
            .selection_criteria
            .as_ref()
            .and_then(|criteria| criteria.as_read_pref())
            .and_then(|pref| pref.max_staleness())
        {
            verify_max_staleness(staleness)?;
        }

        let topology_type = if options.direct_connection == Some(true) {
            TopologyType::Single
        } else if options.repl_set_name.is_some() {
            TopologyType::ReplicaSetNoPrimary
        } else {
            TopologyType::Unknown
        };

        let servers: HashMap<_, _> = options
            .hosts
            .iter()
            .map(|address| (address.clone(), ServerDescription::new(address)))
            .collect();

        Ok(Self {
            single_seed: servers.len() == 1,
            topology_type,
            set_name: options.repl_set_name.clone(),
            max_set_version: None,
            max_election_id: None,
            compatibility_error: None,
            session_support_status: SessionSupportStatus::Undetermined,
            transaction_support_status: TransactionSupportStatus::Undetermined,
            cluster_time: None,
            local_threshold: options.local_threshold,
            heartbeat_freq: options.heartbeat_freq,
            servers,
        })
    }

    /// The current type of the topology.
    pub fn topology_type(&self) -> TopologyType {
        self.topology_type
    }

    /// The addresses of the servers in the topology.
    pub fn server_addresses(&self) -> impl Iterator<Item = &ServerAddress> {
        self.servers.keys()
    }

    /// The descriptions of the servers in the topology.
    pub fn servers(&self) -> impl Iterator<Item = &ServerDescription> {
        self.servers.values()
    }

    pub(crate) fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    pub(crate) fn get_server_description(
        &self,
        address: &ServerAddress,
    ) -> Option<&ServerDescription> {
        self.servers.get(address)
    }

    /// The address of the current primary, if there is one.
    pub(crate) fn primary(&self) -> Option<&ServerAddress> {
        self.servers
            .values()
            .find(|server| server.server_type == ServerType::RsPrimary)
            .map(|server| &server.address)
    }

    pub(crate) fn heartbeat_frequency(&self) -> Duration {
        self.heartbeat_freq.unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY)
    }

    pub(crate) fn compatibility_error(&self) -> Option<&String> {
        self.compatibility_error.as_ref()
    }

    pub(crate) fn session_support_status(&self) -> SessionSupportStatus {
        self.session_support_status
    }

    pub(crate) fn transaction_support_status(&self) -> TransactionSupportStatus {
        self.transaction_support_status
    }

    pub(crate) fn logical_session_timeout(&self) -> Option<Duration> {
        match self.session_support_status {
            SessionSupportStatus::Supported {
                logical_session_timeout,
            } => Some(logical_session_timeout),
            _ => None,
        }
    }

    /// Check the cluster for a compatibility error, and record the error message if one is
    /// found.
    fn check_compatibility(&mut self) {
        self.compatibility_error = None;

        for server in self.servers.values() {
            let error_message = server.compatibility_error_message();
            if error_message.is_some() {
                self.compatibility_error = error_message;
                return;
            }
        }
    }

    /// Updates the topology's logical session timeout based on the server's value for it.
    fn update_session_support_status(&mut self, server_description: &ServerDescription) {
        if !server_description.server_type.is_data_bearing() {
            return;
        }

        match server_description.logical_session_timeout().ok().flatten() {
            Some(timeout) => match self.session_support_status {
                SessionSupportStatus::Supported {
                    logical_session_timeout: topology_timeout,
                } => {
                    self.session_support_status = SessionSupportStatus::Supported {
                        logical_session_timeout: std::cmp::min(timeout, topology_timeout),
                    };
                }
                SessionSupportStatus::Undetermined => {
                    self.session_support_status = SessionSupportStatus::Supported {
                        logical_session_timeout: timeout,
                    }
                }
                SessionSupportStatus::Unsupported => {
                    // If every data-bearing server now reports a timeout, sessions became
                    // supported with the minimum of those timeouts.
                    let min_timeout = self
                        .servers
                        .values()
                        .filter(|s| s.server_type.is_data_bearing())
                        .map(|s| s.logical_session_timeout().ok().flatten())
                        .min()
                        .flatten();

                    match min_timeout {
                        Some(timeout) => {
                            self.session_support_status = SessionSupportStatus::Supported {
                                logical_session_timeout: timeout,
                            }
                        }
                        None => {
                            self.session_support_status = SessionSupportStatus::Unsupported
                        }
                    }
                }
            },
            None => self.session_support_status = SessionSupportStatus::Unsupported,
        }
    }

    /// Updates whether this topology can host transactions. Requires session support and wire
    /// version 7+ (8+ when sharded).
    fn update_transaction_support_status(&mut self, server_description: &ServerDescription) {
        if !matches!(
            self.session_support_status,
            SessionSupportStatus::Supported { .. }
        ) {
            self.transaction_support_status = TransactionSupportStatus::Unsupported;
            return;
        }
        if let Ok(Some(max_wire_version)) = server_description.max_wire_version() {
            self.transaction_support_status = if max_wire_version < 7
                || (max_wire_version < 8 && self.topology_type == TopologyType::Sharded)
            {
                TransactionSupportStatus::Unsupported
            } else {
                TransactionSupportStatus::Supported
            }
        }
    }

    /// Sets the topology's cluster time to the provided one if it is higher than the currently
    /// recorded one.
    pub(crate) fn advance_cluster_time(&mut self, cluster_time: &ClusterTime) {
        if self.cluster_time.as_ref() >= Some(cluster_time) {
            return;
        }
        self.cluster_time = Some(cluster_time.clone());
    }

    /// Returns the diff between this topology description and the provided one, or `None` if
    /// they are equal.
    pub(crate) fn diff<'a>(
        &'a self,
        other: &'a TopologyDescription,
    ) -> Option<TopologyDescriptionDiff<'a>> {
        if self == other {
            return None;
        }

        let addresses: HashSet<&ServerAddress> = self.server_addresses().collect();
        let other_addresses: HashSet<&ServerAddress> = other.server_addresses().collect();

        let changed_servers = self
            .servers
            .iter()
            .filter_map(|(address, description)| match other.servers.get(address) {
                Some(other_description) if description != other_description => {
                    Some((address, (description, other_description)))
                }
                _ => None,
            });

        Some(TopologyDescriptionDiff {
            removed_addresses: addresses.difference(&other_addresses).cloned().collect(),
            added_addresses: other_addresses.difference(&addresses).cloned().collect(),
            changed_servers: changed_servers.collect(),
        })
    }

    /// Syncs the set of servers in the description to those in `hosts`. Servers in `hosts` not
    /// already present in the topology will be added, and servers in the topology not present
    /// in `hosts` will be removed.
    pub(crate) fn sync_hosts(&mut self, hosts: HashSet<ServerAddress>) {
        self.add_new_servers_from_addresses(hosts.iter());
        self.servers.retain(|address, _| hosts.contains(address));
    }

    /// Update the topology based on the new information contained by the server description.
    pub(crate) fn update(&mut self, mut server_description: ServerDescription) -> Result<()> {
        // Ignore updates from servers not currently in the topology.
        if !self.servers.contains_key(&server_description.address) {
            return Ok(());
        }

        // Fold in the previous round trip time before replacing the old description.
        let previous_average = self
            .servers
            .get(&server_description.address)
            .and_then(|previous| previous.average_round_trip_time);
        server_description.update_round_trip_time(previous_average);

        self.servers.insert(
            server_description.address.clone(),
            server_description.clone(),
        );

        self.update_session_support_status(&server_description);
        self.update_transaction_support_status(&server_description);

        if let Some(ref cluster_time) = server_description.cluster_time().ok().flatten() {
            self.advance_cluster_time(cluster_time);
        }

        match self.topology_type {
            TopologyType::Single | TopologyType::LoadBalanced => {}
            TopologyType::Unknown => self.update_unknown_topology(server_description)?,
            TopologyType::Sharded => self.update_sharded_topology(server_description),
            TopologyType::ReplicaSetNoPrimary => {
                self.update_replica_set_no_primary_topology(server_description)?
            }
            TopologyType::ReplicaSetWithPrimary => {
                self.update_replica_set_with_primary_topology(server_description)?;
            }
        }

        self.check_compatibility();

        Ok(())
    }

    fn update_unknown_topology(&mut self, server_description: ServerDescription) -> Result<()> {
        match server_description.server_type {
            ServerType::Unknown | ServerType::RsGhost => {}
            ServerType::Standalone => {
                self.update_unknown_with_standalone_server(server_description)
            }
            ServerType::Mongos => self.topology_type = TopologyType::Sharded,
            ServerType::RsPrimary => {
                self.topology_type = TopologyType::ReplicaSetWithPrimary;
                self.update_rs_from_primary_server(server_description)?;
            }
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                self.topology_type = TopologyType::ReplicaSetNoPrimary;
                self.update_rs_without_primary_server(server_description)?;
            }
            ServerType::LoadBalancer => {
                return Err(Error::internal(
                    "load balancers should only appear in load-balanced mode",
                ))
            }
        }

        Ok(())
    }

    fn update_sharded_topology(&mut self, server_description: ServerDescription) {
        match server_description.server_type {
            ServerType::Unknown | ServerType::Mongos => {}
            _ => {
                self.servers.remove(&server_description.address);
            }
        }
    }

    fn update_replica_set_no_primary_topology(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        match server_description.server_type {
            ServerType::Unknown | ServerType::RsGhost => {}
            ServerType::Standalone | ServerType::Mongos | ServerType::LoadBalancer => {
                self.servers.remove(&server_description.address);
            }
            ServerType::RsPrimary => {
                self.topology_type = TopologyType::ReplicaSetWithPrimary;
                self.update_rs_from_primary_server(server_description)?
            }
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                self.update_rs_without_primary_server(server_description)?;
            }
        }

        Ok(())
    }

    fn update_replica_set_with_primary_topology(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        match server_description.server_type {
            ServerType::Unknown | ServerType::RsGhost => {
                self.record_primary_state();
            }
            ServerType::Standalone | ServerType::Mongos | ServerType::LoadBalancer => {
                self.servers.remove(&server_description.address);
                self.record_primary_state();
            }
            ServerType::RsPrimary => self.update_rs_from_primary_server(server_description)?,
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                self.update_rs_with_primary_from_member(server_description)?;
            }
        }

        Ok(())
    }

    /// A standalone in an Unknown topology takes the topology over only if it was the single
    /// seed; otherwise it cannot be part of the deployment being discovered.
    fn update_unknown_with_standalone_server(&mut self, server_description: ServerDescription) {
        if self.single_seed {
            self.topology_type = TopologyType::Single;
        } else {
            self.servers.remove(&server_description.address);
        }
    }

    fn update_rs_without_primary_server(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        if self.set_name.is_none() {
            self.set_name = server_description.set_name().map_err(Error::internal)?;
        } else if self.set_name != server_description.set_name().map_err(Error::internal)? {
            self.servers.remove(&server_description.address);
            return Ok(());
        }

        self.add_new_servers(server_description.known_hosts().map_err(Error::internal)?)?;

        if server_description.invalid_me().map_err(Error::internal)? {
            self.servers.remove(&server_description.address);
        }

        Ok(())
    }

    fn update_rs_with_primary_from_member(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        if self.set_name != server_description.set_name().map_err(Error::internal)? {
            self.servers.remove(&server_description.address);
            self.record_primary_state();
            return Ok(());
        }

        if server_description.invalid_me().map_err(Error::internal)? {
            self.servers.remove(&server_description.address);
            self.record_primary_state();
            return Ok(());
        }

        Ok(())
    }

    fn update_rs_from_primary_server(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        if self.set_name.is_none() {
            self.set_name = server_description.set_name().map_err(Error::internal)?;
        } else if self.set_name != server_description.set_name().map_err(Error::internal)? {
            self.servers.remove(&server_description.address);
            self.record_primary_state();
            return Ok(());
        }

        // A primary claim older than the highest (setVersion, electionId) pair already seen
        // is from a deposed primary; mark it Unknown so a fresh heartbeat re-evaluates it.
        if let Some(server_set_version) =
            server_description.set_version().map_err(Error::internal)?
        {
            if let Some(server_election_id) =
                server_description.election_id().map_err(Error::internal)?
            {
                if let (Some(topology_max_set_version), Some(topology_max_election_id)) =
                    (self.max_set_version, self.max_election_id)
                {
                    if topology_max_set_version > server_set_version
                        || (topology_max_set_version == server_set_version
                            && topology_max_election_id > server_election_id)
                    {
                        self.servers.insert(
                            server_description.address.clone(),
                            ServerDescription::new(&server_description.address),
                        );
                        self.record_primary_state();
                        return Ok(());
                    }
                }

                self.max_election_id = Some(server_election_id);
            }
        }

        if let Some(server_set_version) =
            server_description.set_version().map_err(Error::internal)?
        {
            if self
                .max_set_version
                .map(|topology_max_set_version| server_set_version > topology_max_set_version)
                .unwrap_or(true)
            {
                self.max_set_version = Some(server_set_version);
            }
        }

        let addresses: Vec<_> = self.servers.keys().cloned().collect();

        // Any other server still marked RsPrimary has been superseded; reset it to Unknown so
        // its next heartbeat reclassifies it.
        for address in addresses.clone() {
            if address == server_description.address {
                continue;
            }

            if let Some(description) = self.servers.get(&address) {
                if description.server_type == ServerType::RsPrimary {
                    self.servers
                        .insert(address.clone(), ServerDescription::new(&address));
                }
            }
        }

        self.add_new_servers(server_description.known_hosts().map_err(Error::internal)?)?;
        let known_hosts: HashSet<_> = server_description
            .known_hosts()
            .map_err(Error::internal)?
            .collect();

        for address in addresses {
            if !known_hosts.contains(&address.to_string()) {
                self.servers.remove(&address);
            }
        }

        self.record_primary_state();

        Ok(())
    }

    /// Inspect the topology for a primary server, and update the topology type to
    /// ReplicaSetNoPrimary if none is found.
    ///
    /// This should only be called on a replica set topology.
    fn record_primary_state(&mut self) {
        self.topology_type = if self
            .servers
            .values()
            .any(|server| server.server_type == ServerType::RsPrimary)
        {
            TopologyType::ReplicaSetWithPrimary
        } else {
            TopologyType::ReplicaSetNoPrimary
        };
    }

    fn add_new_servers<'a>(&mut self, servers: impl Iterator<Item = &'a String>) -> Result<()> {
        let servers: Result<Vec<_>> = servers.map(ServerAddress::parse).collect();
        self.add_new_servers_from_addresses(servers?.iter());
        Ok(())
    }

    fn add_new_servers_from_addresses<'a>(
        &mut self,
        servers: impl Iterator<Item = &'a ServerAddress>,
    ) {
        for address in servers {
            self.servers
                .entry(address.clone())
                .or_insert_with(|| ServerDescription::new(address));
        }
    }
}

impl fmt::Display for TopologyDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{ Type: {}", self.topology_type)?;
        if let Some(ref set_name) = self.set_name {
            write!(f, ", Set Name: {}", set_name)?;
        }
        if let Some(ref error) = self.compatibility_error {
            write!(f, ", Compatibility Error: {}", error)?;
        }
        write!(f, ", Servers: [ ")?;
        let mut first = true;
        for server in self.servers.values() {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "{{ Address: {}, Type: {:?}", server.address, server.server_type)?;
            if let Some(error) = server.error() {
                write!(f, ", Error: {}", error)?;
            }
            write!(f, " }}")?;
        }
        write!(f, " ] }}")
    }
}

/// Whether a topology supports sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) enum SessionSupportStatus {
    /// It is not known yet whether the topology supports sessions. This is possible if no
    /// data-bearing servers have updated the topology yet.
    #[default]
    Undetermined,

    /// Sessions are not supported by this topology: some data-bearing server reports no
    /// logical session timeout.
    Unsupported,

    /// Sessions are supported. The timeout is the minimum over all data-bearing servers.
    Supported { logical_session_timeout: Duration },
}

/// Whether a topology supports transactions.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) enum TransactionSupportStatus {
    /// It is not known yet whether the topology supports transactions.
    #[default]
    Undetermined,

    /// Transactions are not supported by this topology.
    Unsupported,

    /// Transactions are supported: sessions are supported and the wire version is at least 7
    /// (8 when sharded). The server still has the final say for any given transaction.
    Supported,
}

/// The diff between two `TopologyDescription`s, from the perspective of the second.
#[derive(Debug)]
pub(crate) struct TopologyDescriptionDiff<'a> {
    pub(crate) removed_addresses: HashSet<&'a ServerAddress>,
    pub(crate) added_addresses: HashSet<&'a ServerAddress>,
    pub(crate) changed_servers:
        HashMap<&'a ServerAddress, (&'a ServerDescription, &'a ServerDescription)>,
}

pub(crate) fn verify_max_staleness(max_staleness: Duration) -> Result<()> {
    if max_staleness > Duration::from_secs(0) && max_staleness < Duration::from_secs(90) {
        return Err(Error::invalid_argument(
            "max staleness cannot be both positive and below 90 seconds",
        ));
    }
    Ok(())
}
