use std::time::Duration;

use rand::{seq::IndexedRandom, Rng};

use crate::{
    error::{ErrorKind, Result},
    sdam::description::{
        server::{ServerDescription, ServerType},
        topology::{verify_max_staleness, TopologyDescription, TopologyType},
    },
    selection_criteria::{ReadPreference, SelectionCriteria, TagSet},
};

pub(crate) const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);

/// Attempts to select a server from the given snapshot, returning `None` if no suitable
/// server is present. The choice among servers in the latency window is uniformly random
/// using `rng`.
pub(crate) fn attempt_to_select_server<'a>(
    criteria: &SelectionCriteria,
    topology_description: &'a TopologyDescription,
    rng: &mut impl Rng,
) -> Result<Option<&'a ServerDescription>> {
    let in_window = topology_description.suitable_servers_in_latency_window(criteria)?;
    Ok(in_window.choose(rng).copied())
}

impl TopologyDescription {
    pub(crate) fn server_selection_timeout_error_message(
        &self,
        criteria: &SelectionCriteria,
    ) -> String {
        if self.has_available_servers() {
            format!(
                "Server selection timeout: None of the available servers suitable for criteria \
                 {:?}. Topology: {}",
                criteria, self
            )
        } else {
            format!(
                "Server selection timeout: No available servers. Topology: {}",
                self
            )
        }
    }

    /// The servers suitable for `criteria` whose latency falls within the window
    /// `[min RTT, min RTT + local threshold]`.
    pub(crate) fn suitable_servers_in_latency_window(
        &self,
        criteria: &SelectionCriteria,
    ) -> Result<Vec<&ServerDescription>> {
        if let Some(message) = self.compatibility_error() {
            return Err(ErrorKind::ServerSelection {
                message: message.to_string(),
            }
            .into());
        }

        let mut suitable_servers = match criteria {
            SelectionCriteria::ReadPreference(ref read_pref) => self.suitable_servers(read_pref)?,
            SelectionCriteria::Predicate(ref filter) => self
                .servers
                .values()
                .filter(|s| {
                    // With a direct connection the single server is eligible regardless of
                    // whether it bears data.
                    (self.topology_type == TopologyType::Single
                        || s.server_type.is_data_bearing())
                        && filter(&crate::sdam::public::ServerInfo::new_borrowed(s))
                })
                .collect(),
        };

        self.retain_servers_within_latency_window(&mut suitable_servers);

        Ok(suitable_servers)
    }

    pub(crate) fn has_available_servers(&self) -> bool {
        self.servers.values().any(|server| server.is_available())
    }

    fn suitable_servers(
        &self,
        read_preference: &ReadPreference,
    ) -> Result<Vec<&ServerDescription>> {
        let servers = match self.topology_type {
            TopologyType::Unknown => Vec::new(),
            TopologyType::Single | TopologyType::LoadBalanced => self.servers.values().collect(),
            TopologyType::Sharded => self.servers_with_type(&[ServerType::Mongos]).collect(),
            TopologyType::ReplicaSetWithPrimary | TopologyType::ReplicaSetNoPrimary => {
                self.suitable_servers_in_replica_set(read_preference)?
            }
        };

        Ok(servers)
    }

    fn retain_servers_within_latency_window(
        &self,
        suitable_servers: &mut Vec<&ServerDescription>,
    ) {
        let shortest_average_rtt = suitable_servers
            .iter()
            .filter_map(|server_desc| server_desc.average_round_trip_time)
            .min();

        let local_threshold = self.local_threshold.unwrap_or(DEFAULT_LOCAL_THRESHOLD);

        let max_rtt_within_window = shortest_average_rtt
            .map(|rtt| rtt.checked_add(local_threshold).unwrap_or(Duration::MAX));

        suitable_servers.retain(move |server_desc| {
            match (server_desc.average_round_trip_time, max_rtt_within_window) {
                (Some(server_rtt), Some(max_rtt)) => server_rtt <= max_rtt,
                // Load balancers are not monitored and have no RTT; they are always in the
                // window.
                _ => matches!(server_desc.server_type, ServerType::LoadBalancer),
            }
        });
    }

    pub(crate) fn servers_with_type<'a>(
        &'a self,
        types: &'a [ServerType],
    ) -> impl Iterator<Item = &'a ServerDescription> {
        self.servers
            .values()
            .filter(move |server| types.contains(&server.server_type))
    }

    fn suitable_servers_in_replica_set(
        &self,
        read_preference: &ReadPreference,
    ) -> Result<Vec<&ServerDescription>> {
        let tag_sets = read_preference.tag_sets();
        let max_staleness = read_preference.max_staleness();

        let servers = match read_preference {
            ReadPreference::Primary => self.servers_with_type(&[ServerType::RsPrimary]).collect(),
            ReadPreference::Secondary { .. } => self.suitable_servers_for_read_preference(
                &[ServerType::RsSecondary],
                tag_sets,
                max_staleness,
            )?,
            ReadPreference::PrimaryPreferred { .. } => {
                match self.servers_with_type(&[ServerType::RsPrimary]).next() {
                    Some(primary) => vec![primary],
                    None => self.suitable_servers_for_read_preference(
                        &[ServerType::RsSecondary],
                        tag_sets,
                        max_staleness,
                    )?,
                }
            }
            ReadPreference::SecondaryPreferred { .. } => {
                let suitable_servers = self.suitable_servers_for_read_preference(
                    &[ServerType::RsSecondary],
                    tag_sets,
                    max_staleness,
                )?;

                if suitable_servers.is_empty() {
                    self.servers_with_type(&[ServerType::RsPrimary]).collect()
                } else {
                    suitable_servers
                }
            }
            ReadPreference::Nearest { .. } => self.suitable_servers_for_read_preference(
                &[ServerType::RsPrimary, ServerType::RsSecondary],
                tag_sets,
                max_staleness,
            )?,
        };

        Ok(servers)
    }

    fn suitable_servers_for_read_preference(
        &self,
        types: &'static [ServerType],
        tag_sets: Option<&Vec<TagSet>>,
        max_staleness: Option<Duration>,
    ) -> Result<Vec<&ServerDescription>> {
        if let Some(max_staleness) = max_staleness {
            verify_max_staleness(max_staleness)?;
        }

        let mut servers = self.servers_with_type(types).collect();

        if let Some(max_staleness) = max_staleness {
            // Per the selection rules, max staleness <= 0 means no staleness filtering.
            if max_staleness > Duration::from_secs(0) {
                self.filter_servers_by_max_staleness(&mut servers, max_staleness);
            }
        }

        if let Some(tag_sets) = tag_sets {
            filter_servers_by_tag_sets(&mut servers, tag_sets);
        }

        Ok(servers)
    }

    fn filter_servers_by_max_staleness(
        &self,
        servers: &mut Vec<&ServerDescription>,
        max_staleness: Duration,
    ) {
        let primary = self
            .servers
            .values()
            .find(|server| server.server_type == ServerType::RsPrimary);

        match primary {
            Some(primary) => {
                self.filter_servers_by_max_staleness_with_primary(servers, primary, max_staleness)
            }
            None => self.filter_servers_by_max_staleness_without_primary(servers, max_staleness),
        };
    }

    fn filter_servers_by_max_staleness_with_primary(
        &self,
        servers: &mut Vec<&ServerDescription>,
        primary: &ServerDescription,
        max_staleness: Duration,
    ) {
        let max_staleness_ms = max_staleness.as_millis().try_into().unwrap_or(i64::MAX);

        servers.retain(|server| {
            let server_staleness = self.calculate_secondary_staleness_with_primary(server, primary);

            server_staleness
                .map(|staleness| staleness <= max_staleness_ms)
                .unwrap_or(false)
        })
    }

    fn filter_servers_by_max_staleness_without_primary(
        &self,
        servers: &mut Vec<&ServerDescription>,
        max_staleness: Duration,
    ) {
        let max_staleness = max_staleness.as_millis().try_into().unwrap_or(i64::MAX);
        let max_write_date = self
            .servers
            .values()
            .filter(|server| server.server_type == ServerType::RsSecondary)
            .filter_map(|server| server.last_write_date().ok().flatten())
            .map(|last_write_date| last_write_date.timestamp_millis())
            .max();

        let secondary_max_write_date = match max_write_date {
            Some(max_write_date) => max_write_date,
            None => return,
        };

        servers.retain(|server| {
            let server_staleness = self
                .calculate_secondary_staleness_without_primary(server, secondary_max_write_date);

            server_staleness
                .map(|staleness| staleness <= max_staleness)
                .unwrap_or(false)
        })
    }

    /// Staleness of a secondary when a primary is present:
    /// `(S.lastUpdateTime - S.lastWriteDate) - (P.lastUpdateTime - P.lastWriteDate) +
    /// heartbeatFrequency`.
    fn calculate_secondary_staleness_with_primary(
        &self,
        secondary: &ServerDescription,
        primary: &ServerDescription,
    ) -> Option<i64> {
        let primary_last_update = primary.last_update_time?.timestamp_millis();
        let primary_last_write = primary.last_write_date().ok()??.timestamp_millis();

        let secondary_last_update = secondary.last_update_time?.timestamp_millis();
        let secondary_last_write = secondary.last_write_date().ok()??.timestamp_millis();

        let heartbeat_frequency = self
            .heartbeat_frequency()
            .as_millis()
            .try_into()
            .unwrap_or(i64::MAX);

        let staleness = (secondary_last_update - secondary_last_write)
            - (primary_last_update - primary_last_write)
            + heartbeat_frequency;

        Some(staleness)
    }

    /// Staleness of a secondary with no primary present, measured against the most
    /// up-to-date secondary.
    fn calculate_secondary_staleness_without_primary(
        &self,
        secondary: &ServerDescription,
        max_last_write_date: i64,
    ) -> Option<i64> {
        let secondary_last_write = secondary.last_write_date().ok()??.timestamp_millis();
        let heartbeat_frequency = self
            .heartbeat_frequency()
            .as_millis()
            .try_into()
            .unwrap_or(i64::MAX);

        let staleness = max_last_write_date - secondary_last_write + heartbeat_frequency;
        Some(staleness)
    }
}

fn filter_servers_by_tag_sets(servers: &mut Vec<&ServerDescription>, tag_sets: &[TagSet]) {
    if tag_sets.is_empty() {
        return;
    }

    // Tag sets are tried in order; the first one matched by any server wins.
    for tag_set in tag_sets {
        let matches_tag_set = |server: &&ServerDescription| server.matches_tag_set(tag_set);

        if servers.iter().any(matches_tag_set) {
            servers.retain(matches_tag_set);
            return;
        }
    }

    servers.clear();
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use rand::{rngs::SmallRng, SeedableRng};

    use super::*;
    use crate::{
        bson::DateTime,
        hello::LastWrite,
        options::ServerAddress,
        sdam::test_util::{mongos, probed_server, rs_primary, rs_secondary, topology_with_hosts},
        selection_criteria::ReadPreferenceOptions,
    };

    fn read_pref(mode: &str, options: ReadPreferenceOptions) -> SelectionCriteria {
        SelectionCriteria::ReadPreference(ReadPreference::from_mode(mode, options).unwrap())
    }

    fn replica_set() -> TopologyDescription {
        let hosts = &["a:27017", "b:27017", "c:27017"];
        let mut topology = topology_with_hosts(hosts);
        topology.update(rs_primary("a:27017", "rs0", hosts)).unwrap();
        topology
            .update(rs_secondary("b:27017", "rs0", hosts))
            .unwrap();
        topology
            .update(rs_secondary("c:27017", "rs0", hosts))
            .unwrap();
        topology
    }

    #[test]
    fn unknown_topology_has_no_candidates() {
        let topology = topology_with_hosts(&["a:27017"]);
        let mut rng = SmallRng::seed_from_u64(0);
        let selected = attempt_to_select_server(
            &read_pref("primary", Default::default()),
            &topology,
            &mut rng,
        )
        .unwrap();
        assert!(selected.is_none());
    }

    #[test]
    fn compatibility_error_fails_selection() {
        let mut topology = topology_with_hosts(&["a:27017"]);
        topology
            .update(probed_server("a:27017", |response| {
                response.min_wire_version = Some(20);
                response.max_wire_version = Some(25);
            }))
            .unwrap();
        let mut rng = SmallRng::seed_from_u64(0);
        let err = attempt_to_select_server(
            &read_pref("primary", Default::default()),
            &topology,
            &mut rng,
        )
        .unwrap_err();
        assert!(matches!(
            err.kind.as_ref(),
            ErrorKind::ServerSelection { .. }
        ));
    }

    #[test]
    fn primary_mode_selects_only_the_primary() {
        let topology = replica_set();
        let mut rng = SmallRng::seed_from_u64(0);
        let selected = attempt_to_select_server(
            &read_pref("primary", Default::default()),
            &topology,
            &mut rng,
        )
        .unwrap()
        .unwrap();
        assert_eq!(selected.address().to_string(), "a:27017");
    }

    #[test]
    fn secondary_preferred_falls_back_to_primary() {
        let hosts = &["a:27017"];
        let mut topology = topology_with_hosts(hosts);
        topology.update(rs_primary("a:27017", "rs0", hosts)).unwrap();

        let mut rng = SmallRng::seed_from_u64(0);
        let selected = attempt_to_select_server(
            &read_pref("secondaryPreferred", Default::default()),
            &topology,
            &mut rng,
        )
        .unwrap()
        .unwrap();
        assert_eq!(selected.address().to_string(), "a:27017");
    }

    #[test]
    fn latency_window_excludes_slow_servers() {
        let hosts = &["a:27017", "b:27017", "c:27017"];
        let mut topology = topology_with_hosts(hosts);
        topology.update(rs_primary("a:27017", "rs0", hosts)).unwrap();

        let mut fast = rs_secondary("b:27017", "rs0", hosts);
        fast.average_round_trip_time = Some(Duration::from_millis(10));
        topology.update(fast).unwrap();

        let mut slow = rs_secondary("c:27017", "rs0", hosts);
        slow.average_round_trip_time = Some(Duration::from_millis(200));
        topology.update(slow).unwrap();

        // RTT averaging starts fresh for each description here, so b ~10ms and c ~200ms with
        // the default 15ms threshold leaves only b.
        let suitable = topology
            .suitable_servers_in_latency_window(&read_pref("secondary", Default::default()))
            .unwrap();
        assert_eq!(suitable.len(), 1);
        assert_eq!(suitable[0].address().to_string(), "b:27017");
    }

    #[test]
    fn tag_sets_are_tried_in_order() {
        let hosts = &["a:27017", "b:27017", "c:27017"];
        let mut topology = topology_with_hosts(hosts);
        topology.update(rs_primary("a:27017", "rs0", hosts)).unwrap();

        let mut ny = rs_secondary("b:27017", "rs0", hosts);
        if let Ok(Some(ref mut reply)) = ny.reply {
            reply.command_response.tags =
                Some([("dc".to_string(), "ny".to_string())].into_iter().collect());
        }
        topology.update(ny).unwrap();

        let mut sf = rs_secondary("c:27017", "rs0", hosts);
        if let Ok(Some(ref mut reply)) = sf.reply {
            reply.command_response.tags =
                Some([("dc".to_string(), "sf".to_string())].into_iter().collect());
        }
        topology.update(sf).unwrap();

        let options = ReadPreferenceOptions {
            tag_sets: Some(vec![
                [("dc".to_string(), "tokyo".to_string())].into_iter().collect(),
                [("dc".to_string(), "sf".to_string())].into_iter().collect(),
                TagSet::new(),
            ]),
            max_staleness: None,
        };
        let suitable = topology
            .suitable_servers_in_latency_window(&read_pref("secondary", options))
            .unwrap();
        assert_eq!(suitable.len(), 1);
        assert_eq!(suitable[0].address().to_string(), "c:27017");

        // An empty tag set list element matches everything if reached first.
        let options = ReadPreferenceOptions {
            tag_sets: Some(vec![TagSet::new()]),
            max_staleness: None,
        };
        let suitable = topology
            .suitable_servers_in_latency_window(&read_pref("secondary", options))
            .unwrap();
        assert_eq!(suitable.len(), 2);
    }

    #[test]
    fn max_staleness_filters_lagging_secondaries() {
        let hosts = &["a:27017", "b:27017", "c:27017"];
        let mut topology = topology_with_hosts(hosts);

        let now = DateTime::now().timestamp_millis();
        let write_at = |millis_ago: i64| LastWrite {
            last_write_date: DateTime::from_millis(now - millis_ago),
        };

        let mut primary = rs_primary("a:27017", "rs0", hosts);
        if let Ok(Some(ref mut reply)) = primary.reply {
            reply.command_response.last_write = Some(write_at(0));
        }
        topology.update(primary).unwrap();

        let mut fresh = rs_secondary("b:27017", "rs0", hosts);
        if let Ok(Some(ref mut reply)) = fresh.reply {
            reply.command_response.last_write = Some(write_at(10_000));
        }
        topology.update(fresh).unwrap();

        let mut stale = rs_secondary("c:27017", "rs0", hosts);
        if let Ok(Some(ref mut reply)) = stale.reply {
            reply.command_response.last_write = Some(write_at(150_000));
        }
        topology.update(stale).unwrap();

        let options = ReadPreferenceOptions {
            tag_sets: None,
            max_staleness: Some(Duration::from_secs(100)),
        };
        let suitable = topology
            .suitable_servers_in_latency_window(&read_pref("secondary", options))
            .unwrap();
        assert_eq!(suitable.len(), 1);
        assert_eq!(suitable[0].address().to_string(), "b:27017");
    }

    #[test]
    fn staleness_without_primary_uses_most_current_secondary() {
        let hosts = &["a:27017", "b:27017"];
        let mut topology = topology_with_hosts(hosts);

        let now = DateTime::now().timestamp_millis();
        let write_at = |millis_ago: i64| LastWrite {
            last_write_date: DateTime::from_millis(now - millis_ago),
        };

        let mut fresh = rs_secondary("a:27017", "rs0", hosts);
        if let Ok(Some(ref mut reply)) = fresh.reply {
            reply.command_response.last_write = Some(write_at(0));
        }
        topology.update(fresh).unwrap();

        let mut stale = rs_secondary("b:27017", "rs0", hosts);
        if let Ok(Some(ref mut reply)) = stale.reply {
            reply.command_response.last_write = Some(write_at(150_000));
        }
        topology.update(stale).unwrap();

        let options = ReadPreferenceOptions {
            tag_sets: None,
            max_staleness: Some(Duration::from_secs(100)),
        };
        let suitable = topology
            .suitable_servers_in_latency_window(&read_pref("secondary", options))
            .unwrap();
        assert_eq!(suitable.len(), 1);
        assert_eq!(suitable[0].address().to_string(), "a:27017");
    }

    #[test]
    fn sharded_topology_selects_mongos() {
        let mut topology = topology_with_hosts(&["a:27017", "b:27017"]);
        topology.update(mongos("a:27017")).unwrap();
        topology.update(mongos("b:27017")).unwrap();

        let suitable = topology
            .suitable_servers_in_latency_window(&read_pref("primary", Default::default()))
            .unwrap();
        assert_eq!(suitable.len(), 2);
    }

    #[test]
    fn seeded_rng_makes_selection_deterministic() {
        let topology = replica_set();
        let criteria = read_pref("nearest", Default::default());

        let mut picks = Vec::new();
        for _ in 0..5 {
            let mut rng = SmallRng::seed_from_u64(42);
            let selected = attempt_to_select_server(&criteria, &topology, &mut rng)
                .unwrap()
                .unwrap();
            picks.push(selected.address().to_string());
        }
        assert!(picks.windows(2).all(|w| w[0] == w[1]));
    }
}
