//! Periodic re-resolution of `mongodb+srv`-seeded deployments.

use std::{sync::Arc, time::Duration};

use crate::{
    error::Result,
    options::ClientOptions,
    runtime,
    sdam::{
        description::topology::{TopologyType, DEFAULT_HEARTBEAT_FREQUENCY},
        topology::{TopologyUpdater, TopologyWatcher},
    },
    srv::{self, DomainMismatch, LookupHosts, SrvResolver},
};

const MIN_RESCAN_SRV_INTERVAL: Duration = Duration::from_secs(60);

/// Re-queries the SRV records behind the original `mongodb+srv` hostname on an interval
/// driven by record TTLs, keeping the set of known mongos hosts in sync with DNS.
pub(crate) struct SrvPollingMonitor {
    initial_hostname: String,
    resolver: Arc<dyn SrvResolver>,
    topology_updater: TopologyUpdater,
    topology_watcher: TopologyWatcher,
    rescan_interval: Duration,
    client_options: ClientOptions,
}

impl SrvPollingMonitor {
    /// Spawns a polling task if the options came from SRV resolution; does nothing
    /// otherwise.
    pub(crate) fn start(
        topology_updater: TopologyUpdater,
        topology_watcher: TopologyWatcher,
        resolver: Arc<dyn SrvResolver>,
        mut client_options: ClientOptions,
    ) {
        let initial_info = match client_options.original_srv_info.take() {
            Some(info) => info,
            None => return,
        };

        let monitor = Self {
            initial_hostname: initial_info.hostname,
            resolver,
            topology_updater,
            topology_watcher,
            rescan_interval: initial_info.min_ttl,
            client_options,
        };
        runtime::spawn(monitor.execute());
    }

    fn rescan_interval(&self) -> Duration {
        std::cmp::max(self.rescan_interval, MIN_RESCAN_SRV_INTERVAL)
    }

    async fn execute(mut self) {
        fn should_poll(tt: TopologyType) -> bool {
            matches!(tt, TopologyType::Sharded | TopologyType::Unknown)
        }

        while self.topology_watcher.is_alive() {
            runtime::delay_for(self.rescan_interval()).await;

            if should_poll(self.topology_watcher.topology_type()) {
                let hosts = self.lookup_hosts().await;

                // The topology may have transitioned while the lookup was in flight.
                if should_poll(self.topology_watcher.topology_type()) {
                    self.update_hosts(hosts).await;
                }
            }
        }
    }

    async fn lookup_hosts(&self) -> Result<LookupHosts> {
        srv::lookup_hosts(
            self.initial_hostname.as_str(),
            self.resolver.as_ref(),
            DomainMismatch::Skip,
        )
        .await
    }

    async fn update_hosts(&mut self, lookup: Result<LookupHosts>) {
        let lookup = match lookup {
            Ok(LookupHosts { ref hosts, .. }) if hosts.is_empty() => {
                self.no_valid_hosts();
                return;
            }
            Ok(lookup) => lookup,
            Err(error) => {
                tracing::warn!(%error, "SRV lookup failed, keeping current host list");
                self.no_valid_hosts();
                return;
            }
        };

        self.rescan_interval = lookup.min_ttl;

        self.topology_updater
            .sync_hosts(lookup.hosts.into_iter().collect())
            .await;
    }

    fn no_valid_hosts(&mut self) {
        self.rescan_interval = self.heartbeat_freq();
    }

    fn heartbeat_freq(&self) -> Duration {
        self.client_options
            .heartbeat_freq
            .unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY)
    }
}
