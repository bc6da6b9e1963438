use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use rand::{rngs::SmallRng, SeedableRng};
use tokio::sync::{
    broadcast,
    mpsc::{UnboundedReceiver, UnboundedSender},
    watch::{self, Ref},
};
use tracing::{debug, warn};

use crate::{
    bson::oid::ObjectId,
    error::{Error, Result},
    event::{
        SdamEvent,
        ServerClosedEvent,
        ServerDescriptionChangedEvent,
        ServerOpeningEvent,
        TopologyClosedEvent,
        TopologyDescriptionChangedEvent,
        TopologyOpeningEvent,
    },
    options::{ClientOptions, ServerAddress},
    runtime::{self, AcknowledgedMessage},
    sdam::{
        description::{
            server::ServerDescription,
            server_selection,
            topology::{
                SessionSupportStatus,
                TopologyDescription,
                TopologyType,
                TransactionSupportStatus,
            },
        },
        monitor::Monitor,
    },
    selection_criteria::SelectionCriteria,
    session::ClusterTime,
    transport::Connector,
};

pub(crate) const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// The client's view of the deployment: a watch-published immutable snapshot, maintained by a
/// single background worker task that applies updates sent by monitors and operation
/// execution.
#[derive(Debug)]
pub(crate) struct Topology {
    watcher: TopologyWatcher,
    updater: TopologyUpdater,
    update_requester: UpdateRequester,
    options: ClientOptions,
}

impl Topology {
    pub(crate) fn new(options: ClientOptions, connector: Arc<dyn Connector>) -> Result<Topology> {
        options.validate()?;
        let description = TopologyDescription::new(&options)?;
        let is_load_balanced = description.topology_type() == TopologyType::LoadBalanced;

        let update_requester = UpdateRequester::new();
        let (updater, update_receiver) = TopologyUpdater::channel();

        let servers: HashMap<_, _> = description
            .server_addresses()
            .map(|address| (address.clone(), Server::new(address.clone())))
            .collect();

        let state = TopologyState {
            description,
            servers,
        };
        let addresses: Vec<_> = state.servers.keys().cloned().collect();

        let (watcher, broadcaster) = TopologyWatcher::channel(state);

        let worker = TopologyWorker {
            id: ObjectId::new(),
            update_receiver,
            broadcaster,
            options: options.clone(),
            connector: connector.clone(),
            topology_watcher: watcher.clone(),
            topology_updater: updater.clone(),
            update_requester: update_requester.clone(),
        };

        if let Some(ref handler) = options.sdam_event_handler {
            handler.handle(SdamEvent::TopologyOpening(TopologyOpeningEvent {
                topology_id: worker.id,
            }));
            for address in addresses.iter() {
                handler.handle(SdamEvent::ServerOpening(ServerOpeningEvent {
                    topology_id: worker.id,
                    address: address.clone(),
                }));
            }
        }

        if !is_load_balanced && worker.monitoring_enabled() {
            for address in addresses {
                Monitor::start(
                    address,
                    updater.clone(),
                    watcher.clone(),
                    update_requester.subscribe(),
                    connector.clone(),
                    options.clone(),
                );
            }
        }

        worker.start();

        Ok(Topology {
            watcher,
            updater,
            update_requester,
            options,
        })
    }

    /// A handle for observing topology changes.
    pub(crate) fn watch(&self) -> TopologyWatcher {
        let mut watcher = self.watcher.clone();
        // Mark the latest state as seen so the first wait blocks until a real change.
        watcher.receiver.borrow_and_update();
        watcher
    }

    pub(crate) fn updater(&self) -> TopologyUpdater {
        self.updater.clone()
    }

    /// The current set of server handles, keyed by address.
    pub(crate) fn servers(&self) -> HashMap<ServerAddress, Arc<Server>> {
        self.watcher.borrow_latest().servers.clone()
    }

    /// Asks every monitor to check its server now.
    pub(crate) fn request_update(&self) {
        self.update_requester.request()
    }

    pub(crate) fn cluster_time(&self) -> Option<ClusterTime> {
        self.watcher
            .borrow_latest()
            .description
            .cluster_time()
            .cloned()
    }

    pub(crate) async fn advance_cluster_time(&self, to: ClusterTime) {
        self.updater.advance_cluster_time(to).await;
    }

    pub(crate) fn topology_type(&self) -> TopologyType {
        self.watcher.borrow_latest().description.topology_type()
    }

    pub(crate) fn session_support_status(&self) -> SessionSupportStatus {
        self.watcher
            .borrow_latest()
            .description
            .session_support_status()
    }

    pub(crate) fn transaction_support_status(&self) -> TransactionSupportStatus {
        self.watcher
            .borrow_latest()
            .description
            .transaction_support_status()
    }

    pub(crate) fn logical_session_timeout(&self) -> Option<Duration> {
        self.watcher
            .borrow_latest()
            .description
            .logical_session_timeout()
    }

    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        self.updater
            .handle_application_error(address, error, phase)
            .await
    }

    /// Waits for the topology worker to drain and exit. Monitors observe the closed watch
    /// channel and stop on their own.
    pub(crate) async fn shutdown(&self) {
        self.updater.shutdown().await;
    }

    /// Selects a server matching `criteria`, blocking up to the configured server selection
    /// timeout while monitors (re)scan the deployment.
    pub(crate) async fn select_server(
        &self,
        criteria: &SelectionCriteria,
    ) -> Result<SelectedServer> {
        let timeout = self
            .options
            .server_selection_timeout
            .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT);
        let start = Instant::now();
        let mut watcher = self.watch();
        let mut rng = SmallRng::from_os_rng();

        loop {
            let state = watcher.observe_latest();

            let selected = server_selection::attempt_to_select_server(
                criteria,
                &state.description,
                &mut rng,
            )?
            .map(|description| {
                let address = description.address().clone();
                let server = state
                    .servers
                    .get(&address)
                    .cloned()
                    .unwrap_or_else(|| Server::new(address.clone()));
                SelectedServer { address, server }
            });

            if let Some(selected) = selected {
                return Ok(selected);
            }

            // Nothing suitable in this snapshot; ask the monitors to check now and wait for
            // the topology to change.
            self.request_update();

            let remaining = match timeout.checked_sub(start.elapsed()) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => {
                    return Err(Error::server_selection_timeout(
                        watcher
                            .borrow_latest()
                            .description
                            .server_selection_timeout_error_message(criteria),
                    ))
                }
            };

            if !watcher.wait_for_update(remaining).await {
                return Err(Error::server_selection_timeout(
                    watcher
                        .borrow_latest()
                        .description
                        .server_selection_timeout_error_message(criteria),
                ));
            }
        }
    }
}

/// Per-address connection bookkeeping shared between the topology and the cluster. The
/// generation is bumped whenever the server's connections must be discarded; connections
/// remember the generation they were created under.
#[derive(Debug)]
pub(crate) struct Server {
    pub(crate) address: ServerAddress,
    generation: AtomicU32,
}

impl Server {
    fn new(address: ServerAddress) -> Arc<Self> {
        Arc::new(Self {
            address,
            generation: AtomicU32::new(0),
        })
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Invalidates all connections created before this call.
    pub(crate) fn clear_connections(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

/// The result of a successful server selection.
#[derive(Debug, Clone)]
pub(crate) struct SelectedServer {
    pub(crate) address: ServerAddress,
    pub(crate) server: Arc<Server>,
}

/// An immutable snapshot of the topology, published through the watch channel.
#[derive(Debug, Clone)]
pub(crate) struct TopologyState {
    pub(crate) description: TopologyDescription,
    pub(crate) servers: HashMap<ServerAddress, Arc<Server>>,
}

#[derive(Debug)]
pub(crate) enum UpdateMessage {
    AdvanceClusterTime(ClusterTime),
    ServerUpdate(Box<ServerDescription>),
    SyncHosts(HashSet<ServerAddress>),
    MonitorError {
        address: ServerAddress,
        error: Error,
    },
    ApplicationError {
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    },
    Shutdown,
}

struct TopologyWorker {
    id: ObjectId,
    update_receiver: TopologyUpdateReceiver,
    broadcaster: TopologyBroadcaster,
    update_requester: UpdateRequester,
    options: ClientOptions,
    connector: Arc<dyn Connector>,

    topology_watcher: TopologyWatcher,
    topology_updater: TopologyUpdater,
}

impl TopologyWorker {
    fn monitoring_enabled(&self) -> bool {
        #[cfg(test)]
        {
            !self
                .options
                .test_options
                .as_ref()
                .map(|to| to.disable_monitoring_threads)
                .unwrap_or(false)
        }
        #[cfg(not(test))]
        {
            true
        }
    }

    fn start(mut self) {
        runtime::spawn(async move {
            while let Some(update) = self.update_receiver.recv().await {
                let (update, ack) = update.into_parts();
                let mut shutdown = false;
                let changed = match update {
                    UpdateMessage::AdvanceClusterTime(to) => {
                        self.advance_cluster_time(to);
                        true
                    }
                    UpdateMessage::SyncHosts(hosts) => {
                        let mut state = self.broadcaster.clone_latest();
                        let old_description = state.description.clone();
                        state.description.sync_hosts(hosts.clone());
                        self.sync_hosts(&mut state, hosts);
                        let changed =
                            self.process_topology_diff(&old_description, &state.description);
                        self.broadcaster.publish_new_state(state);
                        changed
                    }
                    UpdateMessage::ServerUpdate(sd) => self.update_server(*sd),
                    UpdateMessage::MonitorError { address, error } => {
                        self.handle_monitor_error(address, error)
                    }
                    UpdateMessage::ApplicationError {
                        address,
                        error,
                        phase,
                    } => self.handle_application_error(address, error, phase),
                    UpdateMessage::Shutdown => {
                        shutdown = true;
                        false
                    }
                };
                ack.acknowledge(changed);
                if shutdown {
                    break;
                }
            }

            if let Some(ref handler) = self.options.sdam_event_handler {
                handler.handle(SdamEvent::TopologyClosed(TopologyClosedEvent {
                    topology_id: self.id,
                }));
            }
            debug!("topology worker shutting down");
        });
    }

    fn advance_cluster_time(&mut self, to: ClusterTime) {
        let mut latest_state = self.broadcaster.clone_latest();
        latest_state.description.advance_cluster_time(&to);
        self.broadcaster.publish_new_state(latest_state);
    }

    /// Brings the set of `Server` handles in line with the description's addresses, spawning
    /// monitors for newly added servers.
    fn sync_hosts(&self, state: &mut TopologyState, hosts: HashSet<ServerAddress>) {
        state.servers.retain(|host, _| hosts.contains(host));

        for address in hosts {
            if state.servers.contains_key(&address) {
                continue;
            }
            state.servers.insert(address.clone(), Server::new(address.clone()));

            if self.monitoring_enabled() {
                Monitor::start(
                    address,
                    self.topology_updater.clone(),
                    self.topology_watcher.clone(),
                    self.update_requester.subscribe(),
                    self.connector.clone(),
                    self.options.clone(),
                );
            }
        }
    }

    fn update_server(&mut self, sd: ServerDescription) -> bool {
        let mut latest_state = self.broadcaster.clone_latest();
        let old_description = latest_state.description.clone();

        if let Err(error) = latest_state.description.update(sd) {
            warn!(%error, "rejected invalid server description");
            return false;
        }

        let hosts: HashSet<_> = latest_state
            .description
            .server_addresses()
            .cloned()
            .collect();
        self.sync_hosts(&mut latest_state, hosts);

        let topology_changed =
            self.process_topology_diff(&old_description, &latest_state.description);

        // Publish even when the diff is empty: round trip times fold into the description on
        // every check and selection reads them from the published snapshot.
        self.broadcaster.publish_new_state(latest_state);

        topology_changed
    }

    fn process_topology_diff(
        &self,
        old_description: &TopologyDescription,
        new_description: &TopologyDescription,
    ) -> bool {
        let diff = old_description.diff(new_description);
        let changed = diff.is_some();
        if let Some(ref handler) = self.options.sdam_event_handler {
            if let Some(diff) = diff {
                for (address, (previous, new)) in diff.changed_servers {
                    handler.handle(SdamEvent::ServerDescriptionChanged(Box::new(
                        ServerDescriptionChangedEvent {
                            address: address.clone(),
                            topology_id: self.id,
                            previous_description: previous.clone(),
                            new_description: new.clone(),
                        },
                    )));
                }

                for address in diff.removed_addresses {
                    handler.handle(SdamEvent::ServerClosed(ServerClosedEvent {
                        address: address.clone(),
                        topology_id: self.id,
                    }));
                }

                for address in diff.added_addresses {
                    handler.handle(SdamEvent::ServerOpening(ServerOpeningEvent {
                        address: address.clone(),
                        topology_id: self.id,
                    }));
                }

                handler.handle(SdamEvent::TopologyDescriptionChanged(Box::new(
                    TopologyDescriptionChangedEvent {
                        topology_id: self.id,
                        previous_description: old_description.clone(),
                        new_description: new_description.clone(),
                    },
                )));
            }
        }
        changed
    }

    fn mark_server_as_unknown(&mut self, address: ServerAddress, error: &Error) -> bool {
        let description = ServerDescription::new_from_error(address, error.to_string());
        self.update_server(description)
    }

    fn handle_application_error(
        &mut self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        let server = match self.server(&address) {
            Some(s) => s,
            None => return false,
        };

        // An error from a connection created before the server's last invalidation has
        // already been acted upon.
        if phase.generation() < server.generation() {
            return false;
        }

        if error.is_state_change_error() {
            let updated = self.mark_server_as_unknown(address, &error);

            if updated && (error.is_shutting_down() || phase.wire_version().unwrap_or(0) < 8) {
                server.clear_connections();
            }
            self.update_requester.request();

            updated
        } else if error.is_non_timeout_network_error()
            || (phase.is_before_completion()
                && (error.is_network_timeout() || error.is_command_error()))
        {
            let updated = self.mark_server_as_unknown(address, &error);
            if updated {
                server.clear_connections();
            }
            updated
        } else {
            false
        }
    }

    fn handle_monitor_error(&mut self, address: ServerAddress, error: Error) -> bool {
        match self.server(&address) {
            Some(server) => {
                debug!(%address, %error, "marking server unknown due to monitor error");
                let updated = self.mark_server_as_unknown(address, &error);
                if updated {
                    server.clear_connections();
                }
                updated
            }
            None => false,
        }
    }

    fn server(&self, address: &ServerAddress) -> Option<Arc<Server>> {
        self.broadcaster
            .borrow_latest()
            .servers
            .get(address)
            .cloned()
    }
}

/// The write half of the topology: sends updates into the worker and awaits their
/// acknowledgment.
#[derive(Debug, Clone)]
pub(crate) struct TopologyUpdater {
    sender: UnboundedSender<AcknowledgedMessage<UpdateMessage, bool>>,
}

impl TopologyUpdater {
    pub(crate) fn channel() -> (TopologyUpdater, TopologyUpdateReceiver) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        let updater = TopologyUpdater { sender: tx };
        let update_receiver = TopologyUpdateReceiver {
            update_receiver: rx,
        };

        (updater, update_receiver)
    }

    /// Sends the message and waits for the worker to process it. The returned bool indicates
    /// whether the topology changed as a result.
    async fn send_message(&self, update: UpdateMessage) -> bool {
        let (message, receiver) = AcknowledgedMessage::package(update);

        match self.sender.send(message) {
            Ok(_) => receiver.wait_for_acknowledgment().await.unwrap_or(false),
            _ => false,
        }
    }

    pub(crate) async fn handle_monitor_error(&self, address: ServerAddress, error: Error) -> bool {
        self.send_message(UpdateMessage::MonitorError { address, error })
            .await
    }

    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        self.send_message(UpdateMessage::ApplicationError {
            address,
            error,
            phase,
        })
        .await
    }

    pub(crate) async fn update(&self, sd: ServerDescription) -> bool {
        self.send_message(UpdateMessage::ServerUpdate(Box::new(sd)))
            .await
    }

    pub(crate) async fn advance_cluster_time(&self, to: ClusterTime) {
        self.send_message(UpdateMessage::AdvanceClusterTime(to))
            .await;
    }

    pub(crate) async fn sync_hosts(&self, hosts: HashSet<ServerAddress>) {
        self.send_message(UpdateMessage::SyncHosts(hosts)).await;
    }

    pub(crate) async fn shutdown(&self) {
        self.send_message(UpdateMessage::Shutdown).await;
    }
}

pub(crate) struct TopologyUpdateReceiver {
    update_receiver: UnboundedReceiver<AcknowledgedMessage<UpdateMessage, bool>>,
}

impl TopologyUpdateReceiver {
    pub(crate) async fn recv(&mut self) -> Option<AcknowledgedMessage<UpdateMessage, bool>> {
        self.update_receiver.recv().await
    }
}

/// The read half of the topology: cheap nonblocking access to the latest snapshot, plus the
/// ability to wait for changes.
#[derive(Debug, Clone)]
pub(crate) struct TopologyWatcher {
    receiver: watch::Receiver<TopologyState>,
}

impl TopologyWatcher {
    fn channel(initial_state: TopologyState) -> (TopologyWatcher, TopologyBroadcaster) {
        let (tx, rx) = watch::channel(initial_state);
        let watcher = TopologyWatcher { receiver: rx };
        let broadcaster = TopologyBroadcaster { state_sender: tx };
        (watcher, broadcaster)
    }

    /// Whether the topology worker is still alive.
    pub(crate) fn is_alive(&self) -> bool {
        self.receiver.has_changed().is_ok()
    }

    pub(crate) fn server_description(&self, address: &ServerAddress) -> Option<ServerDescription> {
        self.receiver
            .borrow()
            .description
            .get_server_description(address)
            .cloned()
    }

    /// Returns the latest snapshot, marking it as seen.
    pub(crate) fn observe_latest(&mut self) -> TopologyState {
        self.receiver.borrow_and_update().clone()
    }

    /// Blocks until a new snapshot is published or `timeout` elapses, returning whether a
    /// change was observed.
    pub(crate) async fn wait_for_update(&mut self, timeout: Duration) -> bool {
        let changed = runtime::timeout(timeout, self.receiver.changed())
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
        self.receiver.borrow_and_update();
        changed
    }

    pub(crate) fn borrow_latest(&self) -> Ref<'_, TopologyState> {
        self.receiver.borrow()
    }

    pub(crate) fn topology_type(&self) -> TopologyType {
        self.borrow_latest().description.topology_type()
    }
}

struct TopologyBroadcaster {
    state_sender: watch::Sender<TopologyState>,
}

impl TopologyBroadcaster {
    fn clone_latest(&self) -> TopologyState {
        self.borrow_latest().clone()
    }

    fn borrow_latest(&self) -> Ref<'_, TopologyState> {
        self.state_sender.borrow()
    }

    fn publish_new_state(&self, state: TopologyState) {
        let _ = self.state_sender.send(state);
    }
}

/// Fans "check your server now" requests out to all monitors.
#[derive(Clone, Debug)]
pub(crate) struct UpdateRequester {
    sender: broadcast::Sender<()>,
}

impl UpdateRequester {
    fn new() -> UpdateRequester {
        let (tx, _) = broadcast::channel(1);
        UpdateRequester { sender: tx }
    }

    pub(crate) fn request(&self) {
        let _ = self.sender.send(());
    }

    pub(crate) fn subscribe(&self) -> TopologyUpdateRequestReceiver {
        TopologyUpdateRequestReceiver {
            receiver: self.sender.subscribe(),
        }
    }
}

pub(crate) struct TopologyUpdateRequestReceiver {
    receiver: broadcast::Receiver<()>,
}

impl TopologyUpdateRequestReceiver {
    pub(crate) async fn wait_for_update_request(&mut self, timeout: Duration) {
        let _: std::result::Result<_, _> = runtime::timeout(timeout, self.receiver.recv()).await;
    }

    pub(crate) fn clear_update_requests(&mut self) {
        let _: std::result::Result<_, _> = self.receiver.try_recv();
    }
}

/// A point during an operation's execution relative to the handshake of the connection being
/// used, determining the error handling semantics for certain error types.
#[derive(Debug, Clone)]
pub(crate) enum HandshakePhase {
    /// Before the initial hello completed (e.g. while opening the stream).
    PreHello { generation: u32 },

    /// After the initial hello but before the full handshake completed.
    PostHello { generation: u32 },

    /// After the handshake completed (e.g. when the command was sent to the server).
    AfterCompletion {
        generation: u32,
        max_wire_version: i32,
    },
}

impl HandshakePhase {
    pub(crate) fn after_completion(connection: &crate::transport::Connection) -> Self {
        Self::AfterCompletion {
            generation: connection.generation,
            max_wire_version: connection.max_wire_version.unwrap_or(0),
        }
    }

    fn generation(&self) -> u32 {
        match self {
            Self::PreHello { generation }
            | Self::PostHello { generation }
            | Self::AfterCompletion { generation, .. } => *generation,
        }
    }

    fn is_before_completion(&self) -> bool {
        !matches!(self, HandshakePhase::AfterCompletion { .. })
    }

    /// The wire version of the server as reported by the handshake, if it completed.
    fn wire_version(&self) -> Option<i32> {
        match self {
            HandshakePhase::AfterCompletion {
                max_wire_version, ..
            } => Some(*max_wire_version),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ErrorKind;
    use crate::sdam::description::server::ServerType;
    use crate::sdam::test_util::{rs_primary, rs_secondary, test_topology};
    use crate::selection_criteria::{ReadPreference, SelectionCriteria};

    fn primary_criteria() -> SelectionCriteria {
        SelectionCriteria::ReadPreference(ReadPreference::Primary)
    }

    #[tokio::test]
    async fn selection_succeeds_once_primary_discovered() {
        let topology = test_topology(&["a:27017", "b:27017"], |options| {
            options.server_selection_timeout = Some(Duration::from_secs(5));
        });

        let updater = topology.updater();
        let criteria = primary_criteria();
        let selection = topology.select_server(&criteria);

        let inject = async move {
            updater
                .update(rs_secondary("b:27017", "rs0", &["a:27017", "b:27017"]))
                .await;
            updater
                .update(rs_primary("a:27017", "rs0", &["a:27017", "b:27017"]))
                .await;
        };

        let (selected, _) = tokio::join!(selection, inject);
        assert_eq!(selected.unwrap().address.to_string(), "a:27017");
    }

    #[tokio::test]
    async fn selection_times_out_with_topology_summary() {
        let topology = test_topology(&["a:27017"], |options| {
            options.server_selection_timeout = Some(Duration::from_millis(50));
        });

        let err = topology.select_server(&primary_criteria()).await.unwrap_err();
        match err.kind.as_ref() {
            ErrorKind::ServerSelection { message } => {
                assert!(message.contains("Server selection timeout"));
                assert!(message.contains("a:27017"));
            }
            other => panic!("expected server selection error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn state_change_error_invalidates_server() {
        let topology = test_topology(&["a:27017", "b:27017"], |_| {});
        let updater = topology.updater();
        updater
            .update(rs_primary("a:27017", "rs0", &["a:27017", "b:27017"]))
            .await;

        let address = crate::options::ServerAddress::parse("a:27017").unwrap();
        let server = topology
            .watcher
            .borrow_latest()
            .servers
            .get(&address)
            .cloned()
            .unwrap();
        let generation_before = server.generation();

        let not_primary = Error::new(crate::error::ErrorKind::Command(
            crate::error::CommandError {
                code: 10107,
                code_name: "NotWritablePrimary".into(),
                message: "not primary".into(),
                labels: vec![],
            },
        ));
        // Wire version below 8 clears connections on a state change error.
        let updated = topology
            .handle_application_error(
                address.clone(),
                not_primary,
                HandshakePhase::AfterCompletion {
                    generation: generation_before,
                    max_wire_version: 7,
                },
            )
            .await;
        assert!(updated);
        assert!(server.generation() > generation_before);

        let description = topology.watcher.server_description(&address).unwrap();
        assert_eq!(description.server_type(), ServerType::Unknown);
    }

    #[tokio::test]
    async fn losing_the_primary_reverts_to_no_primary() {
        let hosts = &["a:27017", "b:27017", "c:27017"];
        let topology = test_topology(hosts, |options| {
            options.repl_set_name = Some("rs0".to_string());
        });
        let updater = topology.updater();
        updater.update(rs_primary("a:27017", "rs0", hosts)).await;
        updater.update(rs_secondary("b:27017", "rs0", hosts)).await;
        updater.update(rs_secondary("c:27017", "rs0", hosts)).await;

        assert_eq!(
            topology.topology_type(),
            TopologyType::ReplicaSetWithPrimary
        );
        let selected = topology.select_server(&primary_criteria()).await.unwrap();
        assert_eq!(selected.address.to_string(), "a:27017");

        let address = crate::options::ServerAddress::parse("a:27017").unwrap();
        let generation = topology.watcher.borrow_latest().servers[&address].generation();
        let network_error: Error = crate::error::ErrorKind::Io {
            message: "connection reset".into(),
        }
        .into();
        let updated = topology
            .handle_application_error(
                address,
                network_error,
                HandshakePhase::AfterCompletion {
                    generation,
                    max_wire_version: 17,
                },
            )
            .await;
        assert!(updated);

        assert_eq!(topology.topology_type(), TopologyType::ReplicaSetNoPrimary);

        // With the primary gone, a fresh selection pass over the current snapshot finds no
        // candidate for primary reads.
        let description = topology.watcher.borrow_latest().description.clone();
        let mut rng = SmallRng::seed_from_u64(7);
        let candidate = server_selection::attempt_to_select_server(
            &primary_criteria(),
            &description,
            &mut rng,
        )
        .unwrap();
        assert!(candidate.is_none());
    }

    #[tokio::test]
    async fn stale_generation_errors_are_ignored() {
        let topology = test_topology(&["a:27017"], |_| {});
        let updater = topology.updater();
        updater
            .update(rs_primary("a:27017", "rs0", &["a:27017"]))
            .await;

        let address = crate::options::ServerAddress::parse("a:27017").unwrap();
        let server = topology
            .watcher
            .borrow_latest()
            .servers
            .get(&address)
            .cloned()
            .unwrap();
        server.clear_connections();
        let stale_generation = server.generation() - 1;

        let network_error: Error = crate::error::ErrorKind::Io {
            message: "connection reset".into(),
        }
        .into();
        let updated = topology
            .handle_application_error(
                address.clone(),
                network_error,
                HandshakePhase::AfterCompletion {
                    generation: stale_generation,
                    max_wire_version: 17,
                },
            )
            .await;
        assert!(!updated);

        let description = topology.watcher.server_description(&address).unwrap();
        assert_eq!(description.server_type(), ServerType::RsPrimary);
    }

    #[tokio::test]
    async fn sync_hosts_updates_membership() {
        let topology = test_topology(&["a:27017"], |_| {});
        let updater = topology.updater();

        let hosts: HashSet<_> = ["b:27017", "c:27017"]
            .iter()
            .map(|h| crate::options::ServerAddress::parse(h).unwrap())
            .collect();
        updater.sync_hosts(hosts.clone()).await;

        let current: HashSet<_> = topology
            .watcher
            .borrow_latest()
            .description
            .server_addresses()
            .cloned()
            .collect();
        assert_eq!(current, hosts);
        assert_eq!(topology.watcher.borrow_latest().servers.len(), 2);
    }

    #[tokio::test]
    async fn shutdown_closes_watch_channel() {
        let topology = test_topology(&["a:27017"], |_| {});
        let watcher = topology.watch();
        assert!(watcher.is_alive());
        topology.shutdown().await;
        // The worker exits after acknowledging the shutdown message, dropping the
        // broadcaster.
        let mut watcher = watcher;
        watcher.wait_for_update(Duration::from_millis(100)).await;
        assert!(!watcher.is_alive());
    }

    #[tokio::test]
    async fn predicate_criteria_filters_servers() {
        let topology = test_topology(&["a:27017", "b:27017"], |options| {
            options.server_selection_timeout = Some(Duration::from_secs(1));
        });
        let updater = topology.updater();
        updater
            .update(rs_primary("a:27017", "rs0", &["a:27017", "b:27017"]))
            .await;
        updater
            .update(rs_secondary("b:27017", "rs0", &["a:27017", "b:27017"]))
            .await;

        let criteria = SelectionCriteria::predicate(|info| {
            info.address().to_string() == "b:27017"
        });
        let selected = topology.select_server(&criteria).await.unwrap();
        assert_eq!(selected.address.to_string(), "b:27017");
    }
}
