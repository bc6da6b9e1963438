//! Command execution against the monitored deployment: server selection, per-server
//! connections, session stamping, and the retryable read/write loop.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Instant,
};

use tokio::sync::Mutex;
use typed_builder::TypedBuilder;

use crate::{
    bson::{Bson, Document},
    error::{ErrorKind, Result, RETRYABLE_WRITE_ERROR, TRANSIENT_TRANSACTION_ERROR},
    event::{CommandEvent, CommandFailedEvent, CommandStartedEvent, CommandSucceededEvent},
    options::{ClientOptions, ServerAddress, SessionOptions},
    sdam::{
        HandshakePhase,
        SelectedServer,
        SessionSupportStatus,
        Topology,
        TransactionSupportStatus,
    },
    selection_criteria::{ReadPreference, SelectionCriteria},
    session::{ClientSession, ServerSession, ServerSessionPool},
    srv::SrvResolver,
    transport::{self, Connection, Connector, CsfleHooks},
};
use crate::sdam::srv_polling::SrvPollingMonitor;
use crate::session::TransactionState;

/// Whether and how an operation may be transparently resent after a transient failure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Retryability {
    /// Never retried.
    #[default]
    None,
    /// Retried once against a freshly selected server honoring the read preference.
    Read,
    /// Retried once with the same transaction number against a freshly selected server.
    Write,
}

/// An assembled command ready for execution.
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
#[non_exhaustive]
pub struct Operation {
    /// The database the command runs against.
    pub db: String,

    /// The command body. The first key is the command name.
    pub body: Document,

    /// How to select the server this command runs on. Defaults to the primary.
    #[builder(default)]
    pub selection_criteria: Option<SelectionCriteria>,

    /// The retry semantics of this command.
    #[builder(default)]
    pub retryability: Retryability,
}

impl Operation {
    fn name(&self) -> String {
        self.body.keys().next().cloned().unwrap_or_default()
    }

    /// Whether the command requests an acknowledged write concern (or none, which defaults
    /// to acknowledged).
    fn is_acknowledged(&self) -> bool {
        match self.body.get_document("writeConcern") {
            Ok(wc) => wc.get("w") != Some(&Bson::Int32(0)),
            Err(_) => true,
        }
    }
}

/// A handle to the deployment: owns the monitored topology, the per-server connections, and
/// the server session pool. Cheap to clone; all clones share state.
#[derive(Clone, Debug)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

struct ClusterInner {
    topology: Topology,
    options: ClientOptions,
    connector: Arc<dyn Connector>,
    csfle_hooks: Option<Arc<dyn CsfleHooks>>,
    session_pool: ServerSessionPool,
    connections: Mutex<HashMap<ServerAddress, Vec<Connection>>>,
    next_operation_id: AtomicI64,
}

impl std::fmt::Debug for ClusterInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterInner")
            .field("topology", &self.topology)
            .finish()
    }
}

impl Cluster {
    /// Creates a cluster from the given options, using `connector` to open all connections.
    pub fn new(options: ClientOptions, connector: Arc<dyn Connector>) -> Result<Self> {
        Self::with_csfle_hooks(options, connector, None)
    }

    /// Creates a cluster whose outgoing commands and incoming replies pass through the given
    /// encryption hooks.
    pub fn with_csfle_hooks(
        options: ClientOptions,
        connector: Arc<dyn Connector>,
        csfle_hooks: Option<Arc<dyn CsfleHooks>>,
    ) -> Result<Self> {
        let topology = Topology::new(options.clone(), connector.clone())?;
        Ok(Self {
            inner: Arc::new(ClusterInner {
                topology,
                options,
                connector,
                csfle_hooks,
                session_pool: ServerSessionPool::new(),
                connections: Mutex::new(HashMap::new()),
                next_operation_id: AtomicI64::new(0),
            }),
        })
    }

    /// Starts background re-resolution of the SRV seed list, if these options were produced
    /// by resolving a `mongodb+srv` connection string.
    pub fn start_srv_polling(&self, resolver: Arc<dyn SrvResolver>) {
        SrvPollingMonitor::start(
            self.inner.topology.updater(),
            self.inner.topology.watch(),
            resolver,
            self.inner.options.clone(),
        );
    }

    /// The highest cluster time observed across all servers, if any.
    pub fn cluster_time(&self) -> Option<crate::session::ClusterTime> {
        self.inner.topology.cluster_time()
    }

    pub(crate) fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    /// Shuts down the topology worker. Monitors stop on their own once the topology is gone.
    pub async fn shutdown(&self) {
        self.inner.topology.shutdown().await;
    }

    /// Starts a new session. Fails if the deployment does not support sessions.
    pub async fn start_session(&self, options: Option<SessionOptions>) -> Result<ClientSession> {
        let timeout = match self.session_support_status().await? {
            SessionSupportStatus::Supported {
                logical_session_timeout,
            } => logical_session_timeout,
            _ => {
                return Err(ErrorKind::SessionsNotSupported {
                    message: "sessions are not supported by this deployment".into(),
                }
                .into())
            }
        };
        let server_session = self.inner.session_pool.check_out(Some(timeout)).await;
        Ok(ClientSession::new(
            server_session,
            self.clone(),
            options,
            false,
        ))
    }

    pub(crate) async fn check_in_server_session(&self, session: ServerSession) {
        let timeout = self.inner.topology.logical_session_timeout();
        self.inner.session_pool.check_in(session, timeout).await;
    }

    /// The deployment's session support, forcing a server discovery round if it is not yet
    /// known.
    pub(crate) async fn session_support_status(&self) -> Result<SessionSupportStatus> {
        match self.inner.topology.session_support_status() {
            SessionSupportStatus::Undetermined => {
                self.select_any_server().await?;
                Ok(self.inner.topology.session_support_status())
            }
            status => Ok(status),
        }
    }

    /// The deployment's transaction support, forcing a server discovery round if it is not
    /// yet known.
    pub(crate) async fn transaction_support_status(&self) -> Result<TransactionSupportStatus> {
        match self.inner.topology.transaction_support_status() {
            TransactionSupportStatus::Undetermined => {
                self.select_any_server().await?;
                Ok(self.inner.topology.transaction_support_status())
            }
            status => Ok(status),
        }
    }

    async fn select_any_server(&self) -> Result<SelectedServer> {
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::PrimaryPreferred {
            options: None,
        });
        self.inner.topology.select_server(&criteria).await
    }

    /// Executes an operation on an implicit session (or no session, if the deployment does
    /// not support them).
    pub async fn execute_operation(&self, operation: Operation) -> Result<Document> {
        match self.start_implicit_session().await? {
            Some(mut session) => {
                self.execute_operation_impl(operation, Some(&mut session))
                    .await
            }
            None => self.execute_operation_impl(operation, None).await,
        }
    }

    /// Executes an operation on the given session.
    pub async fn execute_operation_with_session(
        &self,
        operation: Operation,
        session: &mut ClientSession,
    ) -> Result<Document> {
        self.execute_operation_impl(operation, Some(session)).await
    }

    pub(crate) async fn execute_transaction_command(
        &self,
        command: Document,
        criteria: SelectionCriteria,
        session: &mut ClientSession,
    ) -> Result<Document> {
        let operation = Operation {
            db: "admin".to_string(),
            body: command,
            selection_criteria: Some(criteria),
            retryability: Retryability::Write,
        };
        self.execute_operation_impl(operation, Some(session)).await
    }

    async fn start_implicit_session(&self) -> Result<Option<ClientSession>> {
        match self.inner.topology.session_support_status() {
            SessionSupportStatus::Supported {
                logical_session_timeout,
            } => {
                let server_session = self
                    .inner
                    .session_pool
                    .check_out(Some(logical_session_timeout))
                    .await;
                Ok(Some(ClientSession::new(
                    server_session,
                    self.clone(),
                    None,
                    true,
                )))
            }
            _ => Ok(None),
        }
    }

    async fn execute_operation_impl(
        &self,
        operation: Operation,
        mut session: Option<&mut ClientSession>,
    ) -> Result<Document> {
        let operation_id = self.inner.next_operation_id.fetch_add(1, Ordering::SeqCst);

        let criteria = self.resolve_selection_criteria(&operation, session.as_deref());
        let retryability = self.effective_retryability(&operation, session.as_deref());

        // Retryable writes consume one transaction number per logical operation; a retry
        // resends the same number so the server can deduplicate.
        let retry_txn_number = match (retryability, session.as_deref_mut()) {
            (Retryability::Write, Some(s)) if s.transaction.state == TransactionState::None => {
                Some(s.get_and_increment_txn_number())
            }
            _ => None,
        };

        let first_error = match self
            .execute_attempt(
                &operation,
                &criteria,
                &mut session,
                operation_id,
                retry_txn_number,
            )
            .await
        {
            Ok(reply) => return Ok(reply),
            Err(error) => {
                let retryable = match retryability {
                    Retryability::Read => error.is_read_retryable(),
                    Retryability::Write => error.is_write_retryable(),
                    Retryability::None => false,
                };
                if !retryable {
                    return Err(error);
                }
                error
            }
        };

        // The retry selects a fresh server; if no server can be found, the original error is
        // more informative than the selection timeout.
        match self
            .execute_attempt(
                &operation,
                &criteria,
                &mut session,
                operation_id,
                retry_txn_number,
            )
            .await
        {
            Ok(reply) => Ok(reply),
            Err(second_error) => {
                if matches!(second_error.kind.as_ref(), ErrorKind::ServerSelection { .. }) {
                    Err(first_error)
                } else {
                    Err(second_error)
                }
            }
        }
    }

    fn resolve_selection_criteria(
        &self,
        operation: &Operation,
        session: Option<&ClientSession>,
    ) -> SelectionCriteria {
        if let Some(ref criteria) = operation.selection_criteria {
            return criteria.clone();
        }
        if let Some(session) = session {
            if session.in_transaction() {
                return session.transaction_selection_criteria();
            }
        }
        self.inner
            .options
            .selection_criteria
            .clone()
            .unwrap_or(SelectionCriteria::ReadPreference(ReadPreference::Primary))
    }

    fn effective_retryability(
        &self,
        operation: &Operation,
        session: Option<&ClientSession>,
    ) -> Retryability {
        let in_transaction = session.map(|s| s.in_transaction()).unwrap_or(false);
        match operation.retryability {
            Retryability::Write
                if !in_transaction
                    && session.is_some()
                    && self.inner.options.retry_writes != Some(false)
                    && operation.is_acknowledged() =>
            {
                Retryability::Write
            }
            Retryability::Read
                if !in_transaction && self.inner.options.retry_reads != Some(false) =>
            {
                Retryability::Read
            }
            _ => Retryability::None,
        }
    }

    async fn execute_attempt(
        &self,
        operation: &Operation,
        criteria: &SelectionCriteria,
        session: &mut Option<&mut ClientSession>,
        operation_id: i64,
        retry_txn_number: Option<i64>,
    ) -> Result<Document> {
        let selected = self.inner.topology.select_server(criteria).await?;

        let mut connection = match self.check_out_connection(&selected).await {
            Ok(connection) => connection,
            Err(mut error) => {
                if let Some(s) = session.as_deref_mut() {
                    if error.is_network_error() {
                        s.mark_dirty();
                    }
                }
                if operation.retryability == Retryability::Write
                    && error.should_add_retryable_write_label(0)
                {
                    error = error.with_label(RETRYABLE_WRITE_ERROR);
                }
                return Err(error);
            }
        };

        let command =
            self.build_command(operation, criteria, session.as_deref(), retry_txn_number)?;
        let command = match self.inner.csfle_hooks {
            Some(ref hooks) => hooks.before_send(&operation.db, command).await?,
            None => command,
        };

        let command_name = operation.name();
        let request_id = transport::next_request_id();
        self.emit_command_event(|| {
            CommandEvent::Started(CommandStartedEvent {
                command: command.clone(),
                db: operation.db.clone(),
                command_name: command_name.clone(),
                operation_id,
                request_id,
                server_address: selected.address.clone(),
            })
        });

        if let Some(s) = session.as_deref_mut() {
            s.update_last_use();
        }

        let start = Instant::now();
        let (result, cluster_time) = connection.run_command(&command).await;
        let duration = start.elapsed();

        if let Some(cluster_time) = cluster_time {
            self.inner
                .topology
                .advance_cluster_time(cluster_time.clone())
                .await;
            if let Some(s) = session.as_deref_mut() {
                s.advance_cluster_time(&cluster_time);
            }
        }

        match result {
            Ok(reply) => {
                let reply = match self.inner.csfle_hooks {
                    Some(ref hooks) => hooks.after_receive(reply).await?,
                    None => reply,
                };
                self.emit_command_event(|| {
                    CommandEvent::Succeeded(CommandSucceededEvent {
                        duration,
                        reply: reply.clone(),
                        command_name: command_name.clone(),
                        operation_id,
                        request_id,
                        server_address: selected.address.clone(),
                    })
                });

                if let Some(s) = session.as_deref_mut() {
                    if let Ok(operation_time) = reply.get_timestamp("operationTime") {
                        s.advance_operation_time(operation_time);
                    }
                    if let Ok(token) = reply.get_document("recoveryToken") {
                        s.transaction.recovery_token = Some(token.clone());
                    }
                    if s.transaction.state == TransactionState::Starting {
                        s.transaction.state = TransactionState::InProgress;
                    }
                }

                self.check_in_connection(&selected, connection).await;
                Ok(reply)
            }
            Err(mut error) => {
                self.emit_command_event(|| {
                    CommandEvent::Failed(CommandFailedEvent {
                        duration,
                        command_name: command_name.clone(),
                        failure: error.clone(),
                        operation_id,
                        request_id,
                        server_address: selected.address.clone(),
                    })
                });

                if let Some(s) = session.as_deref_mut() {
                    if error.is_network_error() {
                        s.mark_dirty();
                    }
                    if s.in_transaction() && error.is_network_error() {
                        error = error.with_label(TRANSIENT_TRANSACTION_ERROR);
                    }
                }

                if operation.retryability == Retryability::Write {
                    let max_wire_version = connection.max_wire_version.unwrap_or(0);
                    if error.should_add_retryable_write_label(max_wire_version) {
                        error = error.with_label(RETRYABLE_WRITE_ERROR);
                    }
                }

                let phase = HandshakePhase::after_completion(&connection);
                self.inner
                    .topology
                    .handle_application_error(selected.address.clone(), error.clone(), phase)
                    .await;

                // A connection that produced a network error is never reused.
                if !error.is_network_error() {
                    self.check_in_connection(&selected, connection).await;
                }

                Err(error)
            }
        }
    }

    fn build_command(
        &self,
        operation: &Operation,
        criteria: &SelectionCriteria,
        session: Option<&ClientSession>,
        retry_txn_number: Option<i64>,
    ) -> Result<Document> {
        let mut command = operation.body.clone();
        command.insert("$db", operation.db.clone());

        if let Some(session) = session {
            command.insert("lsid", session.id().clone());

            match session.transaction.state {
                TransactionState::Starting => {
                    command.insert("txnNumber", session.txn_number());
                    command.insert("startTransaction", true);
                    command.insert("autocommit", false);

                    let mut read_concern = session
                        .transaction
                        .options
                        .as_ref()
                        .and_then(|options| options.read_concern.as_ref())
                        .map(|rc| rc.to_document())
                        .unwrap_or_default();
                    if session.causal_consistency() {
                        if let Some(operation_time) = session.operation_time() {
                            read_concern
                                .insert("afterClusterTime", Bson::Timestamp(operation_time));
                        }
                    }
                    if !read_concern.is_empty() {
                        command.insert("readConcern", read_concern);
                    }
                }
                TransactionState::InProgress | TransactionState::Ending => {
                    command.insert("txnNumber", session.txn_number());
                    command.insert("autocommit", false);
                }
                _ => {
                    if let Some(txn_number) = retry_txn_number {
                        command.insert("txnNumber", txn_number);
                    }
                    if operation.retryability == Retryability::Read
                        && session.causal_consistency()
                    {
                        if let Some(operation_time) = session.operation_time() {
                            let mut read_concern = command
                                .get_document("readConcern")
                                .cloned()
                                .unwrap_or_default();
                            read_concern
                                .insert("afterClusterTime", Bson::Timestamp(operation_time));
                            command.insert("readConcern", read_concern);
                        }
                    }
                }
            }
        }

        let session_cluster_time = session.and_then(|s| s.cluster_time().cloned());
        let highest_cluster_time =
            match (self.inner.topology.cluster_time(), session_cluster_time) {
                (Some(a), Some(b)) => Some(std::cmp::max(a, b)),
                (a, b) => a.or(b),
            };
        if let Some(cluster_time) = highest_cluster_time {
            command.insert("$clusterTime", crate::bson::to_document(&cluster_time)?);
        }

        if let SelectionCriteria::ReadPreference(ref read_preference) = criteria {
            if !matches!(read_preference, ReadPreference::Primary) {
                command.insert("$readPreference", read_preference.to_document());
            }
        }

        Ok(command)
    }

    async fn check_out_connection(&self, selected: &SelectedServer) -> Result<Connection> {
        let generation = selected.server.generation();

        {
            let mut pools = self.inner.connections.lock().await;
            if let Some(pool) = pools.get_mut(&selected.address) {
                // Drop any connections invalidated since they were pooled.
                while let Some(connection) = pool.pop() {
                    if connection.generation == selected.server.generation() {
                        return Ok(connection);
                    }
                }
            }
        }

        let stream = match self.inner.connector.connect(&selected.address).await {
            Ok(stream) => stream,
            Err(error) => {
                self.inner
                    .topology
                    .handle_application_error(
                        selected.address.clone(),
                        error.clone(),
                        HandshakePhase::PreHello { generation },
                    )
                    .await;
                return Err(error);
            }
        };

        let mut connection = Connection::new(
            selected.address.clone(),
            stream,
            generation,
            self.inner.options.socket_timeout,
        );
        if let Err(error) = connection.handshake().await {
            self.inner
                .topology
                .handle_application_error(
                    selected.address.clone(),
                    error.clone(),
                    HandshakePhase::PostHello { generation },
                )
                .await;
            return Err(error);
        }

        Ok(connection)
    }

    async fn check_in_connection(&self, selected: &SelectedServer, connection: Connection) {
        let current_servers = self.inner.topology.servers();
        let mut pools = self.inner.connections.lock().await;

        if connection.generation == selected.server.generation()
            && current_servers.contains_key(&selected.address)
        {
            pools
                .entry(selected.address.clone())
                .or_default()
                .push(connection);
        }

        // A server removed from the topology takes its pooled connections with it, and
        // connections from cleared generations are discarded rather than held until the next
        // check-out against that address.
        pools.retain(|address, pool| match current_servers.get(address) {
            Some(server) => {
                let generation = server.generation();
                pool.retain(|connection| connection.generation == generation);
                !pool.is_empty()
            }
            None => false,
        });
    }

    fn emit_command_event(&self, make_event: impl FnOnce() -> CommandEvent) {
        if let Some(ref handler) = self.inner.options.command_event_handler {
            handler.handle(make_event());
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        collections::{HashMap, HashSet, VecDeque},
        sync::Mutex,
        time::Duration,
    };

    use futures_core::future::BoxFuture;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        bson::{doc, Timestamp},
        error::Error,
        event::EventHandler,
        hello::HelloCommandResponse,
        options::TestOptions,
        sdam::test_util,
        session::ClusterTime,
        transport::MessageStream,
    };

    /// Shared script driving every [`ScriptedStream`] a test's connector hands out.
    ///
    /// Handshake hellos are answered per address; all other commands are recorded in `sent`
    /// and answered from the front of `replies` (defaulting to `{ok: 1}` once exhausted).
    #[derive(Default)]
    struct ScriptState {
        hellos: HashMap<ServerAddress, Document>,
        replies: VecDeque<Result<Document>>,
        sent: Vec<(ServerAddress, Document)>,
    }

    #[derive(Clone, Default)]
    struct ScriptedConnector {
        state: Arc<Mutex<ScriptState>>,
    }

    impl ScriptedConnector {
        fn new() -> Self {
            Self::default()
        }

        fn add_hello(&self, address: &str, customize: impl FnOnce(&mut HelloCommandResponse)) {
            let address = ServerAddress::parse(address).unwrap();
            let reply = test_util::hello_reply(&address, customize);
            let mut doc = crate::bson::to_document(&reply.command_response).unwrap();
            doc.insert("ok", 1);
            self.state.lock().unwrap().hellos.insert(address, doc);
        }

        fn push_reply(&self, reply: Result<Document>) {
            self.state.lock().unwrap().replies.push_back(reply);
        }

        fn sent(&self) -> Vec<(ServerAddress, Document)> {
            self.state.lock().unwrap().sent.clone()
        }
    }

    impl Connector for ScriptedConnector {
        fn connect<'a>(
            &'a self,
            address: &'a ServerAddress,
        ) -> BoxFuture<'a, Result<Box<dyn MessageStream>>> {
            Box::pin(async move {
                Ok(Box::new(ScriptedStream {
                    address: address.clone(),
                    state: self.state.clone(),
                    pending: None,
                }) as Box<dyn MessageStream>)
            })
        }
    }

    struct ScriptedStream {
        address: ServerAddress,
        state: Arc<Mutex<ScriptState>>,
        pending: Option<Document>,
    }

    impl MessageStream for ScriptedStream {
        fn write_message<'a>(&'a mut self, message: &'a Document) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                self.pending = Some(message.clone());
                Ok(())
            })
        }

        fn read_message(&mut self) -> BoxFuture<'_, Result<Document>> {
            Box::pin(async move {
                let command = self
                    .pending
                    .take()
                    .ok_or_else(|| Error::internal("read without a prior write"))?;
                let mut state = self.state.lock().unwrap();
                if command.contains_key("hello") || command.contains_key("isMaster") {
                    return state
                        .hellos
                        .get(&self.address)
                        .cloned()
                        .ok_or_else(|| Error::internal("no scripted hello for this address"));
                }
                state.sent.push((self.address.clone(), command));
                state
                    .replies
                    .pop_front()
                    .unwrap_or_else(|| Ok(doc! { "ok": 1 }))
            })
        }
    }

    fn error_reply(code: i32, message: &str, labels: &[&str]) -> Document {
        doc! {
            "ok": 0,
            "code": code,
            "codeName": "ScriptedError",
            "errmsg": message,
            "errorLabels": labels.iter().map(|l| l.to_string()).collect::<Vec<_>>(),
        }
    }

    fn network_error() -> Error {
        ErrorKind::Io {
            message: "connection reset by peer".into(),
        }
        .into()
    }

    /// A cluster with monitoring disabled; tests feed server descriptions through the
    /// topology's updater handle and serve application traffic from `connector`.
    fn test_cluster(
        hosts: &[&str],
        connector: &ScriptedConnector,
        customize: impl FnOnce(&mut ClientOptions),
    ) -> Cluster {
        let mut options = test_util::options_with_hosts(hosts);
        options.test_options = Some(TestOptions {
            disable_monitoring_threads: true,
            ..Default::default()
        });
        customize(&mut options);
        Cluster::new(options, Arc::new(connector.clone())).unwrap()
    }

    async fn sharded_cluster(
        hosts: &[&str],
        connector: &ScriptedConnector,
        customize: impl FnOnce(&mut ClientOptions),
    ) -> Cluster {
        for host in hosts {
            connector.add_hello(host, |response| {
                response.msg = Some("isdbgrid".to_string());
            });
        }
        let cluster = test_cluster(hosts, connector, customize);
        let updater = cluster.topology().updater();
        for host in hosts {
            updater.update(test_util::mongos(host)).await;
        }
        cluster
    }

    async fn replica_set_cluster(host: &str, connector: &ScriptedConnector) -> Cluster {
        let me = host.to_string();
        connector.add_hello(host, move |response| {
            response.set_name = Some("rs0".to_string());
            response.hosts = Some(vec![me.clone()]);
            response.me = Some(me);
        });
        let cluster = test_cluster(&[host], connector, |_| {});
        cluster
            .topology()
            .updater()
            .update(test_util::rs_primary(host, "rs0", &[host]))
            .await;
        cluster
    }

    fn insert_op() -> Operation {
        Operation::builder()
            .db("db")
            .body(doc! { "insert": "coll", "documents": [{ "x": 1 }] })
            .retryability(Retryability::Write)
            .build()
    }

    fn find_op() -> Operation {
        Operation::builder()
            .db("db")
            .body(doc! { "find": "coll" })
            .retryability(Retryability::Read)
            .build()
    }

    #[tokio::test]
    async fn retryable_write_resends_txn_number_on_new_server() {
        let connector = ScriptedConnector::new();
        let cluster = sharded_cluster(&["a:27017", "b:27017"], &connector, |_| {}).await;

        connector.push_reply(Ok(error_reply(
            11600,
            "interrupted at shutdown",
            &["RetryableWriteError"],
        )));
        connector.push_reply(Ok(doc! { "ok": 1, "n": 1 }));

        let mut session = cluster.start_session(None).await.unwrap();
        cluster
            .execute_operation_with_session(insert_op(), &mut session)
            .await
            .unwrap();

        let sent = connector.sent();
        assert_eq!(sent.len(), 2);
        // The retry runs against the other mongos with the same session and transaction
        // number.
        assert_ne!(sent[0].0, sent[1].0);
        for (_, command) in &sent {
            assert_eq!(command.get_document("lsid").unwrap(), session.id());
            assert_eq!(command.get_i64("txnNumber").unwrap(), 1);
        }
    }

    #[tokio::test]
    async fn second_failure_is_surfaced() {
        let connector = ScriptedConnector::new();
        let cluster = sharded_cluster(&["a:27017", "b:27017"], &connector, |_| {}).await;

        connector.push_reply(Ok(error_reply(
            11600,
            "first failure",
            &["RetryableWriteError"],
        )));
        connector.push_reply(Ok(error_reply(
            11602,
            "second failure",
            &["RetryableWriteError"],
        )));

        let mut session = cluster.start_session(None).await.unwrap();
        let error = cluster
            .execute_operation_with_session(insert_op(), &mut session)
            .await
            .unwrap_err();
        assert_eq!(error.code(), Some(11602));
    }

    #[tokio::test]
    async fn original_error_surfaced_when_reselection_fails() {
        let connector = ScriptedConnector::new();
        let cluster = sharded_cluster(&["a:27017"], &connector, |options| {
            options.server_selection_timeout = Some(Duration::from_millis(100));
        })
        .await;

        connector.push_reply(Ok(error_reply(
            11600,
            "interrupted at shutdown",
            &["RetryableWriteError"],
        )));

        let mut session = cluster.start_session(None).await.unwrap();
        // The state change error marks the only server Unknown, so the retry's server
        // selection times out and the first error wins.
        let error = cluster
            .execute_operation_with_session(insert_op(), &mut session)
            .await
            .unwrap_err();
        assert_eq!(error.code(), Some(11600));
        assert!(error.is_write_retryable());
    }

    #[tokio::test]
    async fn disabling_retry_writes_skips_txn_number() {
        let connector = ScriptedConnector::new();
        let cluster = sharded_cluster(&["a:27017"], &connector, |options| {
            options.retry_writes = Some(false);
        })
        .await;

        connector.push_reply(Ok(error_reply(
            11600,
            "interrupted at shutdown",
            &["RetryableWriteError"],
        )));

        let mut session = cluster.start_session(None).await.unwrap();
        cluster
            .execute_operation_with_session(insert_op(), &mut session)
            .await
            .unwrap_err();

        let sent = connector.sent();
        assert_eq!(sent.len(), 1);
        assert!(!sent[0].1.contains_key("txnNumber"));
    }

    #[tokio::test]
    async fn unacknowledged_writes_are_not_retried() {
        let connector = ScriptedConnector::new();
        let cluster = sharded_cluster(&["a:27017"], &connector, |_| {}).await;

        connector.push_reply(Ok(error_reply(
            11600,
            "interrupted at shutdown",
            &["RetryableWriteError"],
        )));

        let operation = Operation::builder()
            .db("db")
            .body(doc! {
                "insert": "coll",
                "documents": [{ "x": 1 }],
                "writeConcern": { "w": 0 },
            })
            .retryability(Retryability::Write)
            .build();

        let mut session = cluster.start_session(None).await.unwrap();
        cluster
            .execute_operation_with_session(operation, &mut session)
            .await
            .unwrap_err();

        let sent = connector.sent();
        assert_eq!(sent.len(), 1);
        assert!(!sent[0].1.contains_key("txnNumber"));
    }

    #[tokio::test]
    async fn transaction_commit_lifecycle() {
        let connector = ScriptedConnector::new();
        let cluster = replica_set_cluster("a:27017", &connector).await;

        let mut session = cluster.start_session(None).await.unwrap();
        session.start_transaction(None).await.unwrap();
        cluster
            .execute_operation_with_session(insert_op(), &mut session)
            .await
            .unwrap();
        session.commit_transaction().await.unwrap();

        let sent = connector.sent();
        assert_eq!(sent.len(), 2);

        let first = &sent[0].1;
        assert_eq!(first.get_bool("startTransaction").unwrap(), true);
        assert_eq!(first.get_bool("autocommit").unwrap(), false);
        assert_eq!(first.get_i64("txnNumber").unwrap(), 1);
        assert_eq!(first.get_document("lsid").unwrap(), session.id());

        let commit = &sent[1].1;
        assert_eq!(commit.get_i32("commitTransaction").unwrap(), 1);
        assert!(!commit.contains_key("startTransaction"));
        assert_eq!(commit.get_bool("autocommit").unwrap(), false);
        assert_eq!(commit.get_i64("txnNumber").unwrap(), 1);

        // Nothing is in progress anymore, so a second commit is a local error.
        let error = session.commit_transaction().await.unwrap_err();
        assert!(error.to_string().contains("no transaction in progress"));
        assert_eq!(connector.sent().len(), 2);
    }

    #[tokio::test]
    async fn commit_retry_upgrades_write_concern_to_majority() {
        let connector = ScriptedConnector::new();
        let cluster = replica_set_cluster("a:27017", &connector).await;

        let mut session = cluster.start_session(None).await.unwrap();
        session.start_transaction(None).await.unwrap();
        cluster
            .execute_operation_with_session(insert_op(), &mut session)
            .await
            .unwrap();

        // A non-retryable commit failure leaves the transaction un-resolved; the
        // application-level retry must escalate the write concern.
        connector.push_reply(Ok(error_reply(50, "operation exceeded time limit", &[])));
        connector.push_reply(Ok(doc! { "ok": 1 }));
        session.commit_transaction().await.unwrap_err();
        session.commit_transaction().await.unwrap();

        let sent = connector.sent();
        assert_eq!(sent.len(), 3);
        assert!(!sent[1].1.contains_key("writeConcern"));
        let write_concern = sent[2].1.get_document("writeConcern").unwrap();
        assert_eq!(write_concern.get_str("w").unwrap(), "majority");
        assert_eq!(write_concern.get_i64("wtimeout").unwrap(), 10_000);
    }

    #[tokio::test]
    async fn dirty_sessions_are_discarded_on_check_in() {
        let connector = ScriptedConnector::new();
        let cluster = sharded_cluster(&["a:27017"], &connector, |options| {
            options.retry_writes = Some(false);
        })
        .await;

        connector.push_reply(Err(network_error()));

        let mut session = cluster.start_session(None).await.unwrap();
        let session_id = session.id().clone();
        cluster
            .execute_operation_with_session(insert_op(), &mut session)
            .await
            .unwrap_err();
        assert!(session.is_dirty());

        drop(session);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!cluster.inner.session_pool.contains(&session_id).await);
    }

    #[tokio::test]
    async fn implicit_sessions_are_reused_across_operations() {
        let connector = ScriptedConnector::new();
        let cluster = sharded_cluster(&["a:27017"], &connector, |_| {}).await;

        cluster.execute_operation(find_op()).await.unwrap();
        // The implicit session is returned to the pool from a spawned task once the
        // operation's session handle is dropped.
        tokio::time::sleep(Duration::from_millis(50)).await;
        cluster.execute_operation(find_op()).await.unwrap();

        let sent = connector.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[0].1.get_document("lsid").unwrap(),
            sent[1].1.get_document("lsid").unwrap()
        );
    }

    #[tokio::test]
    async fn connections_for_removed_servers_are_dropped() {
        let connector = ScriptedConnector::new();
        let cluster = sharded_cluster(&["a:27017", "b:27017"], &connector, |_| {}).await;

        let pin_to = |host: &str| {
            let host = host.to_string();
            SelectionCriteria::predicate(move |info| info.address().to_string() == host)
        };
        let pinned_find = |host: &str| {
            Operation::builder()
                .db("db")
                .body(doc! { "find": "coll" })
                .selection_criteria(pin_to(host))
                .build()
        };

        cluster.execute_operation(pinned_find("a:27017")).await.unwrap();
        {
            let pools = cluster.inner.connections.lock().await;
            assert!(pools.contains_key(&ServerAddress::parse("a:27017").unwrap()));
        }

        // An SRV rescan drops a:27017 from the deployment.
        let remaining: HashSet<_> = [ServerAddress::parse("b:27017").unwrap()]
            .into_iter()
            .collect();
        cluster.topology().updater().sync_hosts(remaining).await;

        cluster.execute_operation(pinned_find("b:27017")).await.unwrap();

        let pools = cluster.inner.connections.lock().await;
        assert!(!pools.contains_key(&ServerAddress::parse("a:27017").unwrap()));
        assert_eq!(
            pools
                .get(&ServerAddress::parse("b:27017").unwrap())
                .map(Vec::len),
            Some(1)
        );
    }

    #[tokio::test]
    async fn older_cluster_time_does_not_regress_gossip() {
        let connector = ScriptedConnector::new();
        let cluster = sharded_cluster(&["a:27017"], &connector, |_| {}).await;

        connector.push_reply(Ok(doc! {
            "ok": 1,
            "$clusterTime": {
                "clusterTime": Timestamp { time: 42, increment: 1 },
                "signature": {},
            },
        }));
        connector.push_reply(Ok(doc! {
            "ok": 1,
            "$clusterTime": {
                "clusterTime": Timestamp { time: 40, increment: 5 },
                "signature": {},
            },
        }));

        cluster.execute_operation(find_op()).await.unwrap();
        cluster.execute_operation(find_op()).await.unwrap();
        // The older time reported by the second reply leaves the recorded maximum alone.
        assert_eq!(cluster.cluster_time(), Some(ClusterTime::new(42, 1)));

        cluster.execute_operation(find_op()).await.unwrap();
        let sent = connector.sent();
        let gossiped = sent[2].1.get_document("$clusterTime").unwrap();
        assert_eq!(
            gossiped.get_timestamp("clusterTime").unwrap(),
            Timestamp { time: 42, increment: 1 }
        );
    }

    #[tokio::test]
    async fn cluster_time_gossip_advances_topology() {
        let connector = ScriptedConnector::new();
        let cluster = sharded_cluster(&["a:27017"], &connector, |_| {}).await;

        connector.push_reply(Ok(doc! {
            "ok": 1,
            "$clusterTime": {
                "clusterTime": Timestamp { time: 42, increment: 1 },
                "signature": { "hash": "abc" },
            },
        }));

        cluster.execute_operation(find_op()).await.unwrap();
        assert_eq!(cluster.cluster_time(), Some(ClusterTime::new(42, 1)));

        // Subsequent commands carry the gossiped time back to the server.
        cluster.execute_operation(find_op()).await.unwrap();
        let sent = connector.sent();
        let gossiped = sent[1].1.get_document("$clusterTime").unwrap();
        assert_eq!(
            gossiped.get_timestamp("clusterTime").unwrap(),
            Timestamp { time: 42, increment: 1 }
        );
    }

    #[tokio::test]
    async fn causally_consistent_reads_carry_after_cluster_time() {
        let connector = ScriptedConnector::new();
        let cluster = sharded_cluster(&["a:27017"], &connector, |_| {}).await;

        connector.push_reply(Ok(doc! {
            "ok": 1,
            "operationTime": Timestamp { time: 50, increment: 1 },
        }));

        let mut session = cluster.start_session(None).await.unwrap();
        cluster
            .execute_operation_with_session(find_op(), &mut session)
            .await
            .unwrap();
        assert_eq!(
            session.operation_time(),
            Some(Timestamp { time: 50, increment: 1 })
        );
        cluster
            .execute_operation_with_session(find_op(), &mut session)
            .await
            .unwrap();

        let sent = connector.sent();
        assert!(!sent[0].1.contains_key("readConcern"));
        let read_concern = sent[1].1.get_document("readConcern").unwrap();
        assert_eq!(
            read_concern.get_timestamp("afterClusterTime").unwrap(),
            Timestamp { time: 50, increment: 1 }
        );
    }

    #[tokio::test]
    async fn command_events_share_operation_id_across_attempts() {
        let connector = ScriptedConnector::new();
        let events: Arc<Mutex<Vec<CommandEvent>>> = Arc::default();
        let sink = events.clone();
        let cluster = sharded_cluster(&["a:27017", "b:27017"], &connector, |options| {
            options.command_event_handler = Some(EventHandler::callback(move |event| {
                sink.lock().unwrap().push(event)
            }));
        })
        .await;

        connector.push_reply(Ok(error_reply(
            11600,
            "interrupted at shutdown",
            &["RetryableWriteError"],
        )));
        connector.push_reply(Ok(doc! { "ok": 1, "n": 1 }));

        let mut session = cluster.start_session(None).await.unwrap();
        cluster
            .execute_operation_with_session(insert_op(), &mut session)
            .await
            .unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], CommandEvent::Started(_)));
        assert!(matches!(events[1], CommandEvent::Failed(_)));
        assert!(matches!(events[2], CommandEvent::Started(_)));
        assert!(matches!(events[3], CommandEvent::Succeeded(_)));

        let operation_id = |event: &CommandEvent| match event {
            CommandEvent::Started(e) => e.operation_id,
            CommandEvent::Succeeded(e) => e.operation_id,
            CommandEvent::Failed(e) => e.operation_id,
        };
        assert!(events.iter().all(|e| operation_id(e) == operation_id(&events[0])));
        assert_ne!(events[0].request_id(), events[2].request_id());
    }
}
