//! Client sessions: causal-consistency bookkeeping, the server session pool, and the
//! transaction state machine.

mod cluster_time;
mod pool;

use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::{
    bson::{doc, spec::BinarySubtype, Binary, Bson, Document, Timestamp},
    cluster::Cluster,
    error::{ErrorKind, Result, UNKNOWN_TRANSACTION_COMMIT_RESULT},
    options::{Acknowledgment, SessionOptions, TransactionOptions, WriteConcern},
    runtime,
    sdam::TransactionSupportStatus,
    selection_criteria::{ReadPreference, SelectionCriteria},
};

pub use cluster_time::ClusterTime;
pub(crate) use pool::ServerSessionPool;

/// The write concern timeout applied to commit retries that don't specify one themselves.
const DEFAULT_COMMIT_RETRY_W_TIMEOUT: Duration = Duration::from_secs(10);

/// A logical session, used to order a sequence of sequential operations and to scope
/// transactions. Created via [`Cluster::start_session`](crate::cluster::Cluster::start_session).
///
/// Sessions are not meant to be shared across threads; each is used by one operation at a
/// time.
#[derive(Debug)]
pub struct ClientSession {
    cluster: Cluster,
    server_session: ServerSession,
    cluster_time: Option<ClusterTime>,
    operation_time: Option<Timestamp>,
    options: Option<SessionOptions>,
    is_implicit: bool,
    pub(crate) transaction: Transaction,
}

/// The in-flight transaction bookkeeping for a session.
#[derive(Clone, Debug, Default)]
pub(crate) struct Transaction {
    pub(crate) state: TransactionState,
    pub(crate) options: Option<TransactionOptions>,
    pub(crate) recovery_token: Option<Document>,
}

impl Transaction {
    fn start(&mut self, options: Option<TransactionOptions>) {
        self.state = TransactionState::Starting;
        self.options = options;
        self.recovery_token = None;
    }
}

/// The state of a session's transaction.
///
/// `Ending` is the transient state entered once a commit or abort has been issued but its
/// outcome is not yet settled; a commit that fails leaves the transaction in `Ending` so the
/// application can retry the commit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum TransactionState {
    #[default]
    None,
    Starting,
    InProgress,
    Ending,
    Committed,
    /// The transaction committed without ever sending an operation, so no
    /// `commitTransaction` was run.
    CommittedEmpty,
    Aborted,
}

impl ClientSession {
    pub(crate) fn new(
        server_session: ServerSession,
        cluster: Cluster,
        options: Option<SessionOptions>,
        is_implicit: bool,
    ) -> Self {
        Self {
            cluster,
            server_session,
            cluster_time: None,
            operation_time: None,
            options,
            is_implicit,
            transaction: Transaction::default(),
        }
    }

    /// The id of this session.
    pub fn id(&self) -> &Document {
        &self.server_session.id
    }

    pub(crate) fn is_implicit(&self) -> bool {
        self.is_implicit
    }

    /// The options this session was created with.
    pub fn options(&self) -> Option<&SessionOptions> {
        self.options.as_ref()
    }

    /// The highest cluster time this session has seen so far, if any.
    pub fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    /// The highest operation time this session has seen so far, if any.
    pub fn operation_time(&self) -> Option<Timestamp> {
        self.operation_time
    }

    /// Whether read operations on this session should carry an `afterClusterTime`.
    pub(crate) fn causal_consistency(&self) -> bool {
        self.options
            .as_ref()
            .and_then(|options| options.causal_consistency)
            .unwrap_or(true)
    }

    /// Advances this session's cluster time if `to` is greater than the current one.
    pub fn advance_cluster_time(&mut self, to: &ClusterTime) {
        if self.cluster_time().map(|ct| ct < to).unwrap_or(true) {
            self.cluster_time = Some(to.clone());
        }
    }

    /// Advances this session's operation time if `to` is greater than the current one.
    pub fn advance_operation_time(&mut self, to: Timestamp) {
        let newer = self
            .operation_time
            .map(|current| (current.time, current.increment) < (to.time, to.increment))
            .unwrap_or(true);
        if newer {
            self.operation_time = Some(to);
        }
    }

    /// Marks the underlying server session as dirty so it is discarded rather than re-pooled.
    pub(crate) fn mark_dirty(&mut self) {
        self.server_session.dirty = true;
    }

    pub(crate) fn update_last_use(&mut self) {
        self.server_session.last_use = Instant::now();
    }

    pub(crate) fn txn_number(&self) -> i64 {
        self.server_session.txn_number
    }

    pub(crate) fn get_and_increment_txn_number(&mut self) -> i64 {
        self.server_session.txn_number += 1;
        self.server_session.txn_number
    }

    #[cfg(test)]
    pub(crate) fn is_dirty(&self) -> bool {
        self.server_session.dirty
    }

    pub(crate) fn in_transaction(&self) -> bool {
        matches!(
            self.transaction.state,
            TransactionState::Starting | TransactionState::InProgress
        )
    }

    /// Starts a transaction on this session, using `options` merged over the session's
    /// default transaction options. Every operation that should run inside the transaction
    /// must be passed this session.
    pub async fn start_transaction(
        &mut self,
        options: impl Into<Option<TransactionOptions>>,
    ) -> Result<()> {
        match self.transaction.state {
            TransactionState::Starting
            | TransactionState::InProgress
            | TransactionState::Ending => {
                return Err(ErrorKind::Transaction {
                    message: "transaction already in progress".into(),
                }
                .into());
            }
            _ => {}
        }

        match self.cluster.transaction_support_status().await? {
            TransactionSupportStatus::Supported => {}
            _ => {
                return Err(ErrorKind::Transaction {
                    message: "transactions are not supported by this deployment".into(),
                }
                .into())
            }
        }

        let options = self.merged_transaction_options(options.into());
        if let Some(ref options) = options {
            if !options
                .write_concern
                .as_ref()
                .map(|wc| wc.is_acknowledged())
                .unwrap_or(true)
            {
                return Err(ErrorKind::Transaction {
                    message: "transactions do not support unacknowledged write concerns".into(),
                }
                .into());
            }
        }

        self.server_session.txn_number += 1;
        self.transaction.start(options);
        Ok(())
    }

    /// Commits the active transaction.
    ///
    /// If a commit attempt fails with an error labeled `UnknownTransactionCommitResult`, it
    /// is safe to call this again; the retry upgrades the write concern to majority.
    pub async fn commit_transaction(&mut self) -> Result<()> {
        match self.transaction.state {
            TransactionState::None
            | TransactionState::Committed
            | TransactionState::CommittedEmpty => Err(ErrorKind::Transaction {
                message: "no transaction in progress".into(),
            }
            .into()),
            TransactionState::Aborted => Err(ErrorKind::Transaction {
                message: "cannot call commitTransaction after calling abortTransaction".into(),
            }
            .into()),
            TransactionState::Starting => {
                // No operation ever ran, so there is nothing to commit server-side.
                self.transaction.state = TransactionState::CommittedEmpty;
                Ok(())
            }
            TransactionState::InProgress => self.run_commit(false).await,
            TransactionState::Ending => self.run_commit(true).await,
        }
    }

    async fn run_commit(&mut self, retrying: bool) -> Result<()> {
        self.transaction.state = TransactionState::Ending;
        let command = self.commit_command(retrying);
        let criteria = self.transaction_selection_criteria();
        let cluster = self.cluster.clone();

        match cluster.execute_transaction_command(command, criteria, self).await {
            Ok(_) => {
                self.transaction.state = TransactionState::Committed;
                Ok(())
            }
            Err(error) => {
                let error = if error.is_unknown_commit_outcome() {
                    error.with_label(UNKNOWN_TRANSACTION_COMMIT_RESULT)
                } else {
                    error
                };
                Err(error)
            }
        }
    }

    /// Aborts the active transaction. Errors encountered while running the server-side abort
    /// are swallowed; the transaction is considered aborted regardless.
    pub async fn abort_transaction(&mut self) -> Result<()> {
        match self.transaction.state {
            TransactionState::None => Err(ErrorKind::Transaction {
                message: "no transaction in progress".into(),
            }
            .into()),
            TransactionState::Committed
            | TransactionState::CommittedEmpty
            | TransactionState::Ending => Err(ErrorKind::Transaction {
                message: "cannot call abortTransaction after calling commitTransaction".into(),
            }
            .into()),
            TransactionState::Aborted => Err(ErrorKind::Transaction {
                message: "cannot call abortTransaction twice".into(),
            }
            .into()),
            TransactionState::Starting => {
                self.transaction.state = TransactionState::Aborted;
                Ok(())
            }
            TransactionState::InProgress => {
                let command = self.abort_command();
                let criteria = self.transaction_selection_criteria();
                self.transaction.state = TransactionState::Ending;
                let cluster = self.cluster.clone();
                let _ = cluster
                    .execute_transaction_command(command, criteria, self)
                    .await;
                self.transaction.state = TransactionState::Aborted;
                Ok(())
            }
        }
    }

    fn merged_transaction_options(
        &self,
        options: Option<TransactionOptions>,
    ) -> Option<TransactionOptions> {
        let defaults = self
            .options
            .as_ref()
            .and_then(|options| options.default_transaction_options.as_ref());
        match (options, defaults) {
            (Some(mut options), Some(defaults)) => {
                if options.read_concern.is_none() {
                    options.read_concern = defaults.read_concern.clone();
                }
                if options.write_concern.is_none() {
                    options.write_concern = defaults.write_concern.clone();
                }
                if options.selection_criteria.is_none() {
                    options.selection_criteria = defaults.selection_criteria.clone();
                }
                if options.max_commit_time.is_none() {
                    options.max_commit_time = defaults.max_commit_time;
                }
                Some(options)
            }
            (Some(options), None) => Some(options),
            (None, defaults) => defaults.cloned(),
        }
    }

    pub(crate) fn transaction_selection_criteria(&self) -> SelectionCriteria {
        self.transaction
            .options
            .as_ref()
            .and_then(|options| options.selection_criteria.clone())
            .unwrap_or(SelectionCriteria::ReadPreference(ReadPreference::Primary))
    }

    fn commit_command(&self, retrying: bool) -> Document {
        let mut write_concern = self
            .transaction
            .options
            .as_ref()
            .and_then(|options| options.write_concern.clone())
            .unwrap_or_default();
        if retrying {
            write_concern.w = Some(Acknowledgment::Majority);
            if write_concern.w_timeout.is_none() {
                write_concern.w_timeout = Some(DEFAULT_COMMIT_RETRY_W_TIMEOUT);
            }
        }

        let mut command = doc! { "commitTransaction": 1 };
        if let Some(max_commit_time) = self
            .transaction
            .options
            .as_ref()
            .and_then(|options| options.max_commit_time)
        {
            command.insert("maxTimeMS", max_commit_time.as_millis() as i64);
        }
        if let Some(ref recovery_token) = self.transaction.recovery_token {
            command.insert("recoveryToken", recovery_token.clone());
        }
        if !write_concern.is_empty() {
            command.insert("writeConcern", write_concern.to_document());
        }
        command
    }

    fn abort_command(&self) -> Document {
        let mut command = doc! { "abortTransaction": 1 };
        if let Some(write_concern) = self
            .transaction
            .options
            .as_ref()
            .and_then(|options| options.write_concern.as_ref())
        {
            if !write_concern.is_empty() {
                command.insert("writeConcern", write_concern.to_document());
            }
        }
        if let Some(ref recovery_token) = self.transaction.recovery_token {
            command.insert("recoveryToken", recovery_token.clone());
        }
        command
    }
}

/// A session with an in-progress transaction that was dropped without committing or
/// aborting; rebuilt inside the spawned cleanup task so the abort can run there.
struct DroppedClientSession {
    cluster: Cluster,
    server_session: ServerSession,
    cluster_time: Option<ClusterTime>,
    operation_time: Option<Timestamp>,
    options: Option<SessionOptions>,
    is_implicit: bool,
    transaction: Transaction,
}

impl From<DroppedClientSession> for ClientSession {
    fn from(dropped: DroppedClientSession) -> Self {
        Self {
            cluster: dropped.cluster,
            server_session: dropped.server_session,
            cluster_time: dropped.cluster_time,
            operation_time: dropped.operation_time,
            options: dropped.options,
            is_implicit: dropped.is_implicit,
            transaction: dropped.transaction,
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if self.transaction.state == TransactionState::InProgress {
            let dropped_session = DroppedClientSession {
                cluster: self.cluster.clone(),
                server_session: self.server_session.clone(),
                cluster_time: self.cluster_time.clone(),
                operation_time: self.operation_time,
                options: self.options.clone(),
                is_implicit: self.is_implicit,
                transaction: self.transaction.clone(),
            };
            runtime::spawn(async move {
                let mut session: ClientSession = dropped_session.into();
                let _ = session.abort_transaction().await;
            });
        } else {
            let cluster = self.cluster.clone();
            let server_session = self.server_session.clone();
            runtime::spawn(async move {
                cluster.check_in_server_session(server_session).await;
            });
        }
    }
}

/// The pooled, server-side half of a session. May back multiple consecutive
/// [`ClientSession`]s over its lifetime.
#[derive(Clone, Debug)]
pub(crate) struct ServerSession {
    /// The session document containing the client-generated lsid.
    pub(crate) id: Document,

    /// The last time an operation was executed with this session.
    last_use: Instant,

    /// Whether a network error was encountered while using this session.
    dirty: bool,

    /// A monotonically increasing transaction number.
    txn_number: i64,
}

impl ServerSession {
    fn new() -> Self {
        let binary = Bson::Binary(Binary {
            subtype: BinarySubtype::Uuid,
            bytes: Uuid::new_v4().as_bytes().to_vec(),
        });

        Self {
            id: doc! { "id": binary },
            last_use: Instant::now(),
            dirty: false,
            txn_number: 0,
        }
    }

    /// Whether this session will expire within the next minute. A session whose timeout is
    /// unknown is assumed not to expire.
    fn is_about_to_expire(&self, logical_session_timeout: Option<Duration>) -> bool {
        match logical_session_timeout {
            Some(timeout) => {
                let expiration_date = self.last_use + timeout;
                expiration_date < Instant::now() + Duration::from_secs(60)
            }
            None => false,
        }
    }
}
