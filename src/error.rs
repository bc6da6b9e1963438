//! Contains the `Error` and `Result` types used throughout the crate.

use std::{fmt, sync::Arc};

use serde::Deserialize;
use thiserror::Error;

use crate::{bson::Document, options::ServerAddress};

const RECOVERING_CODES: &[i32] = &[11600, 11602, 13436, 189, 91];
const NOT_PRIMARY_CODES: &[i32] = &[10107, 13435, 10058];
const SHUTTING_DOWN_CODES: &[i32] = &[11600, 91];
const RETRYABLE_READ_CODES: &[i32] = &[11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 89, 9001];
const RETRYABLE_WRITE_CODES: &[i32] = &[
    11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 89, 9001, 262,
];

/// Error label attached to errors that indicate the entire transaction can be retried.
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";

/// Error label attached to commit errors for which the outcome of the commit is unknown.
pub const UNKNOWN_TRANSACTION_COMMIT_RESULT: &str = "UnknownTransactionCommitResult";

/// Error label attached to write errors that are safe to retry.
pub const RETRYABLE_WRITE_ERROR: &str = "RetryableWriteError";

/// The result type for all fallible methods in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur while managing topology state or executing commands. The inner
/// [`ErrorKind`] is wrapped in an `Arc` so errors can be cloned into topology descriptions
/// and event payloads.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Arc<ErrorKind>,
    labels: Vec<String>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Arc::new(kind),
            labels: Vec::new(),
        }
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_response(message: impl Into<String>) -> Self {
        ErrorKind::InvalidResponse {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn network_timeout(message: impl Into<String>) -> Self {
        ErrorKind::NetworkTimeout {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn server_selection_timeout(message: String) -> Self {
        ErrorKind::ServerSelection { message }.into()
    }

    pub(crate) fn pool_cleared(address: &ServerAddress) -> Self {
        ErrorKind::ConnectionPoolCleared {
            message: format!(
                "connection pool for {} cleared during operation execution",
                address
            ),
        }
        .into()
    }

    /// The labels attached to this error, either by the server or by the driver itself.
    pub fn labels(&self) -> &[String] {
        match self.kind.as_ref() {
            ErrorKind::Command(ref err) => &err.labels,
            ErrorKind::WriteConcern(ref err) => &err.labels,
            _ => &self.labels,
        }
    }

    /// Whether this error carries the given label.
    pub fn contains_label(&self, label: impl AsRef<str>) -> bool {
        self.labels().iter().any(|l| l == label.as_ref())
    }

    /// Returns this error with the given label attached, preserving any existing labels.
    pub(crate) fn with_label(mut self, label: impl AsRef<str>) -> Self {
        let label = label.as_ref().to_string();
        if self.contains_label(&label) {
            return self;
        }
        match self.kind.as_ref() {
            ErrorKind::Command(err) => {
                let mut err = err.clone();
                err.labels.push(label);
                let mut new = Error::new(ErrorKind::Command(err));
                new.labels = self.labels;
                new
            }
            ErrorKind::WriteConcern(err) => {
                let mut err = err.clone();
                err.labels.push(label);
                let mut new = Error::new(ErrorKind::WriteConcern(err));
                new.labels = self.labels;
                new
            }
            _ => {
                self.labels.push(label);
                self
            }
        }
    }

    /// Whether this error was caused by a failure to send or receive bytes on a connection.
    pub(crate) fn is_network_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Io { .. }
                | ErrorKind::NetworkTimeout { .. }
                | ErrorKind::ConnectionPoolCleared { .. }
        )
    }

    pub(crate) fn is_non_timeout_network_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Io { .. } | ErrorKind::ConnectionPoolCleared { .. }
        )
    }

    pub(crate) fn is_network_timeout(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::NetworkTimeout { .. })
    }

    pub(crate) fn is_command_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Command(_))
    }

    /// The server-reported error code, if any. Write concern errors report the code of the
    /// nested write concern failure.
    pub(crate) fn code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::Command(err) => Some(err.code),
            ErrorKind::WriteConcern(err) => Some(err.code),
            _ => None,
        }
    }

    fn code_and_message(&self) -> Option<(i32, &str)> {
        match self.kind.as_ref() {
            ErrorKind::Command(err) => Some((err.code, err.message.as_str())),
            ErrorKind::WriteConcern(err) => Some((err.code, err.message.as_str())),
            _ => None,
        }
    }

    /// Whether this is a "not primary" error as defined by the SDAM specification.
    pub(crate) fn is_not_primary(&self) -> bool {
        self.code_and_message()
            .map(|(code, msg)| is_not_primary(code, msg))
            .unwrap_or(false)
    }

    /// Whether this is a "node is recovering" error as defined by the SDAM specification.
    pub(crate) fn is_recovering(&self) -> bool {
        self.code_and_message()
            .map(|(code, msg)| is_recovering(code, msg))
            .unwrap_or(false)
    }

    /// Whether this error indicates the server is shutting down.
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.code_and_message()
            .map(|(code, _)| SHUTTING_DOWN_CODES.contains(&code))
            .unwrap_or(false)
    }

    /// Whether this error should cause the affected server to be marked Unknown and its
    /// connections discarded.
    pub(crate) fn is_state_change_error(&self) -> bool {
        self.is_not_primary() || self.is_recovering()
    }

    /// Whether a read operation that encountered this error may be retried.
    pub(crate) fn is_read_retryable(&self) -> bool {
        if self.is_network_error() {
            return true;
        }
        match self.code_and_message() {
            Some((code, message)) => {
                RETRYABLE_READ_CODES.contains(&code)
                    || is_not_primary(code, message)
                    || is_recovering(code, message)
            }
            None => false,
        }
    }

    /// Whether a write operation that encountered this error may be retried. Retryability of
    /// writes is communicated via the RetryableWriteError label, which is attached either by
    /// a 4.4+ server or by [`Error::should_add_retryable_write_label`].
    pub(crate) fn is_write_retryable(&self) -> bool {
        self.contains_label(RETRYABLE_WRITE_ERROR)
    }

    /// Whether the driver should attach the RetryableWriteError label itself. Servers at wire
    /// version 9+ attach the label server-side, so for those only network errors qualify.
    pub(crate) fn should_add_retryable_write_label(&self, max_wire_version: i32) -> bool {
        if max_wire_version >= 9 {
            return self.is_network_error();
        }
        if self.is_network_error() {
            return true;
        }
        match self.code_and_message() {
            Some((code, _)) => RETRYABLE_WRITE_CODES.contains(&code),
            None => false,
        }
    }

    /// Whether a commitTransaction failure with this error has an unknown outcome, per the
    /// transactions specification.
    pub(crate) fn is_unknown_commit_outcome(&self) -> bool {
        if matches!(self.kind.as_ref(), ErrorKind::WriteConcern(ref err)
            if err.code_name == "UnsatisfiableWriteConcern" || err.code_name == "UnknownReplWriteConcern")
        {
            return false;
        }
        self.is_network_error() || self.is_shutting_down() || self.is_write_retryable()
    }

    pub(crate) fn from_io(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::TimedOut {
            Error::network_timeout(err.to_string())
        } else {
            ErrorKind::Io {
                message: err.to_string(),
            }
            .into()
        }
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Error::new(err.into())
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument or option combination was provided. Never retried.
    #[error("invalid argument: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// The deployment is incompatible with this driver's supported wire version range.
    #[error("{message}")]
    #[non_exhaustive]
    IncompatibleServer { message: String },

    /// No server matching the selection criteria could be found within the timeout.
    #[error("{message}")]
    #[non_exhaustive]
    ServerSelection { message: String },

    /// A connection could not be established or a send/receive failed.
    #[error("network error: {message}")]
    #[non_exhaustive]
    Io { message: String },

    /// A network operation exceeded its deadline. Distinguished from [`ErrorKind::Io`] so
    /// callers can branch, but treated identically for SDAM and retry purposes.
    #[error("network timeout: {message}")]
    #[non_exhaustive]
    NetworkTimeout { message: String },

    /// The connection generation for a server was bumped while an operation was using one of
    /// its connections.
    #[error("{message}")]
    #[non_exhaustive]
    ConnectionPoolCleared { message: String },

    /// The server responded to a command with `ok: 0`.
    #[error("command failed: {0}")]
    Command(CommandError),

    /// A write succeeded at the command level but failed to satisfy its write concern.
    #[error("write concern failed: {0}")]
    WriteConcern(WriteConcernError),

    /// A session or transaction was used incorrectly.
    #[error("{message}")]
    #[non_exhaustive]
    Transaction { message: String },

    /// The deployment does not support the attempted operation (e.g. sessions).
    #[error("{message}")]
    #[non_exhaustive]
    SessionsNotSupported { message: String },

    /// SRV or TXT lookup failed or produced an invalid result.
    #[error("DNS resolution failed: {message}")]
    #[non_exhaustive]
    DnsResolve { message: String },

    /// The server sent a reply that could not be decoded or is missing required fields.
    #[error("invalid server response: {message}")]
    #[non_exhaustive]
    InvalidResponse { message: String },

    /// Wrapper around `bson::ser::Error`.
    #[error("{0}")]
    BsonSerialization(#[from] bson::ser::Error),

    /// Wrapper around `bson::de::Error`.
    #[error("{0}")]
    BsonDeserialization(#[from] bson::de::Error),

    /// The client is shutting down.
    #[error("client is shut down")]
    Shutdown,

    #[error("internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },
}

fn is_not_primary(code: i32, message: &str) -> bool {
    if NOT_PRIMARY_CODES.contains(&code) {
        return true;
    }
    if is_recovering(code, message) {
        return false;
    }
    message.contains("not master") || message.contains("not primary")
}

fn is_recovering(code: i32, message: &str) -> bool {
    if RECOVERING_CODES.contains(&code) {
        return true;
    }
    message.contains("not master or secondary")
        || message.contains("node is recovering")
}

/// An error document returned by the server for a failed command.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct CommandError {
    /// Identifies the type of error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default)]
    pub message: String,

    /// The error labels that the server attached.
    #[serde(rename = "errorLabels", default)]
    pub labels: Vec<String>,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}): {}", self.code_name, self.message)
    }
}

/// An error that occurred due to not being able to satisfy a write concern. Not grounds for
/// automatic retry.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct WriteConcernError {
    /// Identifies the type of write concern error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default)]
    pub message: String,

    /// A document identifying the write concern setting related to the error.
    #[serde(rename = "errInfo")]
    pub details: Option<Document>,

    /// The error labels that the server attached.
    #[serde(rename = "errorLabels", default)]
    pub labels: Vec<String>,
}

impl fmt::Display for WriteConcernError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}): {}", self.code_name, self.message)
    }
}
