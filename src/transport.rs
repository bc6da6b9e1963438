//! The pluggable transport seam and the connection type built on top of it.
//!
//! The wire protocol itself lives behind [`MessageStream`]: a stream accepts a command
//! document and yields the server's reply document. Everything above that (handshakes,
//! deadlines, error classification, generation tracking) is handled here.

use std::{
    sync::atomic::{AtomicI32, Ordering},
    time::{Duration, Instant},
};

use futures_core::future::BoxFuture;
use serde::Deserialize;
use tracing::trace;

use crate::{
    bson::{Bson, Document},
    error::{CommandError, Error, ErrorKind, Result, WriteConcernError},
    hello::{hello_command, AwaitableHelloOptions, HelloCommandResponse, HelloReply},
    options::ServerAddress,
    runtime,
    session::ClusterTime,
};

/// The minimum wire version this library can speak.
pub const DRIVER_MIN_WIRE_VERSION: i32 = 6;

/// The maximum wire version this library can speak.
pub const DRIVER_MAX_WIRE_VERSION: i32 = 17;

static REQUEST_ID: AtomicI32 = AtomicI32::new(0);

/// Returns an id unique to this process for tagging an individual wire request.
pub(crate) fn next_request_id() -> i32 {
    REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

/// A bidirectional, ordered exchange of command documents with a single server.
pub trait MessageStream: Send {
    /// Sends one command document.
    fn write_message<'a>(&'a mut self, message: &'a Document) -> BoxFuture<'a, Result<()>>;

    /// Receives the next reply document.
    fn read_message(&mut self) -> BoxFuture<'_, Result<Document>>;
}

/// Establishes [`MessageStream`]s to servers. Implementations own sockets, TLS, and
/// authentication; this library never sees any of those.
pub trait Connector: Send + Sync {
    /// Opens a new stream to `address`. The returned stream has not been handshaken.
    fn connect<'a>(
        &'a self,
        address: &'a ServerAddress,
    ) -> BoxFuture<'a, Result<Box<dyn MessageStream>>>;
}

/// Hooks for client-side field level encryption. When installed, every outgoing command body
/// passes through `before_send` and every reply through `after_receive`.
pub trait CsfleHooks: Send + Sync {
    /// Transforms an outgoing command, e.g. by encrypting field values.
    fn before_send<'a>(&'a self, db: &'a str, command: Document)
        -> BoxFuture<'a, Result<Document>>;

    /// Transforms an incoming reply, e.g. by decrypting field values.
    fn after_receive<'a>(&'a self, reply: Document) -> BoxFuture<'a, Result<Document>>;
}

/// A handshaken connection to a single server.
pub(crate) struct Connection {
    pub(crate) address: ServerAddress,

    /// The generation of the server's connection state when this connection was established.
    /// Stale generations indicate the connection predates a pool clear.
    pub(crate) generation: u32,

    stream: Box<dyn MessageStream>,

    /// Whether the server accepted `helloOk` during the handshake.
    hello_ok: Option<bool>,

    pub(crate) min_wire_version: Option<i32>,
    pub(crate) max_wire_version: Option<i32>,

    socket_timeout: Option<Duration>,
}

impl Connection {
    pub(crate) fn new(
        address: ServerAddress,
        stream: Box<dyn MessageStream>,
        generation: u32,
        socket_timeout: Option<Duration>,
    ) -> Self {
        Self {
            address,
            generation,
            stream,
            hello_ok: None,
            min_wire_version: None,
            max_wire_version: None,
            socket_timeout,
        }
    }

    /// Runs the initial hello exchange, recording the server's wire version range and whether
    /// it understands the `hello` command name.
    pub(crate) async fn handshake(&mut self) -> Result<HelloReply> {
        let reply = self.send_hello(None).await?;
        self.record_handshake(&reply.command_response);
        Ok(reply)
    }

    /// Sends a hello (or legacy hello) and parses the reply, measuring the round trip.
    pub(crate) async fn send_hello(
        &mut self,
        awaitable_options: Option<AwaitableHelloOptions>,
    ) -> Result<HelloReply> {
        let command = hello_command(self.hello_ok, awaitable_options);
        let start = Instant::now();

        // An awaitable hello legitimately blocks up to maxAwaitTimeMS on the server side, so
        // the read deadline has to account for it on top of the normal timeout.
        let deadline = match (self.socket_timeout, awaitable_options) {
            (Some(timeout), Some(options)) => Some(timeout + options.max_await_time),
            (Some(timeout), None) => Some(timeout),
            (None, _) => None,
        };

        let response = self.exchange(&command, deadline).await?;
        let round_trip_time = start.elapsed();

        let body = CommandBody::parse(&response)?;
        let cluster_time = body.cluster_time.clone();
        body.into_result(&response)?;

        let command_response: HelloCommandResponse =
            crate::bson::from_document(response).map_err(|e| {
                Error::invalid_response(format!("invalid hello reply: {}", e))
            })?;

        if self.hello_ok.is_none() {
            self.hello_ok = Some(command_response.hello_ok == Some(true));
        }

        Ok(HelloReply {
            server_address: self.address.clone(),
            cluster_time,
            command_response,
            round_trip_time,
        })
    }

    /// Sends an application command and returns the reply body, classifying server-side
    /// failures into errors.
    ///
    /// A reply with `ok: 0` becomes a command error carrying any server-provided labels; a
    /// reply with `ok: 1` but a `writeConcernError` becomes a write concern error. The parsed
    /// `$clusterTime`, if any, is returned alongside so callers can advance their gossip even
    /// when the command failed.
    pub(crate) async fn run_command(
        &mut self,
        command: &Document,
    ) -> (Result<Document>, Option<ClusterTime>) {
        let response = match self.exchange(command, self.socket_timeout).await {
            Ok(response) => response,
            Err(e) => return (Err(e), None),
        };

        let body = match CommandBody::parse(&response) {
            Ok(body) => body,
            Err(e) => return (Err(e), None),
        };
        let cluster_time = body.cluster_time.clone();
        let result = body.into_result(&response).map(|()| response);
        (result, cluster_time)
    }

    fn record_handshake(&mut self, response: &HelloCommandResponse) {
        self.min_wire_version = response.min_wire_version;
        self.max_wire_version = response.max_wire_version;
    }

    async fn exchange(
        &mut self,
        command: &Document,
        deadline: Option<Duration>,
    ) -> Result<Document> {
        trace!(address = %self.address, "sending command");
        match deadline {
            Some(deadline) => {
                runtime::timeout(deadline, async {
                    self.stream.write_message(command).await?;
                    self.stream.read_message().await
                })
                .await?
            }
            None => {
                self.stream.write_message(command).await?;
                self.stream.read_message().await
            }
        }
    }
}

/// The fields common to every command reply.
#[derive(Debug, Deserialize)]
struct CommandBody {
    ok: Bson,

    #[serde(rename = "$clusterTime")]
    cluster_time: Option<ClusterTime>,

    #[serde(rename = "writeConcernError")]
    write_concern_error: Option<WriteConcernError>,

    #[serde(rename = "errorLabels", default)]
    error_labels: Vec<String>,
}

impl CommandBody {
    fn parse(response: &Document) -> Result<Self> {
        crate::bson::from_document(response.clone())
            .map_err(|e| Error::invalid_response(format!("invalid command reply: {}", e)))
    }

    fn is_success(&self) -> bool {
        match self.ok {
            Bson::Int32(n) => n == 1,
            Bson::Int64(n) => n == 1,
            Bson::Double(f) => (f - 1.0).abs() < f64::EPSILON,
            _ => false,
        }
    }

    fn into_result(self, response: &Document) -> Result<()> {
        if !self.is_success() {
            let command_error: CommandError = crate::bson::from_document(response.clone())
                .map_err(|e| Error::invalid_response(format!("invalid command error: {}", e)))?;
            let mut error: Error = ErrorKind::Command(command_error).into();
            for label in self.error_labels {
                error = error.with_label(label);
            }
            return Err(error);
        }
        if let Some(write_concern_error) = self.write_concern_error {
            let mut error: Error = ErrorKind::WriteConcern(write_concern_error).into();
            for label in self.error_labels {
                error = error.with_label(label);
            }
            return Err(error);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bson::doc;

    #[test]
    fn ok_field_accepts_numeric_types() {
        for ok in [Bson::Int32(1), Bson::Int64(1), Bson::Double(1.0)] {
            let body = CommandBody::parse(&doc! { "ok": ok }).unwrap();
            assert!(body.is_success());
        }
        let body = CommandBody::parse(&doc! { "ok": 0.0 }).unwrap();
        assert!(!body.is_success());
    }

    #[test]
    fn command_failure_becomes_labeled_error() {
        let response = doc! {
            "ok": 0,
            "code": 11600,
            "codeName": "InterruptedAtShutdown",
            "errmsg": "interrupted at shutdown",
            "errorLabels": ["RetryableWriteError"],
        };
        let body = CommandBody::parse(&response).unwrap();
        let error = body.into_result(&response).unwrap_err();
        assert_eq!(error.code(), Some(11600));
        assert!(error.contains_label(crate::error::RETRYABLE_WRITE_ERROR));
        assert!(error.is_shutting_down());
    }

    #[test]
    fn write_concern_error_is_surfaced() {
        let response = doc! {
            "ok": 1,
            "writeConcernError": {
                "code": 64,
                "codeName": "WriteConcernTimeout",
                "errmsg": "waiting for replication timed out",
            },
        };
        let body = CommandBody::parse(&response).unwrap();
        let error = body.into_result(&response).unwrap_err();
        assert!(matches!(
            error.kind.as_ref(),
            ErrorKind::WriteConcern { .. }
        ));
        assert_eq!(error.code(), Some(64));
    }
}
