//! This crate contains the transport-agnostic core of a MongoDB client: server discovery
//! and monitoring (SDAM), server selection, command execution with retryable reads and
//! writes, and client sessions with multi-document transactions. It uses the [`bson`]
//! crate for BSON support and [`tokio`](https://crates.io/crates/tokio) as its async
//! runtime.
//!
//! Sockets, TLS, authentication, and wire protocol framing are all supplied by the
//! embedding application through the [`Connector`](transport::Connector) and
//! [`MessageStream`](transport::MessageStream) traits. This crate decides *which* server a
//! command goes to and *what* the command carries (sessions, transaction fields, cluster
//! time gossip, read preferences); the transport decides how the bytes get there.
//!
//! # Example Usage
//!
//! ## Connecting to a deployment
//!
//! A [`Cluster`] is created from parsed [`ClientOptions`](options::ClientOptions) and a
//! connector. Creating it starts one monitor task per seed host; the set of monitored
//! servers then tracks the deployment as it is discovered.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use mongo_driver_core::transport::Connector;
//! # async fn run(connector: Arc<dyn Connector>) -> mongo_driver_core::error::Result<()> {
//! use mongo_driver_core::{options::ClientOptions, Cluster};
//!
//! // Parse a connection string into an options struct.
//! let mut options = ClientOptions::parse("mongodb://localhost:27017/?replicaSet=rs0")?;
//!
//! // Manually set an option.
//! options.retry_reads = Some(false);
//!
//! // Get a handle to the deployment.
//! let cluster = Cluster::new(options, connector)?;
//! # Ok(()) }
//! ```
//!
//! ## Executing commands
//!
//! Commands are described by [`Operation`](cluster::Operation) values: a database, a
//! command body, and how the command may be routed and retried. Everything the deployment
//! requires beyond the body itself (`$db`, `lsid`, `$clusterTime`, transaction fields,
//! `$readPreference`) is stamped on during execution.
//!
//! ```no_run
//! # async fn run(cluster: mongo_driver_core::Cluster) -> mongo_driver_core::error::Result<()> {
//! use mongo_driver_core::{
//!     bson::doc,
//!     cluster::{Operation, Retryability},
//! };
//!
//! let operation = Operation::builder()
//!     .db("mydb")
//!     .body(doc! { "insert": "books", "documents": [ { "title": "1984" } ] })
//!     .retryability(Retryability::Write)
//!     .build();
//!
//! // Runs on an implicit session; transient failures are retried once.
//! let reply = cluster.execute_operation(operation).await?;
//! # Ok(()) }
//! ```
//!
//! ## Sessions and transactions
//!
//! ```no_run
//! # async fn run(cluster: mongo_driver_core::Cluster) -> mongo_driver_core::error::Result<()> {
//! use mongo_driver_core::{bson::doc, cluster::Operation};
//!
//! let mut session = cluster.start_session(None).await?;
//! session.start_transaction(None).await?;
//!
//! let operation = Operation::builder()
//!     .db("mydb")
//!     .body(doc! { "insert": "books", "documents": [ { "title": "Animal Farm" } ] })
//!     .build();
//! cluster
//!     .execute_operation_with_session(operation, &mut session)
//!     .await?;
//!
//! session.commit_transaction().await?;
//! # Ok(()) }
//! ```
//!
//! ## Minimum supported Rust version (MSRV)
//!
//! The MSRV for this crate is currently 1.74.0. This will rarely be increased, and if it
//! ever is, it will only happen in a minor or major version release.

#![warn(missing_docs)]
#![cfg_attr(docsrs, warn(rustdoc::missing_crate_level_docs))]

pub use ::bson;

pub mod cluster;
pub mod error;
pub mod event;
mod hello;
pub mod options;
pub(crate) mod runtime;
pub mod sdam;
pub mod selection_criteria;
mod serde_util;
pub mod session;
pub mod srv;
pub mod transport;

pub use crate::{cluster::Cluster, session::ClientSession};
