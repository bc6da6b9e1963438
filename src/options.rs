//! Connection string parsing and the options consumed by the topology, cluster, and
//! session layers.

use std::{
    collections::HashMap,
    fmt::{self, Display, Formatter, Write},
    str::FromStr,
    time::Duration,
};

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    bson::{doc, Bson, Document},
    error::{Error, ErrorKind, Result},
    event::{CommandEvent, EventHandler, SdamEvent},
    sdam::MIN_HEARTBEAT_FREQUENCY,
    selection_criteria::{ReadPreference, ReadPreferenceOptions, SelectionCriteria, TagSet},
    srv::{OriginalSrvInfo, SrvResolver},
};

pub(crate) const DEFAULT_PORT: u16 = 27017;

/// An address at which a MongoDB server may be reached.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[non_exhaustive]
pub enum ServerAddress {
    /// A TCP/IP host and port.
    Tcp {
        /// The hostname or IP address.
        host: String,

        /// The port. `None` means the default port of 27017.
        port: Option<u16>,
    },
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::Tcp {
            host: "localhost".into(),
            port: None,
        }
    }
}

impl ServerAddress {
    /// Parses an address from a `host` or `host:port` string.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();
        let mut parts = address.split(':');
        let hostname = match parts.next() {
            Some(part) if !part.is_empty() => part,
            _ => {
                return Err(Error::invalid_argument(format!(
                    "invalid server address: \"{}\"",
                    address
                )))
            }
        };

        let port = match parts.next() {
            Some(part) => {
                let port = u16::from_str(part).map_err(|_| {
                    Error::invalid_argument(format!(
                        "port must be an integer between 1 and 65535, got \"{}\"",
                        part
                    ))
                })?;
                if port == 0 {
                    return Err(Error::invalid_argument(format!(
                        "invalid server port: {}",
                        port
                    )));
                }
                if parts.next().is_some() {
                    return Err(Error::invalid_argument(format!(
                        "invalid server address: \"{}\"",
                        address
                    )));
                }
                Some(port)
            }
            None => None,
        };

        Ok(Self::Tcp {
            host: hostname.to_lowercase(),
            port,
        })
    }

    pub(crate) fn host(&self) -> &str {
        match self {
            Self::Tcp { host, .. } => host.as_str(),
        }
    }

    pub(crate) fn port(&self) -> Option<u16> {
        match self {
            Self::Tcp { port, .. } => *port,
        }
    }
}

impl Display for ServerAddress {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => {
                write!(f, "{}:{}", host, port.unwrap_or(DEFAULT_PORT))
            }
        }
    }
}

/// The level of consistency and isolation requested for a read operation.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReadConcernLevel {
    /// The query returns the instance's most recent data.
    Local,

    /// The query returns data acknowledged by a majority of the replica set members.
    Majority,

    /// The query returns data reflecting all successful majority-acknowledged writes that
    /// completed prior to the start of the read.
    Linearizable,

    /// The query returns data with no guarantee that it has been written to a majority of the
    /// members.
    Available,

    /// Used in multi-document transactions.
    Snapshot,

    /// A read concern level not enumerated above.
    Custom(String),
}

impl ReadConcernLevel {
    pub(crate) fn from_str(s: &str) -> Self {
        match s {
            "local" => ReadConcernLevel::Local,
            "majority" => ReadConcernLevel::Majority,
            "linearizable" => ReadConcernLevel::Linearizable,
            "available" => ReadConcernLevel::Available,
            "snapshot" => ReadConcernLevel::Snapshot,
            other => ReadConcernLevel::Custom(other.to_string()),
        }
    }

    pub(crate) fn as_str(&self) -> &str {
        match self {
            ReadConcernLevel::Local => "local",
            ReadConcernLevel::Majority => "majority",
            ReadConcernLevel::Linearizable => "linearizable",
            ReadConcernLevel::Available => "available",
            ReadConcernLevel::Snapshot => "snapshot",
            ReadConcernLevel::Custom(s) => s.as_str(),
        }
    }
}

/// Specifies the consistency and isolation properties of read operations.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct ReadConcern {
    /// The requested level.
    pub level: ReadConcernLevel,
}

impl ReadConcern {
    /// A "majority" read concern.
    pub fn majority() -> Self {
        Self {
            level: ReadConcernLevel::Majority,
        }
    }

    /// A "local" read concern.
    pub fn local() -> Self {
        Self {
            level: ReadConcernLevel::Local,
        }
    }

    /// A "snapshot" read concern.
    pub fn snapshot() -> Self {
        Self {
            level: ReadConcernLevel::Snapshot,
        }
    }

    pub(crate) fn to_document(&self) -> Document {
        doc! { "level": self.level.as_str() }
    }
}

/// The `w` field of a write concern.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Acknowledgment {
    /// Requires acknowledgement that the write has reached the specified number of nodes.
    /// `Nodes(0)` requests no acknowledgment at all.
    Nodes(u32),

    /// Requires acknowledgement that the write has reached a majority of the nodes.
    Majority,

    /// Requires acknowledgement according to the given custom write concern mode.
    Custom(String),
}

impl From<u32> for Acknowledgment {
    fn from(n: u32) -> Self {
        Acknowledgment::Nodes(n)
    }
}

impl Acknowledgment {
    fn to_bson(&self) -> Bson {
        match self {
            Acknowledgment::Nodes(n) => Bson::Int32(*n as i32),
            Acknowledgment::Majority => Bson::String("majority".to_string()),
            Acknowledgment::Custom(s) => Bson::String(s.clone()),
        }
    }
}

/// Specifies the level of acknowledgement requested from the server for write operations.
#[derive(Clone, Debug, Default, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct WriteConcern {
    /// The requested acknowledgment.
    pub w: Option<Acknowledgment>,

    /// How long the server should wait for the write concern to be satisfied before reporting
    /// a write concern error.
    pub w_timeout: Option<Duration>,

    /// Whether the server should wait for the write to be committed to the journal.
    pub journal: Option<bool>,
}

impl WriteConcern {
    /// A write concern requiring acknowledgment from a majority of nodes.
    pub fn majority() -> Self {
        Self {
            w: Some(Acknowledgment::Majority),
            w_timeout: None,
            journal: None,
        }
    }

    /// Whether this write concern requests any acknowledgment from the server. Unacknowledged
    /// writes cannot be retried and cannot be used in transactions.
    pub fn is_acknowledged(&self) -> bool {
        !matches!(self.w, Some(Acknowledgment::Nodes(0)))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.w.is_none() && self.w_timeout.is_none() && self.journal.is_none()
    }

    pub(crate) fn to_document(&self) -> Document {
        let mut doc = Document::new();
        if let Some(ref w) = self.w {
            doc.insert("w", w.to_bson());
        }
        if let Some(w_timeout) = self.w_timeout {
            doc.insert("wtimeout", w_timeout.as_millis() as i64);
        }
        if let Some(journal) = self.journal {
            doc.insert("j", journal);
        }
        doc
    }
}

/// Contains the options that can be used to create a new `ClientSession`.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct SessionOptions {
    /// Whether operations on the session are causally consistent (reads include an
    /// `afterClusterTime`). Defaults to true.
    pub causal_consistency: Option<bool>,

    /// The default options for transactions started on this session.
    pub default_transaction_options: Option<TransactionOptions>,
}

/// Contains the options that can be used for a transaction.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct TransactionOptions {
    /// The read concern used for reads within the transaction.
    pub read_concern: Option<ReadConcern>,

    /// The write concern used when committing or aborting the transaction.
    pub write_concern: Option<WriteConcern>,

    /// The selection criteria used for operations within the transaction.
    pub selection_criteria: Option<SelectionCriteria>,

    /// The maximum amount of time the server should allow commitTransaction to run.
    pub max_commit_time: Option<Duration>,
}

/// Contains the options that determine how a topology is monitored and how operations are
/// routed and retried. Typically constructed by parsing a connection string.
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ClientOptions {
    /// The initial list of seed addresses.
    #[builder(default_code = "vec![ServerAddress::default()]")]
    pub hosts: Vec<ServerAddress>,

    /// The name of the replica set the client should connect to.
    pub repl_set_name: Option<String>,

    /// Whether the client should connect directly to the single specified host rather than
    /// discover the deployment topology.
    pub direct_connection: Option<bool>,

    /// How often monitors probe their server. Must be at least 500ms. Defaults to 10 seconds.
    pub heartbeat_freq: Option<Duration>,

    /// The maximum amount of time to block waiting for a suitable server. Defaults to 30
    /// seconds.
    pub server_selection_timeout: Option<Duration>,

    /// The width of the latency window used to prefer faster servers during selection.
    /// Defaults to 15ms.
    pub local_threshold: Option<Duration>,

    /// The deadline applied to establishing a connection (including the handshake). Defaults
    /// to 10 seconds.
    pub connect_timeout: Option<Duration>,

    /// The deadline applied to each command send/receive.
    pub socket_timeout: Option<Duration>,

    /// Whether eligible writes are retried once after a transient failure. Defaults to true.
    pub retry_writes: Option<bool>,

    /// Whether eligible reads are retried once after a transient failure. Defaults to true.
    pub retry_reads: Option<bool>,

    /// The default criteria for selecting servers for read operations.
    pub selection_criteria: Option<SelectionCriteria>,

    /// The default read concern for operations.
    pub read_concern: Option<ReadConcern>,

    /// The default write concern for operations.
    pub write_concern: Option<WriteConcern>,

    /// A sink for command monitoring events.
    pub command_event_handler: Option<EventHandler<CommandEvent>>,

    /// A sink for SDAM events.
    pub sdam_event_handler: Option<EventHandler<SdamEvent>>,

    /// Set when the options were derived from a `mongodb+srv` connection string.
    #[builder(setter(skip))]
    pub(crate) original_srv_info: Option<OriginalSrvInfo>,

    #[cfg(test)]
    #[builder(setter(skip))]
    pub(crate) test_options: Option<TestOptions>,
}

#[cfg(test)]
#[derive(Clone, Debug, Default)]
pub(crate) struct TestOptions {
    /// Prevents monitor tasks from being spawned, so tests can drive the topology purely
    /// through its updater handle.
    pub(crate) disable_monitoring_threads: bool,

    /// Overrides the minimum heartbeat frequency floor.
    pub(crate) min_heartbeat_freq: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions::builder().build()
    }
}

impl ClientOptions {
    /// Parses a `mongodb://` connection string into options. For `mongodb+srv://` strings use
    /// [`ClientOptions::parse_with_resolver`].
    pub fn parse(uri: impl AsRef<str>) -> Result<Self> {
        let parsed = ConnectionString::parse(uri.as_ref())?;
        if parsed.is_srv {
            return Err(Error::invalid_argument(
                "mongodb+srv connection strings require a DNS resolver; use \
                 ClientOptions::parse_with_resolver",
            ));
        }
        parsed.into_options()
    }

    /// Parses a connection string, performing SRV/TXT lookup through `resolver` if the
    /// `mongodb+srv` scheme is used.
    pub async fn parse_with_resolver(
        uri: impl AsRef<str>,
        resolver: &dyn SrvResolver,
    ) -> Result<Self> {
        let mut parsed = ConnectionString::parse(uri.as_ref())?;
        if parsed.is_srv {
            parsed.resolve_srv(resolver).await?;
        }
        parsed.into_options()
    }

    /// Ensures the configured option combination is coherent. Called at topology creation;
    /// violations are configuration errors and fail fast.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(Error::invalid_argument("at least one seed host is required"));
        }
        if self.direct_connection == Some(true) && self.hosts.len() > 1 {
            return Err(Error::invalid_argument(
                "cannot specify multiple seeds with directConnection=true",
            ));
        }
        if let Some(freq) = self.heartbeat_freq {
            if freq < MIN_HEARTBEAT_FREQUENCY {
                return Err(Error::invalid_argument(format!(
                    "heartbeatFrequencyMS must be at least {}ms, got {}ms",
                    MIN_HEARTBEAT_FREQUENCY.as_millis(),
                    freq.as_millis()
                )));
            }
        }
        if let Some(SelectionCriteria::ReadPreference(ref pref)) = self.selection_criteria {
            if let Some(staleness) = pref.max_staleness() {
                if staleness > Duration::ZERO && staleness < Duration::from_secs(90) {
                    return Err(Error::invalid_argument(
                        "maxStalenessSeconds must be at least 90 seconds",
                    ));
                }
            }
        }
        if let Some(ref wc) = self.write_concern {
            if !wc.is_acknowledged() && self.retry_writes == Some(true) {
                return Err(Error::invalid_argument(
                    "retryWrites=true cannot be combined with an unacknowledged write concern",
                ));
            }
        }
        Ok(())
    }
}

/// The decomposed pieces of a connection string, prior to conversion into `ClientOptions`.
struct ConnectionString {
    is_srv: bool,
    hosts: Vec<ServerAddress>,
    original_hostname: Option<String>,
    options: HashMap<String, String>,
    tag_sets: Vec<TagSet>,
    original_srv_info: Option<OriginalSrvInfo>,
}

impl ConnectionString {
    fn parse(uri: &str) -> Result<Self> {
        let (is_srv, rest) = if let Some(rest) = uri.strip_prefix("mongodb://") {
            (false, rest)
        } else if let Some(rest) = uri.strip_prefix("mongodb+srv://") {
            (true, rest)
        } else {
            return Err(Error::invalid_argument(
                "connection string must begin with mongodb:// or mongodb+srv://",
            ));
        };

        // Credentials and the auth database are outside this crate's scope but tolerated in
        // the string so real-world URIs parse.
        let rest = match rest.rfind('@') {
            Some(idx) => &rest[idx + 1..],
            None => rest,
        };

        let (host_part, options_part) = match rest.find(['/', '?']) {
            Some(idx) if rest.as_bytes()[idx] == b'/' => {
                let (hosts, after) = rest.split_at(idx);
                let after = &after[1..];
                match after.find('?') {
                    Some(q) => (hosts, Some(&after[q + 1..])),
                    None => (hosts, None),
                }
            }
            Some(idx) => (&rest[..idx], Some(&rest[idx + 1..])),
            None => (rest, None),
        };

        if host_part.is_empty() {
            return Err(Error::invalid_argument(
                "connection string contains no host information",
            ));
        }

        let hosts = host_part
            .split(',')
            .map(|h| {
                let decoded = percent_decode_str(h)
                    .decode_utf8()
                    .map_err(|_| Error::invalid_argument(format!("invalid host: \"{}\"", h)))?;
                ServerAddress::parse(decoded.as_ref())
            })
            .collect::<Result<Vec<_>>>()?;

        if is_srv {
            if hosts.len() != 1 {
                return Err(Error::invalid_argument(
                    "exactly one host must be specified with the mongodb+srv scheme",
                ));
            }
            if hosts[0].port().is_some() {
                return Err(Error::invalid_argument(
                    "a port cannot be specified with the mongodb+srv scheme",
                ));
            }
        }

        let mut connection_string = Self {
            is_srv,
            original_hostname: is_srv.then(|| hosts[0].host().to_string()),
            hosts,
            options: HashMap::new(),
            tag_sets: Vec::new(),
            original_srv_info: None,
        };

        if let Some(options_part) = options_part {
            connection_string.parse_options(options_part)?;
        }

        Ok(connection_string)
    }

    fn parse_options(&mut self, options: &str) -> Result<()> {
        if options.is_empty() {
            return Ok(());
        }
        for pair in options.split('&') {
            let mut kv = pair.splitn(2, '=');
            let key = kv
                .next()
                .map(str::to_lowercase)
                .unwrap_or_default();
            let value = match kv.next() {
                Some(v) => percent_decode_str(v)
                    .decode_utf8()
                    .map_err(|_| {
                        Error::invalid_argument(format!("invalid option value: \"{}\"", pair))
                    })?
                    .to_string(),
                None => {
                    return Err(Error::invalid_argument(format!(
                        "connection string option missing a value: \"{}\"",
                        pair
                    )))
                }
            };

            // readPreferenceTags may appear multiple times; each occurrence appends one tag
            // set, in order.
            if key == "readpreferencetags" {
                let mut tag_set = TagSet::new();
                if !value.is_empty() {
                    for tag in value.split(',') {
                        let mut tag_kv = tag.splitn(2, ':');
                        match (tag_kv.next(), tag_kv.next()) {
                            (Some(k), Some(v)) if !k.is_empty() => {
                                tag_set.insert(k.to_string(), v.to_string());
                            }
                            _ => {
                                return Err(Error::invalid_argument(format!(
                                    "invalid readPreferenceTags value: \"{}\"",
                                    value
                                )))
                            }
                        }
                    }
                }
                self.tag_sets.push(tag_set);
            } else {
                self.options.insert(key, value);
            }
        }
        Ok(())
    }

    async fn resolve_srv(&mut self, resolver: &dyn SrvResolver) -> Result<()> {
        let hostname = self.hosts[0].host().to_string();
        let config = crate::srv::resolve_client_config(&hostname, resolver).await?;

        self.hosts = config.hosts;
        self.original_srv_info = Some(OriginalSrvInfo {
            hostname,
            min_ttl: config.min_ttl,
        });

        // TXT options are defaults: an option present in the connection string itself wins.
        for (key, value) in config.txt_options {
            self.options.entry(key).or_insert(value);
        }

        // SRV requires TLS by default in a full driver; the transport seam owns TLS here, so
        // the option is accepted and ignored.
        Ok(())
    }

    fn into_options(mut self) -> Result<ClientOptions> {
        let mut options = ClientOptions::builder().hosts(self.hosts.clone()).build();
        options.original_srv_info = self.original_srv_info.take();

        for (key, value) in &self.options {
            match key.as_str() {
                "replicaset" => options.repl_set_name = Some(value.clone()),
                "directconnection" => {
                    options.direct_connection = Some(parse_bool(key, value)?);
                }
                "heartbeatfrequencyms" => {
                    options.heartbeat_freq = Some(parse_duration_ms(key, value)?);
                }
                "serverselectiontimeoutms" => {
                    options.server_selection_timeout = Some(parse_duration_ms(key, value)?);
                }
                "localthresholdms" => {
                    options.local_threshold = Some(parse_duration_ms(key, value)?);
                }
                "connecttimeoutms" => {
                    options.connect_timeout = Some(parse_duration_ms(key, value)?);
                }
                "sockettimeoutms" => {
                    options.socket_timeout = Some(parse_duration_ms(key, value)?);
                }
                "retrywrites" => options.retry_writes = Some(parse_bool(key, value)?),
                "retryreads" => options.retry_reads = Some(parse_bool(key, value)?),
                "readconcernlevel" => {
                    options.read_concern = Some(ReadConcern {
                        level: ReadConcernLevel::from_str(value),
                    });
                }
                "w" => {
                    let w = match u32::from_str(value) {
                        Ok(n) => Acknowledgment::Nodes(n),
                        Err(_) if value == "majority" => Acknowledgment::Majority,
                        Err(_) => Acknowledgment::Custom(value.clone()),
                    };
                    options.write_concern.get_or_insert_with(Default::default).w = Some(w);
                }
                "wtimeoutms" => {
                    options
                        .write_concern
                        .get_or_insert_with(Default::default)
                        .w_timeout = Some(parse_duration_ms(key, value)?);
                }
                "journal" => {
                    options
                        .write_concern
                        .get_or_insert_with(Default::default)
                        .journal = Some(parse_bool(key, value)?);
                }
                "readpreference" | "maxstalenessseconds" | "tls" | "ssl" | "appname" => {
                    // readpreference and maxstalenessseconds are combined below; tls/ssl
                    // belong to the transport seam; appname has no effect here.
                }
                other => {
                    tracing::warn!(option = other, "ignoring unrecognized connection string option");
                }
            }
        }

        let max_staleness = match self.options.get("maxstalenessseconds") {
            Some(value) => {
                let seconds = i64::from_str(value).map_err(|_| {
                    Error::invalid_argument(format!(
                        "maxStalenessSeconds must be an integer, got \"{}\"",
                        value
                    ))
                })?;
                // -1 means "no max staleness".
                if seconds < 0 {
                    None
                } else {
                    Some(Duration::from_secs(seconds as u64))
                }
            }
            None => None,
        };

        let read_pref_mode = self.options.get("readpreference").map(String::as_str);
        if read_pref_mode.is_some() || !self.tag_sets.is_empty() || max_staleness.is_some() {
            let mode = read_pref_mode.unwrap_or("primary");
            let pref_options = ReadPreferenceOptions {
                tag_sets: (!self.tag_sets.is_empty()).then(|| self.tag_sets.clone()),
                max_staleness,
            };
            let pref = ReadPreference::from_mode(mode, pref_options)?;
            options.selection_criteria = Some(SelectionCriteria::ReadPreference(pref));
        }

        options.validate()?;
        Ok(options)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(Error::invalid_argument(format!(
            "{} must be \"true\" or \"false\", got \"{}\"",
            key, value
        ))),
    }
}

fn parse_duration_ms(key: &str, value: &str) -> Result<Duration> {
    let ms = u64::from_str(value).map_err(|_| {
        Error::invalid_argument(format!(
            "{} must be a nonnegative integer, got \"{}\"",
            key, value
        ))
    })?;
    Ok(Duration::from_millis(ms))
}

/// A serializable view of the options that go into a topology summary, used by error messages
/// and SDAM events.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct HeartbeatInfo {
    pub(crate) frequency_ms: u64,
}

impl fmt::Display for WriteConcern {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_char('{')?;
        if let Some(ref w) = self.w {
            write!(f, " w: {:?}", w)?;
        }
        if let Some(t) = self.w_timeout {
            write!(f, " wtimeout: {}ms", t.as_millis())?;
        }
        if let Some(j) = self.journal {
            write!(f, " j: {}", j)?;
        }
        f.write_str(" }")
    }
}
