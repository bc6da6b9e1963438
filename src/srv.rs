//! `mongodb+srv` seed-list discovery behind a pluggable DNS seam.

use std::{cmp, collections::HashMap, time::Duration};

use futures_core::future::BoxFuture;

use crate::{
    error::{ErrorKind, Result},
    options::ServerAddress,
};

/// A single SRV record from a lookup.
#[derive(Debug, Clone)]
pub struct SrvRecord {
    /// The target hostname. A trailing dot is tolerated.
    pub target: String,
    /// The target port.
    pub port: u16,
    /// The record's time-to-live in seconds.
    pub ttl: u32,
}

/// Performs the DNS lookups required by the `mongodb+srv` scheme. Implementations own the
/// actual resolver; this library only interprets the results.
pub trait SrvResolver: Send + Sync {
    /// Looks up the SRV records for the given fully-qualified name
    /// (`_mongodb._tcp.<hostname>`).
    fn srv_lookup<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<SrvRecord>>>;

    /// Looks up the TXT records for the given hostname. Each record is returned as its joined
    /// character-string data.
    fn txt_lookup<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<String>>>;
}

/// The outcome of resolving a `mongodb+srv` hostname.
#[derive(Debug)]
pub(crate) struct ResolvedConfig {
    pub(crate) hosts: Vec<ServerAddress>,
    pub(crate) min_ttl: Duration,
    pub(crate) txt_options: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub(crate) struct LookupHosts {
    pub(crate) hosts: Vec<ServerAddress>,
    pub(crate) min_ttl: Duration,
}

/// The hostname a topology was originally resolved from, retained so the seed list can be
/// re-polled.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct OriginalSrvInfo {
    pub(crate) hostname: String,
    pub(crate) min_ttl: Duration,
}

/// How to treat an SRV result that falls outside the queried domain.
pub(crate) enum DomainMismatch {
    /// Fail the whole lookup. Used for the initial seed list.
    Error,
    /// Drop the record and keep the rest. Used when re-polling.
    Skip,
}

/// Full resolution for a new client: SRV records for the seed list plus TXT records for
/// default options.
pub(crate) async fn resolve_client_config(
    hostname: &str,
    resolver: &dyn SrvResolver,
) -> Result<ResolvedConfig> {
    let lookup = lookup_hosts(hostname, resolver, DomainMismatch::Error).await?;
    let txt_options = lookup_txt_options(hostname, resolver).await?;
    Ok(ResolvedConfig {
        hosts: lookup.hosts,
        min_ttl: lookup.min_ttl,
        txt_options,
    })
}

/// Looks up and validates the SRV records for `original_hostname`.
pub(crate) async fn lookup_hosts(
    original_hostname: &str,
    resolver: &dyn SrvResolver,
    mismatch: DomainMismatch,
) -> Result<LookupHosts> {
    let hostname_parts: Vec<_> = original_hostname.split('.').collect();
    if hostname_parts.len() < 3 {
        return Err(ErrorKind::InvalidArgument {
            message: "a 'mongodb+srv' hostname must have at least three '.'-delimited parts"
                .into(),
        }
        .into());
    }
    let domain_name = &hostname_parts[1..];

    let lookup_hostname = format!("_mongodb._tcp.{}", original_hostname);
    let records = resolver.srv_lookup(&lookup_hostname).await?;

    let mut hosts = Vec::new();
    let mut min_ttl = u32::MAX;

    for record in records {
        let mut target_parts: Vec<_> = record.target.split('.').collect();

        // Remove the empty final section left by a trailing dot.
        if target_parts.last().map(|s| s.is_empty()).unwrap_or(false) {
            target_parts.pop();
        }

        // Every returned host must be a subdomain of the queried domain; anything else could
        // redirect the client outside the deployment's DNS zone.
        if !target_parts[1..].ends_with(domain_name) {
            let message = format!(
                "SRV lookup for {} returned result {}, which does not match domain name {}",
                original_hostname,
                record.target,
                domain_name.join(".")
            );
            match mismatch {
                DomainMismatch::Error => {
                    return Err(ErrorKind::DnsResolve { message }.into());
                }
                DomainMismatch::Skip => {
                    tracing::warn!(message);
                    continue;
                }
            }
        }

        min_ttl = cmp::min(min_ttl, record.ttl);
        hosts.push(ServerAddress::Tcp {
            host: target_parts.join(".").to_lowercase(),
            port: Some(record.port),
        });
    }

    if hosts.is_empty() {
        return Err(ErrorKind::DnsResolve {
            message: format!("SRV lookup for {} returned no records", original_hostname),
        }
        .into());
    }

    Ok(LookupHosts {
        hosts,
        min_ttl: Duration::from_secs(min_ttl.into()),
    })
}

/// Looks up the TXT options for `hostname`. At most one TXT record is allowed, and only the
/// `replicaSet`, `authSource`, and `loadBalanced` keys may appear in it.
async fn lookup_txt_options(
    hostname: &str,
    resolver: &dyn SrvResolver,
) -> Result<HashMap<String, String>> {
    let mut records = resolver.txt_lookup(hostname).await?.into_iter();

    let record = match records.next() {
        Some(record) => record,
        None => return Ok(HashMap::new()),
    };

    if records.next().is_some() {
        return Err(ErrorKind::DnsResolve {
            message: format!(
                "TXT lookup for {} returned more than one record, but more than one are not \
                 allowed with 'mongodb+srv'",
                hostname,
            ),
        }
        .into());
    }

    let mut options = HashMap::new();
    for option_pair in record.split('&') {
        let parts: Vec<_> = option_pair.split('=').collect();
        if parts.len() != 2 {
            return Err(ErrorKind::DnsResolve {
                message: format!(
                    "TXT record string '{}' is not a valid `key=value` option pair",
                    option_pair
                ),
            }
            .into());
        }
        let key = parts[0].to_lowercase();
        match key.as_str() {
            "replicaset" | "authsource" | "loadbalanced" => {
                options.insert(key, parts[1].to_string());
            }
            other => {
                return Err(ErrorKind::DnsResolve {
                    message: format!(
                        "TXT record option '{}' was returned, but only 'authSource', \
                         'replicaSet', and 'loadBalanced' are allowed",
                        other
                    ),
                }
                .into())
            }
        }
    }

    Ok(options)
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use std::sync::Mutex;

    /// A canned resolver for tests.
    pub(crate) struct StaticResolver {
        pub(crate) srv: Mutex<Result<Vec<SrvRecord>>>,
        pub(crate) txt: Mutex<Result<Vec<String>>>,
    }

    impl StaticResolver {
        pub(crate) fn new(srv: Vec<SrvRecord>, txt: Vec<String>) -> Self {
            Self {
                srv: Mutex::new(Ok(srv)),
                txt: Mutex::new(Ok(txt)),
            }
        }
    }

    impl SrvResolver for StaticResolver {
        fn srv_lookup<'a>(&'a self, _name: &'a str) -> BoxFuture<'a, Result<Vec<SrvRecord>>> {
            Box::pin(async move {
                self.srv
                    .lock()
                    .unwrap()
                    .as_ref()
                    .map(Clone::clone)
                    .map_err(Clone::clone)
            })
        }

        fn txt_lookup<'a>(&'a self, _name: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
            Box::pin(async move {
                self.txt
                    .lock()
                    .unwrap()
                    .as_ref()
                    .map(Clone::clone)
                    .map_err(Clone::clone)
            })
        }
    }

    fn record(target: &str, port: u16, ttl: u32) -> SrvRecord {
        SrvRecord {
            target: target.to_string(),
            port,
            ttl,
        }
    }

    #[tokio::test]
    async fn resolves_hosts_and_min_ttl() {
        let resolver = StaticResolver::new(
            vec![
                record("a.cluster0.example.com.", 27017, 60),
                record("b.cluster0.example.com", 27018, 30),
            ],
            vec![],
        );
        let config = resolve_client_config("cluster0.example.com", &resolver)
            .await
            .unwrap();
        assert_eq!(config.min_ttl, Duration::from_secs(30));
        assert_eq!(
            config.hosts,
            vec![
                ServerAddress::Tcp {
                    host: "a.cluster0.example.com".into(),
                    port: Some(27017)
                },
                ServerAddress::Tcp {
                    host: "b.cluster0.example.com".into(),
                    port: Some(27018)
                },
            ]
        );
    }

    #[tokio::test]
    async fn initial_lookup_rejects_out_of_domain_hosts() {
        let resolver = StaticResolver::new(vec![record("evil.other.org", 27017, 60)], vec![]);
        let err = resolve_client_config("cluster0.example.com", &resolver)
            .await
            .unwrap_err();
        assert!(matches!(err.kind.as_ref(), ErrorKind::DnsResolve { .. }));
    }

    #[tokio::test]
    async fn polling_lookup_skips_out_of_domain_hosts() {
        let resolver = StaticResolver::new(
            vec![
                record("evil.other.org", 27017, 60),
                record("a.cluster0.example.com", 27017, 60),
            ],
            vec![],
        );
        let lookup = lookup_hosts("cluster0.example.com", &resolver, DomainMismatch::Skip)
            .await
            .unwrap();
        assert_eq!(lookup.hosts.len(), 1);
    }

    #[tokio::test]
    async fn multiple_txt_records_are_rejected() {
        let resolver = StaticResolver::new(
            vec![record("a.cluster0.example.com", 27017, 60)],
            vec!["replicaSet=rs0".into(), "authSource=admin".into()],
        );
        let err = resolve_client_config("cluster0.example.com", &resolver)
            .await
            .unwrap_err();
        assert!(matches!(err.kind.as_ref(), ErrorKind::DnsResolve { .. }));
    }

    #[tokio::test]
    async fn unknown_txt_option_is_rejected() {
        let resolver = StaticResolver::new(
            vec![record("a.cluster0.example.com", 27017, 60)],
            vec!["heartbeatFrequencyMS=500".into()],
        );
        let err = resolve_client_config("cluster0.example.com", &resolver)
            .await
            .unwrap_err();
        assert!(matches!(err.kind.as_ref(), ErrorKind::DnsResolve { .. }));
    }

    #[tokio::test]
    async fn short_hostname_rejected() {
        let resolver = StaticResolver::new(vec![], vec![]);
        let err = resolve_client_config("localhost", &resolver).await.unwrap_err();
        assert!(matches!(
            err.kind.as_ref(),
            ErrorKind::InvalidArgument { .. }
        ));
    }
}
