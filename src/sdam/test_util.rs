//! Helpers for constructing descriptions in tests without any network activity.

use std::{sync::Arc, time::Duration};

use futures_core::future::BoxFuture;

use crate::{
    error::{Error, Result},
    hello::{HelloCommandResponse, HelloReply},
    options::{ClientOptions, ServerAddress, TestOptions},
    sdam::{
        description::{server::ServerDescription, topology::TopologyDescription},
        topology::Topology,
    },
    transport::{Connector, MessageStream},
};

pub(crate) fn hello_reply(
    address: &ServerAddress,
    customize: impl FnOnce(&mut HelloCommandResponse),
) -> HelloReply {
    let mut response = HelloCommandResponse {
        is_writable_primary: Some(true),
        min_wire_version: Some(6),
        max_wire_version: Some(17),
        logical_session_timeout_minutes: Some(30),
        ..Default::default()
    };
    customize(&mut response);
    HelloReply {
        server_address: address.clone(),
        command_response: response,
        cluster_time: None,
        round_trip_time: Duration::from_millis(10),
    }
}

pub(crate) fn probed_server(
    address: &str,
    customize: impl FnOnce(&mut HelloCommandResponse),
) -> ServerDescription {
    let address = ServerAddress::parse(address).unwrap();
    let reply = hello_reply(&address, customize);
    ServerDescription::new_from_hello_reply(address, reply)
}

pub(crate) fn rs_primary(address: &str, set_name: &str, hosts: &[&str]) -> ServerDescription {
    let me = address.to_string();
    let set_name = set_name.to_string();
    let hosts: Vec<String> = hosts.iter().map(|h| h.to_string()).collect();
    probed_server(address, move |response| {
        response.set_name = Some(set_name);
        response.is_writable_primary = Some(true);
        response.hosts = Some(hosts);
        response.me = Some(me);
    })
}

pub(crate) fn rs_secondary(address: &str, set_name: &str, hosts: &[&str]) -> ServerDescription {
    let me = address.to_string();
    let set_name = set_name.to_string();
    let hosts: Vec<String> = hosts.iter().map(|h| h.to_string()).collect();
    probed_server(address, move |response| {
        response.set_name = Some(set_name);
        response.is_writable_primary = None;
        response.secondary = Some(true);
        response.hosts = Some(hosts);
        response.me = Some(me);
    })
}

pub(crate) fn mongos(address: &str) -> ServerDescription {
    probed_server(address, |response| {
        response.msg = Some("isdbgrid".to_string());
    })
}

pub(crate) fn standalone(address: &str) -> ServerDescription {
    probed_server(address, |_| {})
}

pub(crate) fn options_with_hosts(hosts: &[&str]) -> ClientOptions {
    ClientOptions::builder()
        .hosts(
            hosts
                .iter()
                .map(|h| ServerAddress::parse(h).unwrap())
                .collect::<Vec<_>>(),
        )
        .build()
}

pub(crate) fn topology_with_hosts(hosts: &[&str]) -> TopologyDescription {
    TopologyDescription::new(&options_with_hosts(hosts)).unwrap()
}

/// A connector that refuses every connection attempt. Suitable for tests that drive the
/// topology through its updater handle rather than over the wire.
struct NoOpConnector;

impl Connector for NoOpConnector {
    fn connect<'a>(
        &'a self,
        address: &'a ServerAddress,
    ) -> BoxFuture<'a, Result<Box<dyn MessageStream>>> {
        Box::pin(async move {
            Err(Error::internal(format!(
                "no connections available to {} in this test",
                address
            )))
        })
    }
}

pub(crate) fn no_op_connector() -> Arc<dyn Connector> {
    Arc::new(NoOpConnector)
}

/// A live topology with monitoring disabled, to be driven via [`Topology::updater`].
pub(crate) fn test_topology(
    hosts: &[&str],
    customize: impl FnOnce(&mut ClientOptions),
) -> Topology {
    let mut options = options_with_hosts(hosts);
    options.test_options = Some(TestOptions {
        disable_monitoring_threads: true,
        ..Default::default()
    });
    customize(&mut options);
    Topology::new(options, no_op_connector()).unwrap()
}
