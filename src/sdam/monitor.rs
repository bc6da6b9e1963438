use std::{sync::Arc, time::{Duration, Instant}};

use crate::{
    error::{Error, Result},
    event::{
        SdamEvent,
        ServerHeartbeatFailedEvent,
        ServerHeartbeatStartedEvent,
        ServerHeartbeatSucceededEvent,
    },
    hello::{AwaitableHelloOptions, HelloReply, TopologyVersion},
    options::{ClientOptions, ServerAddress},
    runtime,
    sdam::{
        description::{
            server::ServerDescription,
            topology::DEFAULT_HEARTBEAT_FREQUENCY,
        },
        topology::{TopologyUpdateRequestReceiver, TopologyUpdater, TopologyWatcher},
    },
    transport::{Connection, Connector},
};

pub(crate) const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);

/// Periodically checks a single server with hello commands over a dedicated connection,
/// feeding the resulting descriptions into the topology.
pub(crate) struct Monitor {
    address: ServerAddress,
    connection: Option<Connection>,

    /// The most recently seen topology version. Its presence indicates the server supports
    /// awaitable hellos, in which case checks stream rather than poll.
    topology_version: Option<TopologyVersion>,

    connector: Arc<dyn Connector>,
    updater: TopologyUpdater,
    topology_watcher: TopologyWatcher,
    request_receiver: TopologyUpdateRequestReceiver,
    client_options: ClientOptions,
}

impl Monitor {
    pub(crate) fn start(
        address: ServerAddress,
        updater: TopologyUpdater,
        topology_watcher: TopologyWatcher,
        request_receiver: TopologyUpdateRequestReceiver,
        connector: Arc<dyn Connector>,
        client_options: ClientOptions,
    ) {
        let monitor = Monitor {
            address,
            connection: None,
            topology_version: None,
            connector,
            updater,
            topology_watcher,
            request_receiver,
            client_options,
        };
        runtime::spawn(monitor.execute());
    }

    async fn execute(mut self) {
        let heartbeat_frequency = self
            .client_options
            .heartbeat_freq
            .unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY);

        while self.is_alive() {
            let check_succeeded = self.check_server().await;

            // Scan requests that arrived while the check was in flight are satisfied by it.
            self.request_receiver.clear_update_requests();

            // A server that reports a topology version supports awaitable hellos: the next
            // check blocks server-side until something changes, so loop right back into it.
            if self.topology_version.is_some() && check_succeeded && self.is_alive() {
                continue;
            }

            #[cfg(test)]
            let min_frequency = self
                .client_options
                .test_options
                .as_ref()
                .and_then(|to| to.min_heartbeat_freq)
                .unwrap_or(MIN_HEARTBEAT_FREQUENCY);

            #[cfg(not(test))]
            let min_frequency = MIN_HEARTBEAT_FREQUENCY;

            runtime::delay_for(min_frequency).await;
            self.request_receiver
                .wait_for_update_request(heartbeat_frequency.saturating_sub(min_frequency))
                .await;
        }
    }

    /// Whether the topology this monitor belongs to is still in use.
    fn is_alive(&self) -> bool {
        self.topology_watcher.is_alive()
    }

    /// Checks the server once, retrying a failed check a single time if the server was
    /// previously available and the failure was network-related.
    ///
    /// Returns whether the check itself succeeded.
    async fn check_server(&mut self) -> bool {
        let check_result = match self.perform_hello().await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                let previous_description = self.topology_watcher.server_description(&self.address);
                if e.is_network_error()
                    && previous_description
                        .map(|sd| sd.server_type().is_available())
                        .unwrap_or(false)
                {
                    self.handle_error(e).await;
                    self.perform_hello().await
                } else {
                    Err(e)
                }
            }
        };

        match check_result {
            Ok(reply) => {
                let description =
                    ServerDescription::new_from_hello_reply(self.address.clone(), reply);
                self.updater.update(description).await;
                true
            }
            Err(e) => {
                self.handle_error(e).await;
                false
            }
        }
    }

    async fn perform_hello(&mut self) -> Result<HelloReply> {
        self.emit_event(|| {
            SdamEvent::ServerHeartbeatStarted(ServerHeartbeatStartedEvent {
                server_address: self.address.clone(),
                awaited: self.topology_version.is_some(),
            })
        });

        let start = Instant::now();
        let awaited = self.topology_version.is_some();
        let result = match self.connection {
            Some(ref mut conn) => {
                let awaitable_options = self.topology_version.map(|topology_version| {
                    AwaitableHelloOptions {
                        topology_version,
                        max_await_time: self
                            .client_options
                            .heartbeat_freq
                            .unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY),
                    }
                });
                conn.send_hello(awaitable_options).await
            }
            None => {
                let connect = async {
                    let stream = self.connector.connect(&self.address).await?;
                    let mut connection = Connection::new(
                        self.address.clone(),
                        stream,
                        0,
                        self.client_options.connect_timeout,
                    );
                    let reply = connection.handshake().await?;
                    Ok::<_, Error>((connection, reply))
                };
                match connect.await {
                    Ok((connection, reply)) => {
                        self.connection = Some(connection);
                        Ok(reply)
                    }
                    Err(e) => Err(e),
                }
            }
        };

        let duration = start.elapsed();
        match result {
            Ok(ref reply) => {
                self.topology_version = reply.command_response.topology_version;
                self.emit_event(|| {
                    let reply_doc = crate::bson::to_document(&reply.command_response)
                        .unwrap_or_default();
                    SdamEvent::ServerHeartbeatSucceeded(ServerHeartbeatSucceededEvent {
                        duration,
                        reply: reply_doc,
                        server_address: self.address.clone(),
                        awaited,
                    })
                });
            }
            Err(ref e) => {
                // A failed check always gets a fresh connection next time around.
                self.connection.take();
                self.topology_version = None;
                self.emit_event(|| {
                    SdamEvent::ServerHeartbeatFailed(ServerHeartbeatFailedEvent {
                        duration,
                        failure: e.clone(),
                        server_address: self.address.clone(),
                        awaited,
                    })
                });
            }
        }

        result
    }

    async fn handle_error(&mut self, error: Error) -> bool {
        self.updater
            .handle_monitor_error(self.address.clone(), error)
            .await
    }

    fn emit_event(&self, make_event: impl FnOnce() -> SdamEvent) {
        if let Some(ref handler) = self.client_options.sdam_event_handler {
            handler.handle(make_event());
        }
    }
}
