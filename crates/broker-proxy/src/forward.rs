//! Forwarding of broker calls from the host bus to the container bus.
//!
//! [`Dispatcher`] reads method calls addressed to this connection on the host
//! bus and answers each one on its own task. Broker methods are handed to an
//! [`Upstream`] (in production a [`ContainerBus`]) with the arguments untouched;
//! introspection and `org.freedesktop.DBus.Peer` are answered locally.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, warn};
use tokio::task::JoinHandle;
use zbus::message::{Flags, Header, Type as MessageType};
use zbus::zvariant::ObjectPath;
use zbus::{Connection, Message, MessageStream};

use crate::endpoint::{BrokerEndpoint, BrokerMethod};
use crate::error::{ForwardError, ProxyError, ProxyResult};
use crate::introspect::{self, INTROSPECTABLE_INTERFACE, PEER_INTERFACE};

pub const ERROR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";
pub const ERROR_INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
pub const ERROR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
pub const ERROR_UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
pub const ERROR_UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";

const MACHINE_ID_PATHS: [&str; 2] = ["/etc/machine-id", "/var/lib/dbus/machine-id"];

/// One broker call, exactly as it arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub method: BrokerMethod,
    pub protocol_version: String,
    pub correlation_id: String,
    pub request: String,
}

/// A D-Bus error reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{name}: {message}")]
pub struct Fault {
    pub name: String,
    pub message: String,
}

impl Fault {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Generic `org.freedesktop.DBus.Error.Failed` fault.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ERROR_FAILED, message)
    }
}

impl From<ForwardError> for Fault {
    fn from(err: ForwardError) -> Self {
        Fault::failed(err.to_string())
    }
}

/// The side that actually implements the broker.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Issue `invocation` and return the response payload.
    async fn call(&self, invocation: &Invocation) -> Result<String, ForwardError>;
}

/// Connection to the container's session bus.
#[derive(Debug, Clone)]
pub struct ContainerBus {
    conn: Connection,
    endpoint: BrokerEndpoint,
    call_timeout: Option<Duration>,
}

impl ContainerBus {
    /// Dial `address`, authenticate and register with the container's bus.
    pub async fn connect(
        address: &str,
        endpoint: BrokerEndpoint,
        call_timeout: Option<Duration>,
    ) -> ProxyResult<Self> {
        let dial_error = |source: zbus::Error| ProxyError::ContainerDial {
            address: address.to_string(),
            source,
        };

        let conn = zbus::connection::Builder::address(address)
            .map_err(dial_error)?
            .build()
            .await
            .map_err(dial_error)?;
        debug!("connected to container bus at {address}");

        Ok(Self {
            conn,
            endpoint,
            call_timeout,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

#[async_trait]
impl Upstream for ContainerBus {
    async fn call(&self, invocation: &Invocation) -> Result<String, ForwardError> {
        let body = (
            invocation.protocol_version.as_str(),
            invocation.correlation_id.as_str(),
            invocation.request.as_str(),
        );
        let call = self.conn.call_method(
            Some(self.endpoint.bus_name.as_str()),
            self.endpoint.object_path.as_str(),
            Some(self.endpoint.interface_name.as_str()),
            invocation.method.wire_name(),
            &body,
        );

        let reply = match self.call_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| ForwardError::TimedOut(limit))??,
            None => call.await?,
        };

        let response: String = reply.body().deserialize()?;
        Ok(response)
    }
}

/// Relays invocations to an upstream and turns failures into faults.
pub struct Forwarder<U: ?Sized> {
    upstream: Arc<U>,
}

impl<U: ?Sized> Clone for Forwarder<U> {
    fn clone(&self) -> Self {
        Self {
            upstream: Arc::clone(&self.upstream),
        }
    }
}

impl<U: Upstream + ?Sized> Forwarder<U> {
    pub fn new(upstream: Arc<U>) -> Self {
        Self { upstream }
    }

    /// Forward one invocation. Failures are reported once and never retried.
    pub async fn forward(&self, invocation: Invocation) -> Result<String, Fault> {
        debug!(
            "forwarding {} (correlation id {})",
            invocation.method, invocation.correlation_id
        );
        match self.upstream.call(&invocation).await {
            Ok(response) => Ok(response),
            Err(err) => {
                warn!(
                    "{} failed in container (correlation id {}): {}",
                    invocation.method, invocation.correlation_id, err
                );
                Err(Fault::from(err))
            }
        }
    }
}

/// What an incoming method call resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Target {
    Broker(BrokerMethod),
    Introspect(String),
    Ping,
    MachineId,
    Reject(Fault),
}

/// Route a call by object path, interface and member.
///
/// Calls without an interface are matched on the member name alone.
pub(crate) fn resolve_target(
    endpoint: &BrokerEndpoint,
    path: &str,
    interface: Option<&str>,
    member: &str,
) -> Target {
    let is_object = path == endpoint.object_path;

    match interface {
        Some(INTROSPECTABLE_INTERFACE) | None if member == "Introspect" => {
            if is_object {
                return Target::Introspect(introspect::object_xml(endpoint));
            }
            if let Some(xml) = introspect::ancestor_xml(endpoint, path) {
                return Target::Introspect(xml);
            }
        }
        Some(PEER_INTERFACE) | None if member == "Ping" => return Target::Ping,
        Some(PEER_INTERFACE) | None if member == "GetMachineId" => return Target::MachineId,
        _ => {}
    }

    if !is_object {
        return Target::Reject(Fault::new(
            ERROR_UNKNOWN_OBJECT,
            format!("No such object path '{path}'"),
        ));
    }

    match interface {
        Some(name) if name == endpoint.interface_name => {}
        None => {}
        Some(INTROSPECTABLE_INTERFACE) | Some(PEER_INTERFACE) => {
            return Target::Reject(Fault::new(
                ERROR_UNKNOWN_METHOD,
                format!("Unknown method '{member}'"),
            ));
        }
        Some(other) => {
            return Target::Reject(Fault::new(
                ERROR_UNKNOWN_INTERFACE,
                format!("Unknown interface '{other}'"),
            ));
        }
    }

    match BrokerMethod::from_wire_name(member) {
        Some(method) => Target::Broker(method),
        None => Target::Reject(Fault::new(
            ERROR_UNKNOWN_METHOD,
            format!(
                "Unknown method '{member}' on interface '{}'",
                endpoint.interface_name
            ),
        )),
    }
}

/// Outcome of handling one call.
enum Reply {
    Value(String),
    Empty,
    Fault(Fault),
}

/// Serves the broker object on the host connection.
pub struct Dispatcher<U: ?Sized> {
    host: Connection,
    endpoint: Arc<BrokerEndpoint>,
    forwarder: Forwarder<U>,
}

impl<U: ?Sized> Clone for Dispatcher<U> {
    fn clone(&self) -> Self {
        Self {
            host: self.host.clone(),
            endpoint: Arc::clone(&self.endpoint),
            forwarder: self.forwarder.clone(),
        }
    }
}

impl<U: Upstream + ?Sized + 'static> Dispatcher<U> {
    pub fn new(host: Connection, upstream: Arc<U>, endpoint: BrokerEndpoint) -> Self {
        Self {
            host,
            endpoint: Arc::new(endpoint),
            forwarder: Forwarder::new(upstream),
        }
    }

    /// Start answering calls for the broker object.
    ///
    /// The message stream is attached before this returns, so no call that
    /// arrives after a subsequent name claim can be missed.
    pub fn export(self) -> ProxyResult<Exported> {
        ObjectPath::try_from(self.endpoint.object_path.as_str()).map_err(|e| {
            ProxyError::Export {
                path: self.endpoint.object_path.clone(),
                message: e.to_string(),
            }
        })?;

        let stream = MessageStream::from(&self.host);
        let path = self.endpoint.object_path.clone();
        let task = tokio::spawn(self.serve(stream));
        debug!("exported broker object at {path}");
        Ok(Exported { task })
    }

    async fn serve(self, mut stream: MessageStream) {
        while let Some(item) = stream.next().await {
            let msg = match item {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("reading from host bus: {e}");
                    continue;
                }
            };
            if msg.message_type() != MessageType::MethodCall {
                continue;
            }

            let dispatcher = self.clone();
            tokio::spawn(async move { dispatcher.handle(msg).await });
        }
        debug!("host bus message stream closed");
    }

    async fn handle(&self, msg: Message) {
        let header = msg.header();
        let (Some(path), Some(member)) = (header.path(), header.member()) else {
            return;
        };
        let interface = header.interface().map(|name| name.as_str());

        let target = resolve_target(&self.endpoint, path.as_str(), interface, member.as_str());
        let reply = match target {
            Target::Broker(method) => match msg.body().deserialize::<(String, String, String)>() {
                Ok((protocol_version, correlation_id, request)) => {
                    let invocation = Invocation {
                        method,
                        protocol_version,
                        correlation_id,
                        request,
                    };
                    match self.forwarder.forward(invocation).await {
                        Ok(response) => Reply::Value(response),
                        Err(fault) => Reply::Fault(fault),
                    }
                }
                Err(e) => Reply::Fault(Fault::new(
                    ERROR_INVALID_ARGS,
                    format!("{method} expects (sss): {e}"),
                )),
            },
            Target::Introspect(xml) => Reply::Value(xml),
            Target::Ping => Reply::Empty,
            Target::MachineId => match read_machine_id() {
                Some(id) => Reply::Value(id),
                None => Reply::Fault(Fault::failed("machine id unavailable")),
            },
            Target::Reject(fault) => Reply::Fault(fault),
        };

        if msg.primary_header().flags().contains(Flags::NoReplyExpected) {
            return;
        }
        if let Err(e) = self.send(&header, reply).await {
            warn!("replying to {}: {}", member.as_str(), e);
        }
    }

    async fn send(&self, header: &Header<'_>, reply: Reply) -> zbus::Result<()> {
        match reply {
            Reply::Value(value) => self.host.reply(header, &value).await,
            Reply::Empty => self.host.reply(header, &()).await,
            Reply::Fault(fault) => {
                self.host
                    .reply_error(header, fault.name.as_str(), &fault.message)
                    .await
            }
        }
    }
}

fn read_machine_id() -> Option<String> {
    MACHINE_ID_PATHS.iter().find_map(|path| {
        let id = std::fs::read_to_string(path).ok()?;
        let id = id.trim();
        (!id.is_empty()).then(|| id.to_string())
    })
}

/// Handle to the running dispatch loop.
#[derive(Debug)]
pub struct Exported {
    task: JoinHandle<()>,
}

impl Exported {
    /// Stop reading new calls. Handlers already spawned run to completion.
    pub fn stop(self) {
        self.task.abort();
    }
}
