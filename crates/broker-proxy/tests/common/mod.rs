//! Test utilities for tests that need a live session bus.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use broker_proxy::forward::{Exported, Upstream};
use broker_proxy::{BrokerEndpoint, ContainerBus, Dispatcher, ForwardError, Invocation, name};
use zbus::Connection;

/// Request payload that makes [`EchoBroker`] fail the call.
pub const FAIL_REQUEST: &str = "{\"fail\":true}";

/// Session bus address, or `None` when no session bus is available.
pub fn session_address() -> Option<String> {
    std::env::var("DBUS_SESSION_BUS_ADDRESS")
        .ok()
        .filter(|addr| !addr.is_empty())
}

static NEXT_ID: AtomicU32 = AtomicU32::new(0);

/// Endpoint with a bus name no other test in any process uses.
pub fn test_endpoint(role: &str) -> BrokerEndpoint {
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    BrokerEndpoint::new(
        format!("org.brokerproxy.Test.{role}.P{}_{id}", std::process::id()),
        "/org/brokerproxy/Test",
        "org.brokerproxy.Test",
    )
}

/// Stand-in for the container broker: answers every method with a summary of
/// its arguments.
pub struct EchoBroker;

#[async_trait]
impl Upstream for EchoBroker {
    async fn call(&self, invocation: &Invocation) -> Result<String, ForwardError> {
        if invocation.request == FAIL_REQUEST {
            return Err(ForwardError::Call(zbus::Error::Failure(
                "broker rejected request".to_string(),
            )));
        }
        Ok(format!(
            "{}|{}|{}|{}",
            invocation.method, invocation.protocol_version, invocation.correlation_id,
            invocation.request
        ))
    }
}

/// Stand-in for a container broker that never answers.
pub struct HangingBroker;

#[async_trait]
impl Upstream for HangingBroker {
    async fn call(&self, _invocation: &Invocation) -> Result<String, ForwardError> {
        std::future::pending().await
    }
}

/// Export `upstream` under a fresh endpoint on its own session connection.
pub async fn serve_upstream<U: Upstream + 'static>(
    role: &str,
    upstream: U,
) -> (BrokerEndpoint, Exported) {
    let endpoint = test_endpoint(role);
    let conn = Connection::session().await.expect("upstream connection");
    let exported = Dispatcher::new(conn.clone(), Arc::new(upstream), endpoint.clone())
        .export()
        .expect("export upstream");
    name::claim(&conn, &endpoint.bus_name)
        .await
        .expect("claim upstream name");
    (endpoint, exported)
}

/// Whether any connection currently owns `bus_name`.
pub async fn name_has_owner(conn: &Connection, bus_name: &str) -> bool {
    let dbus = zbus::fdo::DBusProxy::new(conn).await.expect("dbus proxy");
    let name = zbus::names::BusName::try_from(bus_name).expect("valid bus name");
    dbus.name_has_owner(name).await.expect("NameHasOwner")
}

/// Poll `name_has_owner` until it reports `expected`, for up to five seconds.
pub async fn wait_for_owner(conn: &Connection, bus_name: &str, expected: bool) -> bool {
    for _ in 0..50 {
        if name_has_owner(conn, bus_name).await == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

/// A fake container broker and a proxy in front of it, both on the session bus.
pub struct Harness {
    pub upstream_endpoint: BrokerEndpoint,
    pub proxy_endpoint: BrokerEndpoint,
    pub client: Connection,
    upstream: Exported,
    proxy: Exported,
}

impl Harness {
    pub async fn start(address: &str) -> Harness {
        let (upstream_endpoint, upstream) = serve_upstream("Upstream", EchoBroker).await;
        let proxy_endpoint = test_endpoint("Proxy");

        let container = ContainerBus::connect(
            address,
            upstream_endpoint.clone(),
            Some(Duration::from_secs(10)),
        )
        .await
        .expect("dial container bus");
        let host = Connection::session().await.expect("host connection");
        let proxy = Dispatcher::new(host.clone(), Arc::new(container), proxy_endpoint.clone())
            .export()
            .expect("export proxy");
        name::claim(&host, &proxy_endpoint.bus_name)
            .await
            .expect("claim proxy name");

        let client = Connection::session().await.expect("client connection");

        Harness {
            upstream_endpoint,
            proxy_endpoint,
            client,
            upstream,
            proxy,
        }
    }

    /// Call a broker method on the proxy.
    pub async fn call(&self, method: &str, args: (&str, &str, &str)) -> zbus::Result<String> {
        let reply = self
            .client
            .call_method(
                Some(self.proxy_endpoint.bus_name.as_str()),
                self.proxy_endpoint.object_path.as_str(),
                Some(self.proxy_endpoint.interface_name.as_str()),
                method,
                &args,
            )
            .await?;
        reply.body().deserialize::<String>()
    }

    pub fn stop(self) {
        self.proxy.stop();
        self.upstream.stop();
    }
}
