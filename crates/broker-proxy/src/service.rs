//! Startup sequence of the forwarding service.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio_util::sync::CancellationToken;
use zbus::Connection;

use crate::endpoint::BrokerEndpoint;
use crate::error::{ProxyError, ProxyResult};
use crate::forward::{ContainerBus, Dispatcher};
use crate::lifetime::LifetimeController;
use crate::name;

/// Everything the service needs to start.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub endpoint: BrokerEndpoint,
    /// D-Bus address of the container's session bus.
    pub container_address: String,
    /// Per-call timeout on the container side; `None` waits indefinitely.
    pub call_timeout: Option<Duration>,
}

/// Run the proxy until `token` is cancelled.
///
/// Steps run in order and stop at the first failure: dial the container bus,
/// dial the host session bus, export the forwarded object, claim the bus name.
/// Connections opened before a failure are closed before returning.
pub async fn run(options: ProxyOptions, token: CancellationToken) -> ProxyResult<()> {
    let ProxyOptions {
        endpoint,
        container_address,
        call_timeout,
    } = options;

    let container =
        ContainerBus::connect(&container_address, endpoint.clone(), call_timeout).await?;

    let host = match Connection::session().await {
        Ok(conn) => conn,
        Err(e) => {
            close_quietly(container.into_connection()).await;
            return Err(ProxyError::HostDial(e));
        }
    };

    let dispatcher = Dispatcher::new(host.clone(), Arc::new(container.clone()), endpoint.clone());
    let exported = match dispatcher.export() {
        Ok(exported) => exported,
        Err(e) => {
            close_quietly(host).await;
            close_quietly(container.into_connection()).await;
            return Err(e);
        }
    };

    if let Err(e) = name::claim(&host, &endpoint.bus_name).await {
        exported.stop();
        close_quietly(host).await;
        close_quietly(container.into_connection()).await;
        return Err(e);
    }

    info!(
        "broker proxy running: forwarding {} to {}",
        endpoint.bus_name, container_address
    );
    if let Some(limit) = call_timeout {
        info!("forwarded calls time out after {limit:?}");
    }

    LifetimeController::new(token)
        .run(host, container.into_connection())
        .await;
    exported.stop();
    Ok(())
}

async fn close_quietly(conn: Connection) {
    if let Err(e) = conn.close().await {
        warn!("closing bus connection: {e}");
    }
}
