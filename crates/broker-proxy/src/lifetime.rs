//! Blocking the service until it is told to stop, then tearing down.

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

/// A bus connection the controller closes on shutdown.
#[async_trait]
pub trait BusHandle: Send {
    async fn close(self) -> zbus::Result<()>;
}

#[async_trait]
impl BusHandle for zbus::Connection {
    async fn close(self) -> zbus::Result<()> {
        zbus::Connection::close(self).await
    }
}

/// Parks on a cancellation token and closes the connections afterwards.
#[derive(Debug, Clone)]
pub struct LifetimeController {
    token: CancellationToken,
}

impl LifetimeController {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Wait for cancellation, then close `host` followed by `container`.
    ///
    /// Calls still in flight are not aborted; they finish or fail as their
    /// connection goes away underneath them. Close errors are logged only.
    pub async fn run<H: BusHandle, C: BusHandle>(self, host: H, container: C) {
        self.token.cancelled().await;
        info!("broker proxy shutting down");

        if let Err(e) = host.close().await {
            warn!("closing host bus connection: {e}");
        }
        debug!("host bus connection closed");

        if let Err(e) = container.close().await {
            warn!("closing container bus connection: {e}");
        }
        debug!("container bus connection closed");
    }
}
