//! Error types for the broker proxy.

use std::time::Duration;

use thiserror::Error;

/// Result type for proxy startup and lifecycle operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Fatal errors raised while bringing the proxy up.
///
/// Every variant carries enough context (address, bus name, object path) to
/// diagnose the failure from the log line alone.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Could not connect, authenticate or say Hello on the container bus.
    #[error("dial container bus at {address}: {source}")]
    ContainerDial {
        address: String,
        #[source]
        source: zbus::Error,
    },

    /// Could not connect to the host session bus.
    #[error("connect host session bus: {0}")]
    HostDial(#[source] zbus::Error),

    /// The forwarded object could not be exported.
    #[error("export {path}: {message}")]
    Export { path: String, message: String },

    /// The RequestName call itself failed.
    #[error("request bus name {name}: {source}")]
    NameRequest {
        name: String,
        #[source]
        source: zbus::Error,
    },

    /// Another process already owns the well-known name.
    #[error("bus name {0} already owned")]
    AlreadyOwned(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of a single forwarded call on the container connection.
///
/// These never take the process down; the dispatcher turns them into a
/// `org.freedesktop.DBus.Error.Failed` reply for the one caller affected.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Transport failure or an error reply from the upstream broker.
    #[error("{0}")]
    Call(#[from] zbus::Error),

    /// The configured per-call timeout elapsed before the upstream replied.
    #[error("no reply from container broker within {0:?}")]
    TimedOut(Duration),
}
