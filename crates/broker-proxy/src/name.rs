//! Well-known name ownership on the host bus.

use log::info;
use zbus::Connection;
use zbus::fdo::{DBusProxy, RequestNameFlags, RequestNameReply};
use zbus::names::WellKnownName;

use crate::error::{ProxyError, ProxyResult};

/// Claim `bus_name` on `host` without queuing.
///
/// If another connection already owns the name this fails immediately with
/// [`ProxyError::AlreadyOwned`] instead of waiting for the name to free up.
pub async fn claim(host: &Connection, bus_name: &str) -> ProxyResult<()> {
    let request_error = |source: zbus::Error| ProxyError::NameRequest {
        name: bus_name.to_string(),
        source,
    };

    let name = WellKnownName::try_from(bus_name)
        .map_err(zbus::Error::from)
        .map_err(request_error)?;
    let dbus = DBusProxy::new(host).await.map_err(request_error)?;
    let reply = dbus
        .request_name(name, RequestNameFlags::DoNotQueue.into())
        .await
        .map_err(zbus::Error::from)
        .map_err(request_error)?;

    check_reply(bus_name, reply)?;
    info!("acquired bus name {bus_name}");
    Ok(())
}

/// Map a RequestName reply to success or [`ProxyError::AlreadyOwned`].
///
/// `InQueue` cannot happen with `DoNotQueue`; if a bus ever answers with it
/// the name is still not ours, so it is treated the same as `Exists`.
pub fn check_reply(bus_name: &str, reply: RequestNameReply) -> ProxyResult<()> {
    match reply {
        RequestNameReply::PrimaryOwner | RequestNameReply::AlreadyOwner => Ok(()),
        RequestNameReply::Exists | RequestNameReply::InQueue => {
            Err(ProxyError::AlreadyOwned(bus_name.to_string()))
        }
    }
}
