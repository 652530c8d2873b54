//! The forwarded D-Bus surface.
//!
//! `BrokerEndpoint` names the bus name, object path and interface shared by
//! the host and container sides. `BrokerMethod` is the closed set of wire
//! methods; every lookup between handler and wire name goes through the
//! exhaustive matches below.

use std::fmt;
use std::str::FromStr;

/// Well-known name of the identity broker.
pub const BUS_NAME: &str = "com.microsoft.identity.broker1";
/// Object path the broker is exported at.
pub const OBJECT_PATH: &str = "/com/microsoft/identity/broker1";
/// Interface implemented by the broker object.
pub const INTERFACE_NAME: &str = "com.microsoft.identity.Broker1";

/// Argument names used by the upstream broker, in wire order.
pub const IN_ARGS: [&str; 3] = ["protocolVersion", "correlationID", "requestJSON"];
/// Name of the single output argument.
pub const OUT_ARG: &str = "responseJSON";

/// One of the eight methods of the broker interface.
///
/// Every method has the signature `(sss) -> s`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerMethod {
    AcquireTokenInteractively,
    AcquireTokenSilently,
    GetAccounts,
    RemoveAccount,
    AcquirePrtSsoCookie,
    GenerateSignedHttpRequest,
    CancelInteractiveFlow,
    GetLinuxBrokerVersion,
}

impl BrokerMethod {
    /// All methods, in the order the upstream broker declares them.
    pub const ALL: [BrokerMethod; 8] = [
        BrokerMethod::AcquireTokenInteractively,
        BrokerMethod::AcquireTokenSilently,
        BrokerMethod::GetAccounts,
        BrokerMethod::RemoveAccount,
        BrokerMethod::AcquirePrtSsoCookie,
        BrokerMethod::GenerateSignedHttpRequest,
        BrokerMethod::CancelInteractiveFlow,
        BrokerMethod::GetLinuxBrokerVersion,
    ];

    /// Member name on the wire.
    pub fn wire_name(self) -> &'static str {
        match self {
            BrokerMethod::AcquireTokenInteractively => "acquireTokenInteractively",
            BrokerMethod::AcquireTokenSilently => "acquireTokenSilently",
            BrokerMethod::GetAccounts => "getAccounts",
            BrokerMethod::RemoveAccount => "removeAccount",
            BrokerMethod::AcquirePrtSsoCookie => "acquirePrtSsoCookie",
            BrokerMethod::GenerateSignedHttpRequest => "generateSignedHttpRequest",
            BrokerMethod::CancelInteractiveFlow => "cancelInteractiveFlow",
            BrokerMethod::GetLinuxBrokerVersion => "getLinuxBrokerVersion",
        }
    }

    /// Look up a method by its exact (case-sensitive) wire name.
    pub fn from_wire_name(name: &str) -> Option<Self> {
        match name {
            "acquireTokenInteractively" => Some(BrokerMethod::AcquireTokenInteractively),
            "acquireTokenSilently" => Some(BrokerMethod::AcquireTokenSilently),
            "getAccounts" => Some(BrokerMethod::GetAccounts),
            "removeAccount" => Some(BrokerMethod::RemoveAccount),
            "acquirePrtSsoCookie" => Some(BrokerMethod::AcquirePrtSsoCookie),
            "generateSignedHttpRequest" => Some(BrokerMethod::GenerateSignedHttpRequest),
            "cancelInteractiveFlow" => Some(BrokerMethod::CancelInteractiveFlow),
            "getLinuxBrokerVersion" => Some(BrokerMethod::GetLinuxBrokerVersion),
            _ => None,
        }
    }
}

impl fmt::Display for BrokerMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Error returned when parsing an unknown method name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown broker method: {0}")]
pub struct UnknownMethod(pub String);

impl FromStr for BrokerMethod {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_wire_name(s).ok_or_else(|| UnknownMethod(s.to_string()))
    }
}

/// Bus identity of the forwarded service.
///
/// Built once at startup and handed to the components that need it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub bus_name: String,
    pub object_path: String,
    pub interface_name: String,
}

impl BrokerEndpoint {
    pub fn new(
        bus_name: impl Into<String>,
        object_path: impl Into<String>,
        interface_name: impl Into<String>,
    ) -> Self {
        Self {
            bus_name: bus_name.into(),
            object_path: object_path.into(),
            interface_name: interface_name.into(),
        }
    }

    /// The Microsoft identity broker as shipped in the container image.
    pub fn microsoft_identity() -> Self {
        Self::new(BUS_NAME, OBJECT_PATH, INTERFACE_NAME)
    }

    /// Methods forwarded for this endpoint.
    pub fn methods(&self) -> &'static [BrokerMethod] {
        &BrokerMethod::ALL
    }
}

impl Default for BrokerEndpoint {
    fn default() -> Self {
        Self::microsoft_identity()
    }
}
