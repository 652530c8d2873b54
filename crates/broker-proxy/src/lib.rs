//! Broker proxy library
//!
//! Exposes the identity broker running inside a container on the host session
//! bus. The proxy claims the broker's well-known name on the host, relays
//! every method call unchanged to the container's instance and guards itself
//! with a PID-file lease so other tooling can query and stop it.

pub mod activation;
pub mod address;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod forward;
pub mod introspect;
pub mod lifetime;
pub mod name;
pub mod pidfile;
pub mod service;

pub use address::BusLayout;
pub use endpoint::{BrokerEndpoint, BrokerMethod};
pub use error::{ForwardError, ProxyError, ProxyResult};
pub use forward::{ContainerBus, Dispatcher, Fault, Forwarder, Invocation, Upstream};
pub use lifetime::LifetimeController;
pub use pidfile::{Probe, SingletonLease};
pub use service::{ProxyOptions, run};
